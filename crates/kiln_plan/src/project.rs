//! Project-wide configuration (`kiln.yaml`) and `project.refs`.

use crate::ConfigMap;
use crate::error::{LoadError, LoadResult};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Project configuration file name
pub const PROJECT_FILE: &str = "kiln.yaml";

/// Ref storage file name
pub const REFS_FILE: &str = "project.refs";

/// Where tracked source references live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefStorage {
    /// In each element's `sources[].ref`
    #[default]
    #[serde(rename = "inline")]
    Inline,
    /// In a project-level `project.refs` file
    #[serde(rename = "project.refs")]
    ProjectRefs,
}

/// Per-kind overrides under `elements:`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct KindOverrides {
    /// Variable overrides
    #[serde(deserialize_with = "crate::descriptor::scalar_map")]
    pub variables: IndexMap<String, String>,
    /// Environment overrides
    #[serde(deserialize_with = "crate::descriptor::scalar_map")]
    pub environment: IndexMap<String, String>,
    /// Environment names excluded from the cache key
    pub environment_nocache: Vec<String>,
    /// Config overrides
    pub config: ConfigMap,
}

/// Contents of `kiln.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project name
    pub name: String,
    /// Directory holding `*.kiln` files, relative to the project root
    pub element_path: String,
    /// Project variables, layered over the built-in defaults
    #[serde(deserialize_with = "crate::descriptor::scalar_map")]
    pub variables: IndexMap<String, String>,
    /// Project environment, layered over the built-in defaults
    #[serde(deserialize_with = "crate::descriptor::scalar_map")]
    pub environment: IndexMap<String, String>,
    /// Environment names excluded from the cache key
    pub environment_nocache: Vec<String>,
    /// Split domains: domain name to path globs
    pub split_rules: IndexMap<String, Vec<String>>,
    /// Per-kind overrides
    pub elements: IndexMap<String, KindOverrides>,
    /// Ref storage policy
    pub ref_storage: RefStorage,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            element_path: "elements".to_string(),
            variables: IndexMap::new(),
            environment: IndexMap::new(),
            environment_nocache: Vec::new(),
            split_rules: IndexMap::new(),
            elements: IndexMap::new(),
            ref_storage: RefStorage::Inline,
        }
    }
}

impl ProjectConfig {
    /// Create a named project with default settings
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Read `kiln.yaml` from a project directory
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or malformed
    pub fn load(project_dir: &Path) -> LoadResult<Self> {
        let path = project_dir.join(PROJECT_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| LoadError::io(&path, e))?;
        Self::from_yaml(&text).map_err(|e| LoadError::InvalidDocument {
            file: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a `kiln.yaml` document
    ///
    /// # Errors
    ///
    /// Returns error if the YAML is malformed
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Set the ref storage policy
    #[must_use]
    pub fn with_ref_storage(mut self, storage: RefStorage) -> Self {
        self.ref_storage = storage;
        self
    }

    /// Set a project variable
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Set a project environment entry
    #[must_use]
    pub fn with_environment(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Overrides for one kind, if any
    #[must_use]
    pub fn kind_overrides(&self, kind: &str) -> Option<&KindOverrides> {
        self.elements.get(kind)
    }

    /// Split rules with the built-in domains underneath
    #[must_use]
    pub fn effective_split_rules(&self) -> IndexMap<String, Vec<String>> {
        let mut rules = builtin_split_rules();
        for (domain, globs) in &self.split_rules {
            rules.insert(domain.clone(), globs.clone());
        }
        rules
    }
}

/// Host parallelism, used for `max-jobs`
#[must_use]
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Variables every element starts from
#[must_use]
pub fn builtin_variables() -> IndexMap<String, String> {
    let pairs = [
        ("prefix", "/usr".to_string()),
        ("exec_prefix", "%{prefix}".to_string()),
        ("bindir", "%{exec_prefix}/bin".to_string()),
        ("sbindir", "%{exec_prefix}/sbin".to_string()),
        ("libexecdir", "%{exec_prefix}/libexec".to_string()),
        ("libdir", "%{prefix}/lib".to_string()),
        ("includedir", "%{prefix}/include".to_string()),
        ("datadir", "%{prefix}/share".to_string()),
        ("sysconfdir", "/etc".to_string()),
        ("localstatedir", "/var".to_string()),
        ("docdir", "%{datadir}/doc".to_string()),
        ("mandir", "%{datadir}/man".to_string()),
        ("build-root", "/kiln/build".to_string()),
        ("install-root", "/kiln/install".to_string()),
        ("max-jobs", host_parallelism().to_string()),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Environment every element starts from
#[must_use]
pub fn builtin_environment() -> IndexMap<String, String> {
    [
        ("PATH", "/usr/bin:/bin:/usr/sbin:/sbin"),
        ("SHELL", "/bin/sh"),
        ("TERM", "dumb"),
        ("LC_ALL", "C"),
        ("MAKEFLAGS", "-j%{max-jobs}"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Environment names never folded into cache keys
#[must_use]
pub fn builtin_environment_nocache() -> IndexSet<String> {
    ["MAKEFLAGS"].into_iter().map(str::to_string).collect()
}

/// Split domains available in every project
#[must_use]
pub fn builtin_split_rules() -> IndexMap<String, Vec<String>> {
    let rules: [(&str, &[&str]); 4] = [
        (
            "runtime",
            &[
                "%{bindir}",
                "%{bindir}/**",
                "%{sbindir}/**",
                "%{libexecdir}/**",
                "%{libdir}/lib*.so*",
            ],
        ),
        (
            "devel",
            &[
                "%{includedir}/**",
                "%{libdir}/lib*.a",
                "%{libdir}/lib*.so",
                "%{libdir}/pkgconfig/**",
                "%{datadir}/aclocal/**",
            ],
        ),
        (
            "doc",
            &["%{docdir}/**", "%{mandir}/**", "%{datadir}/info/**"],
        ),
        ("locale", &["%{datadir}/locale/**"]),
    ];
    rules
        .into_iter()
        .map(|(domain, globs)| {
            (
                domain.to_string(),
                globs.iter().map(|g| (*g).to_string()).collect(),
            )
        })
        .collect()
}

/// Source references stored outside element documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectRefs {
    refs: BTreeMap<String, Vec<Option<String>>>,
}

impl ProjectRefs {
    /// Read `project.refs`; a missing file is an empty table
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(project_dir: &Path) -> LoadResult<Self> {
        let path = project_dir.join(REFS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str(&text).map_err(|e| LoadError::InvalidDocument {
                file: path.display().to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(LoadError::io(&path, e)),
        }
    }

    /// Write `project.refs`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, project_dir: &Path) -> LoadResult<()> {
        let path = project_dir.join(REFS_FILE);
        let text = serde_yaml::to_string(self).map_err(|e| LoadError::InvalidDocument {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, text).map_err(|e| LoadError::io(&path, e))
    }

    /// Reference for one source of an element
    #[must_use]
    pub fn get(&self, element: &str, index: usize) -> Option<&str> {
        self.refs
            .get(element)
            .and_then(|refs| refs.get(index))
            .and_then(|r| r.as_deref())
    }

    /// Record a reference, growing the element's list as needed
    pub fn set(&mut self, element: &str, index: usize, reference: impl Into<String>) {
        let refs = self.refs.entry(element.to_string()).or_default();
        if refs.len() <= index {
            refs.resize(index + 1, None);
        }
        refs[index] = Some(reference.into());
    }

    /// Whether no references are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_defaults() {
        let config = ProjectConfig::from_yaml("name: demo\n").unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.element_path, "elements");
        assert_eq!(config.ref_storage, RefStorage::Inline);
    }

    #[test]
    fn test_project_full() {
        let yaml = r#"
name: demo
element-path: elems
ref-storage: project.refs
variables:
  prefix: /opt
environment-nocache: [CCACHE_DIR]
split-rules:
  extra: ["%{prefix}/extra/**"]
elements:
  autotools:
    variables:
      conf-args: --disable-nls
"#;
        let config = ProjectConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.element_path, "elems");
        assert_eq!(config.ref_storage, RefStorage::ProjectRefs);
        assert_eq!(
            config.kind_overrides("autotools").unwrap().variables["conf-args"],
            "--disable-nls"
        );
        let rules = config.effective_split_rules();
        assert!(rules.contains_key("runtime"));
        assert!(rules.contains_key("extra"));
    }

    #[test]
    fn test_builtin_tables() {
        let vars = builtin_variables();
        assert_eq!(vars["prefix"], "/usr");
        assert!(vars.contains_key("max-jobs"));
        assert!(builtin_environment_nocache().contains("MAKEFLAGS"));
    }

    #[test]
    fn test_refs_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectRefs::load(dir.path()).unwrap().is_empty());

        let mut refs = ProjectRefs::default();
        refs.set("base/alpine", 1, "deadbeef");
        refs.save(dir.path()).unwrap();

        let loaded = ProjectRefs::load(dir.path()).unwrap();
        assert_eq!(loaded.get("base/alpine", 0), None);
        assert_eq!(loaded.get("base/alpine", 1), Some("deadbeef"));
    }
}
