//! Descriptor store and composition.
//!
//! Composition layers, later wins and maps merge deeply:
//! built-in defaults, kind defaults, project, per-kind project overrides,
//! the element itself, then its active variant.

use crate::ConfigMap;
use crate::descriptor::{DependencySpec, ElementDescriptor, SourceSpec};
use crate::error::{LoadError, LoadResult};
use crate::kind::{ElementKind, KindRegistry};
use crate::project::{
    ProjectConfig, ProjectRefs, RefStorage, builtin_environment, builtin_environment_nocache,
    builtin_variables,
};
use crate::variables::Variables;
use indexmap::{IndexMap, IndexSet};
use kiln_core::ElementId;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// File extension of element documents
pub const ELEMENT_EXTENSION: &str = "kiln";

/// An element with one variant applied and every layer merged and expanded
#[derive(Debug, Clone)]
pub struct ComposedElement {
    /// Name and active variant
    pub id: ElementId,
    /// Resolved kind
    pub kind: Arc<dyn ElementKind>,
    /// Free text
    pub description: String,
    /// Declared dependencies, variant dependencies appended
    pub dependencies: Vec<DependencySpec>,
    /// Sources with locations expanded and stored refs applied
    pub sources: Vec<SourceSpec>,
    /// Resolved variables
    pub variables: Variables,
    /// Expanded environment
    pub environment: IndexMap<String, String>,
    /// Environment names excluded from the cache key
    pub environment_nocache: IndexSet<String>,
    /// Expanded, validated config
    pub config: ConfigMap,
    /// Expanded public data
    pub public: ConfigMap,
    /// Whether weak keys follow dependency changes
    pub strict_rebuild: bool,
}

/// All element descriptors of one project
#[derive(Debug, Clone, Default)]
pub struct DescriptorStore {
    root: Option<PathBuf>,
    project: ProjectConfig,
    refs: ProjectRefs,
    descriptors: IndexMap<String, ElementDescriptor>,
}

impl DescriptorStore {
    /// An empty store for a project
    #[must_use]
    pub fn new(project: ProjectConfig) -> Self {
        Self {
            root: None,
            project,
            refs: ProjectRefs::default(),
            descriptors: IndexMap::new(),
        }
    }

    /// Build a store from in-memory descriptors
    ///
    /// # Errors
    ///
    /// Returns error on duplicate or malformed descriptors
    pub fn from_descriptors(
        project: ProjectConfig,
        descriptors: impl IntoIterator<Item = ElementDescriptor>,
    ) -> LoadResult<Self> {
        let mut store = Self::new(project);
        for descriptor in descriptors {
            store.insert(descriptor)?;
        }
        Ok(store)
    }

    /// Read `kiln.yaml`, `project.refs` and every `*.kiln` under the element path
    ///
    /// # Errors
    ///
    /// Returns error if any file is unreadable or malformed
    pub fn open(project_dir: &Path) -> LoadResult<Self> {
        let project = ProjectConfig::load(project_dir)?;
        let refs = ProjectRefs::load(project_dir)?;
        let element_dir = project_dir.join(&project.element_path);

        let mut store = Self::new(project);
        store.root = Some(project_dir.to_path_buf());
        store.refs = refs;

        for entry in WalkDir::new(&element_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| element_dir.clone(), Path::to_path_buf);
                LoadError::io(path, e.into())
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(ELEMENT_EXTENSION)
            {
                continue;
            }

            let name = element_name(&element_dir, path);
            let text = std::fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
            let descriptor =
                ElementDescriptor::from_yaml(name, &text).map_err(|e| LoadError::InvalidDocument {
                    file: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            store.insert(descriptor)?;
        }

        debug!(
            project = %store.project.name,
            elements = store.descriptors.len(),
            "loaded descriptors"
        );
        Ok(store)
    }

    /// Add a descriptor
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the descriptor is malformed
    pub fn insert(&mut self, descriptor: ElementDescriptor) -> LoadResult<()> {
        let invalid = |reason: String| LoadError::InvalidDocument {
            file: descriptor.name.clone(),
            reason,
        };

        let id = ElementId::parse(&descriptor.name).map_err(|e| invalid(e.to_string()))?;
        if id.variant().is_some() {
            return Err(invalid("element names cannot contain ':'".to_string()));
        }
        if descriptor.kind.is_empty() {
            return Err(invalid("missing 'kind'".to_string()));
        }
        let mut seen = IndexSet::new();
        for variant in &descriptor.variants {
            ElementId::parse(&variant.variant).map_err(|e| invalid(e.to_string()))?;
            if !seen.insert(variant.variant.as_str()) {
                return Err(invalid(format!("variant '{}' declared twice", variant.variant)));
            }
        }

        if self.descriptors.contains_key(&descriptor.name) {
            return Err(LoadError::Duplicate {
                element: descriptor.name,
            });
        }
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Set the directory `project.refs` is written to
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Look up a descriptor
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ElementDescriptor> {
        self.descriptors.get(name)
    }

    /// Element names in load order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    /// Number of descriptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Project configuration
    #[must_use]
    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    /// Project directory, when opened from disk
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Stored refs
    #[must_use]
    pub fn refs(&self) -> &ProjectRefs {
        &self.refs
    }

    /// Record a tracked reference for one source of an element
    ///
    /// # Errors
    ///
    /// Returns error if the element or source does not exist
    pub fn set_source_ref(&mut self, element: &str, index: usize, reference: &str) -> LoadResult<()> {
        let descriptor = self
            .descriptors
            .get_mut(element)
            .ok_or_else(|| LoadError::MissingElement {
                element: element.to_string(),
                requested_by: "track".to_string(),
            })?;
        let source = descriptor
            .sources
            .get_mut(index)
            .ok_or_else(|| LoadError::InvalidDocument {
                file: element.to_string(),
                reason: format!("no source at index {}", index),
            })?;

        match self.project.ref_storage {
            RefStorage::Inline => source.reference = Some(reference.to_string()),
            RefStorage::ProjectRefs => self.refs.set(element, index, reference),
        }
        Ok(())
    }

    /// Write `project.refs` if the project stores refs there
    ///
    /// Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save_refs(&self) -> LoadResult<bool> {
        match (self.project.ref_storage, &self.root) {
            (RefStorage::ProjectRefs, Some(root)) => {
                self.refs.save(root)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Dependencies of `name` with `variant` active
    ///
    /// # Errors
    ///
    /// Returns error if the element or variant is unknown
    pub fn dependencies_for(&self, name: &str, variant: Option<&str>) -> LoadResult<Vec<DependencySpec>> {
        let descriptor = self.require(name, name)?;
        if let Some(v) = variant {
            require_variant(descriptor, v, name)?;
        }
        Ok(descriptor.dependencies(variant))
    }

    /// Look up a descriptor, naming the requester on failure
    ///
    /// # Errors
    ///
    /// Returns error if the element does not exist
    pub fn require(&self, name: &str, requested_by: &str) -> LoadResult<&ElementDescriptor> {
        self.get(name).ok_or_else(|| LoadError::MissingElement {
            element: name.to_string(),
            requested_by: requested_by.to_string(),
        })
    }

    /// Compose one element with one variant
    ///
    /// # Errors
    ///
    /// Returns error on unknown kinds or variants, illegal overrides,
    /// variable errors and configs the kind rejects
    pub fn compose(
        &self,
        name: &str,
        variant: Option<&str>,
        kinds: &KindRegistry,
    ) -> LoadResult<ComposedElement> {
        let descriptor = self.require(name, name)?;
        let variant_spec = match variant {
            Some(v) => Some(require_variant(descriptor, v, name)?),
            None => None,
        };
        let kind = kinds.get(&descriptor.kind).ok_or_else(|| LoadError::UnknownKind {
            element: name.to_string(),
            kind: descriptor.kind.clone(),
        })?;
        let overrides = self.project.kind_overrides(&descriptor.kind);
        let var_err = |source| LoadError::Variable {
            element: name.to_string(),
            source,
        };

        let mut raw_vars = builtin_variables();
        layer(&mut raw_vars, &kind.default_variables());
        layer(&mut raw_vars, &self.project.variables);
        if let Some(o) = overrides {
            layer(&mut raw_vars, &o.variables);
        }
        layer(&mut raw_vars, &descriptor.variables);
        if let Some(v) = variant_spec {
            layer(&mut raw_vars, &v.variables);
        }
        raw_vars.insert("element-name".to_string(), name.to_string());
        if raw_vars.get("notparallel").map(String::as_str) == Some("true") {
            raw_vars.insert("max-jobs".to_string(), "1".to_string());
        }
        let variables = Variables::resolve(&raw_vars).map_err(var_err)?;

        let mut raw_env = builtin_environment();
        layer(&mut raw_env, &self.project.environment);
        if let Some(o) = overrides {
            layer(&mut raw_env, &o.environment);
        }
        layer(&mut raw_env, &descriptor.environment);
        if let Some(v) = variant_spec {
            layer(&mut raw_env, &v.environment);
        }
        let environment = raw_env
            .iter()
            .map(|(k, v)| variables.subst(v).map(|value| (k.clone(), value)))
            .collect::<Result<IndexMap<_, _>, _>>()
            .map_err(var_err)?;

        let mut environment_nocache = builtin_environment_nocache();
        environment_nocache.extend(self.project.environment_nocache.iter().cloned());
        if let Some(o) = overrides {
            environment_nocache.extend(o.environment_nocache.iter().cloned());
        }
        environment_nocache.extend(descriptor.environment_nocache.iter().cloned());
        if let Some(v) = variant_spec {
            environment_nocache.extend(v.environment_nocache.iter().cloned());
        }

        let mut config = kind.default_config();
        if let Some(o) = overrides {
            merge_config(&mut config, &o.config, name, "")?;
        }
        merge_config(&mut config, &descriptor.config, name, "")?;
        if let Some(v) = variant_spec {
            merge_config(&mut config, &v.config, name, "")?;
        }
        let config = variables.subst_map(&config).map_err(var_err)?;
        kind.validate(&config).map_err(|e| LoadError::InvalidConfig {
            element: name.to_string(),
            reason: e.to_string(),
        })?;

        let public = variables.subst_map(&descriptor.public).map_err(var_err)?;

        let mut sources = Vec::with_capacity(descriptor.sources.len());
        for (index, source) in descriptor.sources.iter().enumerate() {
            let mut source = source.clone();
            source.location = variables.subst(&source.location).map_err(var_err)?;
            if self.project.ref_storage == RefStorage::ProjectRefs {
                source.reference = self.refs.get(name, index).map(str::to_string);
            }
            sources.push(source);
        }

        let id = match variant {
            Some(v) => ElementId::with_variant(name, v),
            None => ElementId::new(name),
        };

        Ok(ComposedElement {
            id,
            kind,
            description: descriptor.description.clone(),
            dependencies: descriptor.dependencies(variant),
            sources,
            variables,
            environment,
            environment_nocache,
            config,
            public,
            strict_rebuild: descriptor.strict_rebuild,
        })
    }
}

fn require_variant<'a>(
    descriptor: &'a ElementDescriptor,
    variant: &str,
    requested_by: &str,
) -> LoadResult<&'a crate::descriptor::VariantSpec> {
    descriptor
        .variant(variant)
        .ok_or_else(|| LoadError::UnknownVariant {
            element: descriptor.name.clone(),
            variant: variant.to_string(),
            requested_by: requested_by.to_string(),
        })
}

/// Element name for a document: path below the element dir, no extension
fn element_name(element_dir: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(element_dir).unwrap_or(path).with_extension("");
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn layer(base: &mut IndexMap<String, String>, top: &IndexMap<String, String>) {
    for (k, v) in top {
        base.insert(k.clone(), v.clone());
    }
}

/// Merge `top` into `base`; maps merge, everything else is replaced
fn merge_config(base: &mut ConfigMap, top: &ConfigMap, element: &str, prefix: &str) -> LoadResult<()> {
    for (key, value) in top {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_config(existing, incoming, element, &path)?;
            }
            (Some(existing), incoming) if shape(existing) != shape(incoming) => {
                return Err(LoadError::IllegalComposite {
                    element: element.to_string(),
                    key: path,
                    reason: format!(
                        "cannot replace a {} with a {}",
                        shape(existing),
                        shape(incoming)
                    ),
                });
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "map",
        Value::Array(_) => "list",
        _ => "scalar",
    }
}
