//! Element kinds.
//!
//! A kind turns an element's expanded config into command groups and
//! decides where sources are staged and where output is collected. Kinds
//! are looked up once at load time through a [`KindRegistry`].

use crate::ConfigMap;
use crate::variables::Variables;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// A named, ordered list of shell commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandGroup {
    /// Group name, e.g. `build-commands`
    pub name: String,
    /// Commands, run in order
    pub commands: Vec<String>,
}

/// A kind rejected an element's config
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{key}': {reason}")]
pub struct KindConfigError {
    /// Offending config key
    pub key: String,
    /// Why it was rejected
    pub reason: String,
}

impl KindConfigError {
    fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Capability interface implemented by every element kind
pub trait ElementKind: Send + Sync + Debug {
    /// Kind identifier as written in descriptors
    fn name(&self) -> &str;

    /// Bumped whenever the kind's output for the same input changes
    fn version(&self) -> u32;

    /// Variables layered over the built-in ones for this kind
    fn default_variables(&self) -> IndexMap<String, String> {
        IndexMap::new()
    }

    /// Config layered underneath everything else for this kind
    fn default_config(&self) -> ConfigMap {
        ConfigMap::new()
    }

    /// Check an expanded config
    ///
    /// # Errors
    ///
    /// Returns error if the config is not usable by this kind
    fn validate(&self, config: &ConfigMap) -> Result<(), KindConfigError>;

    /// Commands to run in the sandbox, in order
    fn produce_commands(&self, config: &ConfigMap) -> Vec<CommandGroup>;

    /// Directory sources are staged into
    fn source_directory(&self, _config: &ConfigMap, vars: &Variables) -> String {
        vars.get("build-root").unwrap_or("/kiln/build").to_string()
    }

    /// Directory collected as the element's output
    fn output_directory(&self, _config: &ConfigMap, vars: &Variables) -> String {
        vars.get("install-root").unwrap_or("/kiln/install").to_string()
    }
}

/// Everything the sandbox needs to build one element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Command groups in execution order
    pub commands: Vec<CommandGroup>,
    /// Expanded environment
    pub environment: IndexMap<String, String>,
    /// Where sources are staged
    pub source_directory: String,
    /// What is collected afterwards
    pub output_directory: String,
}

impl BuildPlan {
    /// Whether there is nothing to execute
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.iter().all(|g| g.commands.is_empty())
    }
}

/// Command group names understood by `manual` and `autotools`
pub const COMMAND_GROUPS: [&str; 4] = [
    "configure-commands",
    "build-commands",
    "install-commands",
    "strip-commands",
];

fn command_groups(config: &ConfigMap) -> Vec<CommandGroup> {
    COMMAND_GROUPS
        .iter()
        .filter_map(|group| {
            let commands: Vec<String> = config
                .get(*group)?
                .as_array()?
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
            Some(CommandGroup {
                name: (*group).to_string(),
                commands,
            })
        })
        .collect()
}

fn validate_command_groups(config: &ConfigMap) -> Result<(), KindConfigError> {
    for (key, value) in config {
        if !COMMAND_GROUPS.contains(&key.as_str()) {
            return Err(KindConfigError::new(key, "unknown config key"));
        }
        let valid = value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !valid {
            return Err(KindConfigError::new(key, "expected a list of commands"));
        }
    }
    Ok(())
}

/// Stages sources and collects them unchanged
#[derive(Debug, Default)]
pub struct ImportKind;

impl ElementKind for ImportKind {
    fn name(&self) -> &str {
        "import"
    }

    fn version(&self) -> u32 {
        1
    }

    fn validate(&self, config: &ConfigMap) -> Result<(), KindConfigError> {
        for (key, value) in config {
            match key.as_str() {
                "source" if value.is_string() => {}
                "source" => return Err(KindConfigError::new(key, "expected a path")),
                _ => return Err(KindConfigError::new(key, "unknown config key")),
            }
        }
        Ok(())
    }

    fn produce_commands(&self, _config: &ConfigMap) -> Vec<CommandGroup> {
        Vec::new()
    }

    fn output_directory(&self, config: &ConfigMap, vars: &Variables) -> String {
        let root = self.source_directory(config, vars);
        match config.get("source").and_then(Value::as_str) {
            Some(sub) if !sub.trim_matches('/').is_empty() => {
                format!("{}/{}", root.trim_end_matches('/'), sub.trim_matches('/'))
            }
            _ => root,
        }
    }
}

/// Runs the command groups given in config
#[derive(Debug, Default)]
pub struct ManualKind;

impl ElementKind for ManualKind {
    fn name(&self) -> &str {
        "manual"
    }

    fn version(&self) -> u32 {
        1
    }

    fn validate(&self, config: &ConfigMap) -> Result<(), KindConfigError> {
        validate_command_groups(config)
    }

    fn produce_commands(&self, config: &ConfigMap) -> Vec<CommandGroup> {
        command_groups(config)
    }
}

/// `configure && make && make install`, overridable per group
#[derive(Debug, Default)]
pub struct AutotoolsKind;

impl ElementKind for AutotoolsKind {
    fn name(&self) -> &str {
        "autotools"
    }

    fn version(&self) -> u32 {
        1
    }

    fn default_variables(&self) -> IndexMap<String, String> {
        let mut vars = IndexMap::new();
        vars.insert("conf-args".to_string(), String::new());
        vars
    }

    fn default_config(&self) -> ConfigMap {
        let defaults = serde_json::json!({
            "configure-commands": [
                "./configure --prefix=%{prefix} --bindir=%{bindir} --libdir=%{libdir} \
                 --includedir=%{includedir} --datadir=%{datadir} %{conf-args}"
            ],
            "build-commands": ["make"],
            "install-commands": ["make -j1 DESTDIR=\"%{install-root}\" install"],
            "strip-commands": [],
        });
        match defaults {
            Value::Object(map) => map,
            _ => ConfigMap::new(),
        }
    }

    fn validate(&self, config: &ConfigMap) -> Result<(), KindConfigError> {
        validate_command_groups(config)
    }

    fn produce_commands(&self, config: &ConfigMap) -> Vec<CommandGroup> {
        command_groups(config)
    }
}

/// Aggregates its runtime dependencies; produces an empty artifact
#[derive(Debug, Default)]
pub struct StackKind;

impl ElementKind for StackKind {
    fn name(&self) -> &str {
        "stack"
    }

    fn version(&self) -> u32 {
        1
    }

    fn validate(&self, config: &ConfigMap) -> Result<(), KindConfigError> {
        match config.keys().next() {
            Some(key) => Err(KindConfigError::new(key, "stack elements take no config")),
            None => Ok(()),
        }
    }

    fn produce_commands(&self, _config: &ConfigMap) -> Vec<CommandGroup> {
        Vec::new()
    }
}

/// Kinds available to the loader
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: IndexMap<String, Arc<dyn ElementKind>>,
}

impl KindRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `import`, `manual`, `autotools` and `stack`
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ImportKind));
        registry.register(Arc::new(ManualKind));
        registry.register(Arc::new(AutotoolsKind));
        registry.register(Arc::new(StackKind));
        registry
    }

    /// Add or replace a kind
    pub fn register(&mut self, kind: Arc<dyn ElementKind>) {
        self.kinds.insert(kind.name().to_string(), kind);
    }

    /// Look up a kind
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ElementKind>> {
        self.kinds.get(name).cloned()
    }

    /// Registered kind names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}
