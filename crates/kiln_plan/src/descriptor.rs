//! Element descriptors as declared in `*.kiln` documents.
//!
//! Descriptors are pure data. Composition with project defaults happens in
//! [`crate::store`]; variant choice happens in [`crate::resolve`].

use crate::ConfigMap;
use indexmap::IndexMap;
use kiln_core::ElementId;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Which relationship a dependency edge expresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed to produce the dependent's output
    Build,
    /// Needed for the dependent to function
    Runtime,
    /// Both build and runtime
    #[default]
    All,
}

impl DependencyKind {
    /// Whether the edge takes part in building
    #[must_use]
    pub const fn is_build(self) -> bool {
        matches!(self, Self::Build | Self::All)
    }

    /// Whether the edge takes part in the runtime closure
    #[must_use]
    pub const fn is_runtime(self) -> bool {
        matches!(self, Self::Runtime | Self::All)
    }

    /// Combine two edges to the same element
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::Build, Self::Build) => Self::Build,
            (Self::Runtime, Self::Runtime) => Self::Runtime,
            _ => Self::All,
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::All => "all",
        };
        write!(f, "{}", s)
    }
}

/// A declared reference to another element
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySpec {
    /// Referenced element name
    pub element: String,
    /// Edge kind
    pub kind: DependencyKind,
    /// Explicitly requested variant
    pub variant: Option<String>,
    /// Fold this dependency's key into the dependent's key even if runtime-only
    pub cache_significant: bool,
}

impl DependencySpec {
    /// A plain dependency of the given kind
    #[must_use]
    pub fn new(element: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            element: element.into(),
            kind,
            variant: None,
            cache_significant: false,
        }
    }

    /// Request a specific variant
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Mark as cache-significant
    #[must_use]
    pub fn with_cache_significant(mut self, significant: bool) -> Self {
        self.cache_significant = significant;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Short(String),
    Full(FullDependency),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FullDependency {
    element: String,
    #[serde(rename = "type", default)]
    kind: DependencyKind,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    cache: bool,
}

impl<'de> Deserialize<'de> for DependencySpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawDependency::deserialize(deserializer)? {
            // `name` or `name:variant`
            RawDependency::Short(s) => {
                let id = ElementId::parse(&s).map_err(serde::de::Error::custom)?;
                Ok(Self {
                    element: id.name().to_string(),
                    kind: DependencyKind::All,
                    variant: id.variant().map(str::to_string),
                    cache_significant: false,
                })
            }
            RawDependency::Full(full) => Ok(Self {
                element: full.element,
                kind: full.kind,
                variant: full.variant,
                cache_significant: full.cache,
            }),
        }
    }
}

/// A declared source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Source plugin name
    pub kind: String,
    /// Where to get it (URL, path)
    #[serde(default)]
    pub location: String,
    /// Concrete pinned revision; absent means floating
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Floating tracking target (branch, tag)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// Subdirectory of the source root to stage into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Plugin specific settings
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SourceSpec {
    /// A floating source
    #[must_use]
    pub fn new(kind: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
            reference: None,
            track: None,
            directory: None,
            extra: BTreeMap::new(),
        }
    }

    /// Pin to a reference
    #[must_use]
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Whether this source has a concrete reference
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.reference.is_some()
    }
}

/// One named alternative configuration of an element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct VariantSpec {
    /// Variant name
    pub variant: String,
    /// Variable overrides
    #[serde(deserialize_with = "scalar_map")]
    pub variables: IndexMap<String, String>,
    /// Environment overrides
    #[serde(deserialize_with = "scalar_map")]
    pub environment: IndexMap<String, String>,
    /// Extra environment names excluded from the cache key
    pub environment_nocache: Vec<String>,
    /// Config overrides
    pub config: ConfigMap,
    /// Dependencies appended when this variant is active
    pub depends: Vec<DependencySpec>,
}

/// A parsed element document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ElementDescriptor {
    /// Element name, derived from the file path
    #[serde(skip)]
    pub name: String,
    /// Element kind identifier
    pub kind: String,
    /// Free text
    pub description: String,
    /// Dependencies, default kind `all`
    pub depends: Vec<DependencySpec>,
    /// Shorthand for build-only dependencies
    pub build_depends: Vec<DependencySpec>,
    /// Shorthand for runtime-only dependencies
    pub runtime_depends: Vec<DependencySpec>,
    /// Ordered sources
    pub sources: Vec<SourceSpec>,
    /// Kind configuration
    pub config: ConfigMap,
    /// Variable overrides
    #[serde(deserialize_with = "scalar_map")]
    pub variables: IndexMap<String, String>,
    /// Environment overrides
    #[serde(deserialize_with = "scalar_map")]
    pub environment: IndexMap<String, String>,
    /// Environment names excluded from the cache key
    pub environment_nocache: Vec<String>,
    /// Metadata for downstream consumers
    pub public: ConfigMap,
    /// Alternative configurations; the first is the default
    pub variants: Vec<VariantSpec>,
    /// Rebuild whenever a dependency changes, even in non-strict mode
    pub strict_rebuild: bool,
}

impl ElementDescriptor {
    /// Parse a descriptor document
    ///
    /// # Errors
    ///
    /// Returns error if the YAML is malformed
    pub fn from_yaml(name: impl Into<String>, yaml: &str) -> Result<Self, serde_yaml::Error> {
        let mut descriptor: Self = serde_yaml::from_str(yaml)?;
        descriptor.name = name.into();
        Ok(descriptor)
    }

    /// Name of the default variant, if any variants are declared
    #[must_use]
    pub fn default_variant(&self) -> Option<&str> {
        self.variants.first().map(|v| v.variant.as_str())
    }

    /// Look up a declared variant
    #[must_use]
    pub fn variant(&self, name: &str) -> Option<&VariantSpec> {
        self.variants.iter().find(|v| v.variant == name)
    }

    /// Whether any variants are declared
    #[must_use]
    pub fn has_variants(&self) -> bool {
        !self.variants.is_empty()
    }

    /// All dependencies with `variant` active, shorthands folded in
    #[must_use]
    pub fn dependencies(&self, variant: Option<&str>) -> Vec<DependencySpec> {
        let mut deps = self.depends.clone();
        deps.extend(self.build_depends.iter().cloned().map(|mut d| {
            d.kind = DependencyKind::Build;
            d
        }));
        deps.extend(self.runtime_depends.iter().cloned().map(|mut d| {
            d.kind = DependencyKind::Runtime;
            d
        }));
        if let Some(spec) = variant.and_then(|v| self.variant(v)) {
            deps.extend(spec.depends.iter().cloned());
        }
        deps
    }
}

/// Accept scalar YAML values (`true`, `4`, `"x"`) as strings
pub(crate) fn scalar_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IndexMap<String, String>, D::Error> {
    let raw = IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "'{}' must be a scalar, found {}",
                        k, other
                    )));
                }
            };
            Ok((k, s))
        })
        .collect()
}
