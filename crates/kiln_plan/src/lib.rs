//! KILN Planner
//!
//! Loads element descriptors, composes them with project defaults,
//! resolves one variant per element and produces the deduplicated
//! dependency DAG that keys and schedules are computed over.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dag;
pub mod descriptor;
pub mod error;
pub mod kind;
pub mod project;
pub mod resolve;
pub mod select;
pub mod splits;
pub mod store;
pub mod variables;

pub use dag::{DependencyEdge, ElementGraph, ResolvedElement, Scope};
pub use descriptor::{DependencyKind, DependencySpec, ElementDescriptor, SourceSpec, VariantSpec};
pub use error::{LoadError, LoadResult};
pub use kind::{BuildPlan, CommandGroup, ElementKind, KindConfigError, KindRegistry};
pub use project::{ProjectConfig, ProjectRefs, RefStorage};
pub use resolve::{COMMAND_LINE, Loader, VariantChoices};
pub use select::{Planner, Selection, except};
pub use splits::{SplitError, SplitRules};
pub use store::{ComposedElement, DescriptorStore};
pub use variables::{VariableError, Variables};

/// Config trees are JSON objects; YAML documents deserialize into them directly
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;
