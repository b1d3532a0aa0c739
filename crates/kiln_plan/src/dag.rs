//! The resolved dependency DAG.
//!
//! Nodes are shared: two references to the same element+variant hold the
//! same `Arc<ResolvedElement>`. Iteration is always dependencies first.

use crate::ConfigMap;
use crate::descriptor::{DependencyKind, SourceSpec};
use crate::kind::{BuildPlan, ElementKind};
use crate::store::ComposedElement;
use crate::variables::Variables;
use indexmap::{IndexMap, IndexSet};
use kiln_core::ElementId;
use std::sync::Arc;

/// Which dependencies to walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every dependency, transitively, plus the roots
    All,
    /// Everything needed to build the roots, excluding the roots
    Build,
    /// The roots and their runtime closure
    Run,
    /// Just the roots
    None,
}

/// An edge from the owning element to a dependency
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    /// The dependency
    pub element: Arc<ResolvedElement>,
    /// Edge kind
    pub kind: DependencyKind,
    /// Folded into the owner's key even when runtime-only
    pub cache_significant: bool,
}

/// One element with its variant chosen and its edges resolved
#[derive(Debug)]
pub struct ResolvedElement {
    id: ElementId,
    kind: Arc<dyn ElementKind>,
    description: String,
    sources: Vec<SourceSpec>,
    variables: Variables,
    environment: IndexMap<String, String>,
    environment_nocache: IndexSet<String>,
    config: ConfigMap,
    public: ConfigMap,
    strict_rebuild: bool,
    dependencies: Vec<DependencyEdge>,
}

impl ResolvedElement {
    /// Assemble a node from a composed element and its resolved edges
    #[must_use]
    pub fn new(composed: ComposedElement, dependencies: Vec<DependencyEdge>) -> Self {
        Self {
            id: composed.id,
            kind: composed.kind,
            description: composed.description,
            sources: composed.sources,
            variables: composed.variables,
            environment: composed.environment,
            environment_nocache: composed.environment_nocache,
            config: composed.config,
            public: composed.public,
            strict_rebuild: composed.strict_rebuild,
            dependencies,
        }
    }

    /// Identity
    #[must_use]
    pub fn id(&self) -> &ElementId {
        &self.id
    }

    /// Element name
    #[must_use]
    pub fn name(&self) -> &str {
        self.id.name()
    }

    /// Kind implementation
    #[must_use]
    pub fn kind(&self) -> &Arc<dyn ElementKind> {
        &self.kind
    }

    /// Free text
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Sources in declaration order
    #[must_use]
    pub fn sources(&self) -> &[SourceSpec] {
        &self.sources
    }

    /// Variables
    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Expanded environment
    #[must_use]
    pub fn environment(&self) -> &IndexMap<String, String> {
        &self.environment
    }

    /// Environment names excluded from the cache key
    #[must_use]
    pub fn environment_nocache(&self) -> &IndexSet<String> {
        &self.environment_nocache
    }

    /// Expanded config
    #[must_use]
    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    /// Expanded public data
    #[must_use]
    pub fn public(&self) -> &ConfigMap {
        &self.public
    }

    /// Whether weak keys follow dependency changes
    #[must_use]
    pub fn strict_rebuild(&self) -> bool {
        self.strict_rebuild
    }

    /// Direct edges
    #[must_use]
    pub fn dependencies(&self) -> &[DependencyEdge] {
        &self.dependencies
    }

    /// Whether every source has a pinned reference
    #[must_use]
    pub fn sources_pinned(&self) -> bool {
        self.sources.iter().all(SourceSpec::is_pinned)
    }

    /// Direct build dependencies
    pub fn build_dependencies(&self) -> impl Iterator<Item = &Arc<ResolvedElement>> {
        self.dependencies
            .iter()
            .filter(|e| e.kind.is_build())
            .map(|e| &e.element)
    }

    /// Direct runtime dependencies
    pub fn runtime_dependencies(&self) -> impl Iterator<Item = &Arc<ResolvedElement>> {
        self.dependencies
            .iter()
            .filter(|e| e.kind.is_runtime())
            .map(|e| &e.element)
    }

    /// Direct build dependencies plus their runtime closure
    #[must_use]
    pub fn build_scope(&self) -> Vec<Arc<ResolvedElement>> {
        let mut seen = IndexSet::new();
        let mut out = Vec::new();
        for dep in self.build_dependencies() {
            runtime_closure(dep, &mut seen, &mut out);
        }
        out
    }

    /// Commands, environment and directories for the sandbox
    #[must_use]
    pub fn build_plan(&self) -> BuildPlan {
        BuildPlan {
            commands: self.kind.produce_commands(&self.config),
            environment: self.environment.clone(),
            source_directory: self.kind.source_directory(&self.config, &self.variables),
            output_directory: self.kind.output_directory(&self.config, &self.variables),
        }
    }
}

/// Append `element` and its runtime closure, dependencies first
fn runtime_closure(
    element: &Arc<ResolvedElement>,
    seen: &mut IndexSet<ElementId>,
    out: &mut Vec<Arc<ResolvedElement>>,
) {
    if !seen.insert(element.id.clone()) {
        return;
    }
    for dep in element.runtime_dependencies() {
        runtime_closure(dep, seen, out);
    }
    out.push(Arc::clone(element));
}

fn all_closure(
    element: &Arc<ResolvedElement>,
    seen: &mut IndexSet<ElementId>,
    out: &mut Vec<Arc<ResolvedElement>>,
) {
    if !seen.insert(element.id.clone()) {
        return;
    }
    for edge in &element.dependencies {
        all_closure(&edge.element, seen, out);
    }
    out.push(Arc::clone(element));
}

/// The resolved graph for one set of targets
#[derive(Debug, Clone, Default)]
pub struct ElementGraph {
    targets: Vec<Arc<ResolvedElement>>,
    elements: IndexMap<ElementId, Arc<ResolvedElement>>,
}

impl ElementGraph {
    /// Build from targets; every reachable node is indexed in topological order
    #[must_use]
    pub fn new(targets: Vec<Arc<ResolvedElement>>) -> Self {
        let mut seen = IndexSet::new();
        let mut ordered = Vec::new();
        for target in &targets {
            all_closure(target, &mut seen, &mut ordered);
        }
        let elements = ordered
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        Self { targets, elements }
    }

    /// Requested targets
    #[must_use]
    pub fn targets(&self) -> &[Arc<ResolvedElement>] {
        &self.targets
    }

    /// Look up by identity
    #[must_use]
    pub fn get(&self, id: &ElementId) -> Option<&Arc<ResolvedElement>> {
        self.elements.get(id)
    }

    /// Look up by name; each name resolves to one variant
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Arc<ResolvedElement>> {
        self.elements.values().find(|e| e.name() == name)
    }

    /// Every element, dependencies before dependents
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResolvedElement>> {
        self.elements.values()
    }

    /// Number of distinct elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Check if the graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Position in topological order
    #[must_use]
    pub fn position(&self, id: &ElementId) -> Option<usize> {
        self.elements.get_index_of(id)
    }

    /// Walk `scope` from `roots`, deduplicated, dependencies first
    #[must_use]
    pub fn scope(roots: &[Arc<ResolvedElement>], scope: Scope) -> Vec<Arc<ResolvedElement>> {
        let mut seen = IndexSet::new();
        let mut out = Vec::new();
        match scope {
            Scope::All => {
                for root in roots {
                    all_closure(root, &mut seen, &mut out);
                }
            }
            Scope::Run => {
                for root in roots {
                    runtime_closure(root, &mut seen, &mut out);
                }
            }
            Scope::Build => {
                for root in roots {
                    for dep in root.build_dependencies() {
                        runtime_closure(dep, &mut seen, &mut out);
                    }
                }
            }
            Scope::None => {
                for root in roots {
                    if seen.insert(root.id.clone()) {
                        out.push(Arc::clone(root));
                    }
                }
            }
        }
        out
    }
}
