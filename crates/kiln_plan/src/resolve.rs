//! Graph loading and variant resolution.
//!
//! Resolution runs in passes. Each pass walks the graph from the targets
//! using the previous pass's choices (a pin if there is one, otherwise the
//! element's default variant) and collects every explicit variant request.
//! The requests of one pass become the choices of the next; resolution is
//! done when a pass reproduces its own input. Two different explicit
//! requests for one element in the settled pass are a conflict.
//!
//! A final walk then composes each element once, in dependency order,
//! rejecting cycles with the full path.

use crate::dag::{DependencyEdge, ElementGraph, ResolvedElement};
use crate::error::{LoadError, LoadResult};
use crate::kind::KindRegistry;
use crate::store::DescriptorStore;
use indexmap::IndexMap;
use kiln_core::ElementId;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Requester name used for targets
pub const COMMAND_LINE: &str = "command line";

/// Element name to chosen variant
pub type VariantChoices = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pin {
    variant: String,
    requested_by: String,
}

#[derive(Debug, Default)]
struct Pass {
    pins: BTreeMap<String, Pin>,
    conflict: Option<LoadError>,
}

impl Pass {
    fn choices(&self) -> VariantChoices {
        self.pins
            .iter()
            .map(|(name, pin)| (name.clone(), pin.variant.clone()))
            .collect()
    }
}

/// Turns descriptors into a resolved DAG
#[derive(Debug)]
pub struct Loader<'a> {
    store: &'a DescriptorStore,
    kinds: &'a KindRegistry,
    max_passes: usize,
}

impl<'a> Loader<'a> {
    /// Create a loader over a store
    #[must_use]
    pub fn new(store: &'a DescriptorStore, kinds: &'a KindRegistry) -> Self {
        Self {
            store,
            kinds,
            max_passes: store.len() + 2,
        }
    }

    /// Limit the number of resolution passes
    #[must_use]
    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes.max(1);
        self
    }

    /// Parse command line targets (`name` or `name:variant`)
    ///
    /// # Errors
    ///
    /// Returns error if a target is malformed
    pub fn parse_targets<S: AsRef<str>>(targets: &[S]) -> LoadResult<Vec<ElementId>> {
        targets
            .iter()
            .map(|t| {
                let t = t.as_ref();
                ElementId::parse(t).map_err(|e| LoadError::InvalidTarget {
                    target: t.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Resolve the DAG reachable from `targets`
    ///
    /// # Errors
    ///
    /// Returns error on missing elements, unknown or conflicting variants,
    /// cycles, and any composition error
    pub fn load(&self, targets: &[ElementId]) -> LoadResult<ElementGraph> {
        let choices = self.resolve_variants(targets)?;

        let mut builder = GraphBuilder {
            loader: self,
            choices: &choices,
            nodes: IndexMap::new(),
            path: Vec::new(),
        };
        let mut roots = Vec::with_capacity(targets.len());
        for target in targets {
            roots.push(builder.resolve(target.name(), COMMAND_LINE)?);
        }

        let graph = ElementGraph::new(roots);
        info!(
            targets = targets.len(),
            elements = graph.len(),
            "resolved element graph"
        );
        Ok(graph)
    }

    /// Run resolution passes until the variant choices settle
    ///
    /// # Errors
    ///
    /// Returns error on missing elements, unknown variants, conflicts, or
    /// choices that never settle
    pub fn resolve_variants(&self, targets: &[ElementId]) -> LoadResult<VariantChoices> {
        let mut choices = VariantChoices::new();
        let mut last_conflict = None;

        for round in 0..self.max_passes {
            let pass = self.run_pass(targets, &choices)?;
            let next = pass.choices();
            if next == choices {
                if let Some(conflict) = pass.conflict {
                    return Err(conflict);
                }
                debug!(passes = round + 1, pinned = next.len(), "variant choices settled");
                return Ok(next);
            }

            let changed: Vec<String> = next
                .keys()
                .chain(choices.keys())
                .filter(|name| next.get(*name) != choices.get(*name))
                .cloned()
                .collect();
            debug!(round, changed = ?changed, "variant choices changed");
            last_conflict = pass.conflict.or(last_conflict);
            choices = next;
        }

        if let Some(conflict) = last_conflict {
            return Err(conflict);
        }
        let unsettled = self.run_pass(targets, &choices)?.choices();
        let mut elements: Vec<String> = unsettled
            .keys()
            .chain(choices.keys())
            .filter(|name| unsettled.get(*name) != choices.get(*name))
            .cloned()
            .collect();
        elements.sort();
        elements.dedup();
        Err(LoadError::VariantsUnsettled { elements })
    }

    fn run_pass(&self, targets: &[ElementId], choices: &VariantChoices) -> LoadResult<Pass> {
        let mut pass = Pass::default();
        let mut visited = HashSet::new();
        let mut stack: Vec<String> = Vec::new();

        for target in targets.iter().rev() {
            let descriptor = self.store.require(target.name(), COMMAND_LINE)?;
            if let Some(variant) = target.variant() {
                self.pin(&mut pass, descriptor, variant, COMMAND_LINE)?;
            }
            stack.push(target.name().to_string());
        }

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let descriptor = self.store.require(&name, &name)?;
            let active = active_variant(descriptor, choices, &pass);
            let deps = self.store.dependencies_for(&name, active.as_deref())?;

            for dep in deps.iter().rev() {
                let target = self.store.require(&dep.element, &name)?;
                if let Some(variant) = &dep.variant {
                    self.pin(&mut pass, target, variant, &name)?;
                }
                if !visited.contains(&dep.element) {
                    stack.push(dep.element.clone());
                }
            }
        }
        Ok(pass)
    }

    fn pin(
        &self,
        pass: &mut Pass,
        descriptor: &crate::descriptor::ElementDescriptor,
        variant: &str,
        requested_by: &str,
    ) -> LoadResult<()> {
        if descriptor.variant(variant).is_none() {
            return Err(LoadError::UnknownVariant {
                element: descriptor.name.clone(),
                variant: variant.to_string(),
                requested_by: requested_by.to_string(),
            });
        }

        match pass.pins.get(&descriptor.name) {
            Some(existing) if existing.variant != variant => {
                if pass.conflict.is_none() {
                    pass.conflict = Some(LoadError::VariantConflict {
                        element: descriptor.name.clone(),
                        first_requester: existing.requested_by.clone(),
                        first_variant: existing.variant.clone(),
                        second_requester: requested_by.to_string(),
                        second_variant: variant.to_string(),
                    });
                }
            }
            Some(_) => {}
            None => {
                pass.pins.insert(
                    descriptor.name.clone(),
                    Pin {
                        variant: variant.to_string(),
                        requested_by: requested_by.to_string(),
                    },
                );
            }
        }
        Ok(())
    }
}

/// Pin from this pass, else choice from the last one, else the default
fn active_variant(
    descriptor: &crate::descriptor::ElementDescriptor,
    choices: &VariantChoices,
    pass: &Pass,
) -> Option<String> {
    pass.pins
        .get(&descriptor.name)
        .map(|p| p.variant.clone())
        .or_else(|| choices.get(&descriptor.name).cloned())
        .or_else(|| descriptor.default_variant().map(str::to_string))
}

struct GraphBuilder<'l, 'a> {
    loader: &'l Loader<'a>,
    choices: &'l VariantChoices,
    nodes: IndexMap<String, Arc<ResolvedElement>>,
    path: Vec<String>,
}

impl GraphBuilder<'_, '_> {
    fn resolve(&mut self, name: &str, requested_by: &str) -> LoadResult<Arc<ResolvedElement>> {
        if let Some(node) = self.nodes.get(name) {
            return Ok(Arc::clone(node));
        }
        if let Some(pos) = self.path.iter().position(|p| p == name) {
            let mut path = self.path[pos..].to_vec();
            path.push(name.to_string());
            return Err(LoadError::Cycle { path });
        }

        let descriptor = self.loader.store.require(name, requested_by)?;
        let variant = self
            .choices
            .get(name)
            .cloned()
            .or_else(|| descriptor.default_variant().map(str::to_string));
        let composed = self
            .loader
            .store
            .compose(name, variant.as_deref(), self.loader.kinds)?;

        self.path.push(name.to_string());
        let mut edges: Vec<DependencyEdge> = Vec::with_capacity(composed.dependencies.len());
        for dep in &composed.dependencies {
            let element = self.resolve(&dep.element, name)?;
            match edges.iter_mut().find(|e| Arc::ptr_eq(&e.element, &element)) {
                Some(edge) => {
                    edge.kind = edge.kind.union(dep.kind);
                    edge.cache_significant |= dep.cache_significant;
                }
                None => edges.push(DependencyEdge {
                    element,
                    kind: dep.kind,
                    cache_significant: dep.cache_significant,
                }),
            }
        }
        self.path.pop();

        let node = Arc::new(ResolvedElement::new(composed, edges));
        self.nodes.insert(name.to_string(), Arc::clone(&node));
        Ok(node)
    }
}
