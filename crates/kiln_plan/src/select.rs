//! Element selection for `show`, `track` and `build --except`.

use crate::dag::{ElementGraph, ResolvedElement, Scope};
use kiln_core::ElementId;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

/// Which elements around the targets to act on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Selection {
    /// Just the targets
    None,
    /// What needs building, deepest first; skips build deps of cached elements
    #[default]
    Plan,
    /// Everything
    All,
    /// Build dependencies of the targets
    Build,
    /// Runtime closure of the targets
    Run,
}

impl Selection {
    /// Select elements reachable from `targets`
    #[must_use]
    pub fn select(
        self,
        targets: &[Arc<ResolvedElement>],
        is_cached: &dyn Fn(&ElementId) -> bool,
    ) -> Vec<Arc<ResolvedElement>> {
        match self {
            Self::None => ElementGraph::scope(targets, Scope::None),
            Self::All => ElementGraph::scope(targets, Scope::All),
            Self::Build => ElementGraph::scope(targets, Scope::Build),
            Self::Run => ElementGraph::scope(targets, Scope::Run),
            Self::Plan => Planner::new(is_cached).plan(targets, true),
        }
    }
}

impl FromStr for Selection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "plan" => Ok(Self::Plan),
            "all" => Ok(Self::All),
            "build" => Ok(Self::Build),
            "run" => Ok(Self::Run),
            other => Err(format!(
                "unknown selection '{}' (expected none, plan, all, build or run)",
                other
            )),
        }
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Plan => "plan",
            Self::All => "all",
            Self::Build => "build",
            Self::Run => "run",
        };
        write!(f, "{}", s)
    }
}

/// Drop `excepted` and everything only they reach from `elements`
///
/// The cut is made where the excepted elements first meet the targets'
/// dependency graph. Elements still reachable from `targets` without
/// passing through the cut are kept, in their original order.
#[must_use]
pub fn except(
    targets: &[Arc<ResolvedElement>],
    elements: Vec<Arc<ResolvedElement>>,
    excepted: &[Arc<ResolvedElement>],
) -> Vec<Arc<ResolvedElement>> {
    if excepted.is_empty() {
        return elements;
    }
    let targeted: HashSet<ElementId> = ElementGraph::scope(targets, Scope::All)
        .iter()
        .map(|e| e.id().clone())
        .collect();

    let mut border = HashSet::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<&Arc<ResolvedElement>> = excepted.iter().collect();
    while let Some(element) = stack.pop() {
        if !seen.insert(element.id().clone()) {
            continue;
        }
        if targeted.contains(element.id()) {
            border.insert(element.id().clone());
        } else {
            stack.extend(element.dependencies().iter().map(|edge| &edge.element));
        }
    }

    let mut kept = HashSet::new();
    let mut stack: Vec<&Arc<ResolvedElement>> = targets.iter().collect();
    while let Some(element) = stack.pop() {
        if border.contains(element.id()) || !kept.insert(element.id().clone()) {
            continue;
        }
        stack.extend(element.dependencies().iter().map(|edge| &edge.element));
    }

    elements.into_iter().filter(|e| kept.contains(e.id())).collect()
}

/// Orders elements for building: deepest build dependencies first
pub struct Planner<'c> {
    is_cached: &'c dyn Fn(&ElementId) -> bool,
    depth: HashMap<ElementId, usize>,
    order: Vec<Arc<ResolvedElement>>,
    visiting: HashSet<ElementId>,
}

impl<'c> Planner<'c> {
    /// Create a planner using a cache predicate
    #[must_use]
    pub fn new(is_cached: &'c dyn Fn(&ElementId) -> bool) -> Self {
        Self {
            is_cached,
            depth: HashMap::new(),
            order: Vec::new(),
            visiting: HashSet::new(),
        }
    }

    /// Plan `roots`; cached elements are kept only if `include_cached`
    #[must_use]
    pub fn plan(mut self, roots: &[Arc<ResolvedElement>], include_cached: bool) -> Vec<Arc<ResolvedElement>> {
        for root in roots {
            self.visit(root, 0);
        }

        let mut planned: Vec<(usize, usize, Arc<ResolvedElement>)> = self
            .order
            .into_iter()
            .enumerate()
            .map(|(seq, e)| (self.depth.get(e.id()).copied().unwrap_or(0), seq, e))
            .collect();
        planned.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        planned
            .into_iter()
            .map(|(_, _, e)| e)
            .filter(|e| include_cached || !(self.is_cached)(e.id()))
            .collect()
    }

    fn visit(&mut self, element: &Arc<ResolvedElement>, depth: usize) {
        let id = element.id().clone();
        if self.visiting.contains(&id) {
            return;
        }
        if self.depth.get(&id).is_some_and(|&previous| previous >= depth) {
            return;
        }

        self.visiting.insert(id.clone());
        for dep in element.runtime_dependencies() {
            self.visit(dep, depth);
        }
        if !(self.is_cached)(&id) {
            for dep in element.build_dependencies() {
                self.visit(dep, depth + 1);
            }
        }
        if self.depth.insert(id.clone(), depth).is_none() {
            self.order.push(Arc::clone(element));
        }
        self.visiting.remove(&id);
    }
}
