//! Cache key computation.
//!
//! A key record is encoded with postcard and hashed with BLAKE3. Field order
//! in [`KeyRecord`] is the fingerprint input order:
//!
//! 1. artifact format version, kind name and version, canonical config and public data
//! 2. source kinds, locations and pinned refs
//! 3. dependency inputs in build-scope order
//! 4. environment minus `environment-nocache`, sorted by name

use indexmap::{IndexMap, IndexSet};
use kiln_core::{CacheKey, CoreResult, ElementId};
use kiln_plan::{ElementGraph, ResolvedElement};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Version of the artifact layout; bumping it invalidates every key
pub const ARTIFACT_VERSION: u32 = 1;

/// Refs found by tracking, per element and source index
pub type TrackedRefs = HashMap<ElementId, Vec<Option<String>>>;

/// What a dependency contributes to a key record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DependencyInput {
    /// A dependency key (strong keys, strict weak keys)
    Key(CacheKey),
    /// A dependency identity (non-strict weak keys)
    Name(String),
}

/// Why a key cannot be computed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    /// These sources have no pinned ref
    UnpinnedSources {
        /// Source indices
        indices: Vec<usize>,
    },
    /// A key contributing dependency is itself pending
    DependencyPending {
        /// The dependency
        dependency: ElementId,
    },
}

impl std::fmt::Display for PendingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnpinnedSources { indices } => {
                write!(f, "sources {:?} need tracking", indices)
            }
            Self::DependencyPending { dependency } => {
                write!(f, "dependency '{}' needs tracking", dependency)
            }
        }
    }
}

/// Result of a key computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// The key
    Ready(CacheKey),
    /// Not computable until sources are tracked
    Pending(PendingReason),
}

impl KeyOutcome {
    /// The key, if ready
    #[must_use]
    pub fn key(&self) -> Option<CacheKey> {
        match self {
            Self::Ready(key) => Some(*key),
            Self::Pending(_) => None,
        }
    }
}

/// An element plus the source refs to fingerprint it with
#[derive(Debug, Clone)]
pub struct KeyInputs<'a> {
    element: &'a ResolvedElement,
    refs: Vec<Option<&'a str>>,
}

impl<'a> KeyInputs<'a> {
    /// Inputs using declared refs, overridden by tracked ones
    #[must_use]
    pub fn new(element: &'a ResolvedElement, tracked: Option<&'a [Option<String>]>) -> Self {
        let refs = element
            .sources()
            .iter()
            .enumerate()
            .map(|(idx, source)| {
                tracked
                    .and_then(|t| t.get(idx))
                    .and_then(Option::as_deref)
                    .or(source.reference.as_deref())
            })
            .collect();
        Self { element, refs }
    }

    /// The element
    #[must_use]
    pub fn element(&self) -> &'a ResolvedElement {
        self.element
    }

    /// Effective ref per source
    #[must_use]
    pub fn refs(&self) -> &[Option<&'a str>] {
        &self.refs
    }

    /// Indices of sources with no ref
    #[must_use]
    pub fn unpinned(&self) -> Vec<usize> {
        self.refs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }
}

#[derive(Serialize)]
struct SourceRecord<'a> {
    kind: &'a str,
    location: &'a str,
    reference: &'a str,
    directory: Option<&'a str>,
}

#[derive(Serialize)]
struct KeyRecord<'a> {
    artifact_version: u32,
    kind: &'a str,
    kind_version: u32,
    config: String,
    public: String,
    sources: Vec<SourceRecord<'a>>,
    dependencies: &'a [DependencyInput],
    environment: Vec<(&'a str, &'a str)>,
}

/// Computes cache keys from key records
#[derive(Debug, Clone)]
pub struct CacheKeyEngine {
    artifact_version: u32,
}

impl Default for CacheKeyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheKeyEngine {
    /// Engine for the current artifact version
    #[must_use]
    pub fn new() -> Self {
        Self {
            artifact_version: ARTIFACT_VERSION,
        }
    }

    /// Engine for a specific artifact version
    #[must_use]
    pub fn with_artifact_version(artifact_version: u32) -> Self {
        Self { artifact_version }
    }

    /// Strong key from dependency keys in key-dependency order
    ///
    /// # Errors
    ///
    /// Returns error if the key record cannot be encoded
    pub fn compute(&self, inputs: &KeyInputs<'_>, dependency_keys: &[CacheKey]) -> CoreResult<KeyOutcome> {
        let dependencies: Vec<_> = dependency_keys.iter().copied().map(DependencyInput::Key).collect();
        self.compute_with(inputs, &dependencies)
    }

    /// Key from arbitrary dependency inputs
    ///
    /// # Errors
    ///
    /// Returns error if the key record cannot be encoded
    pub fn compute_with(&self, inputs: &KeyInputs<'_>, dependencies: &[DependencyInput]) -> CoreResult<KeyOutcome> {
        let unpinned = inputs.unpinned();
        if !unpinned.is_empty() {
            return Ok(KeyOutcome::Pending(PendingReason::UnpinnedSources { indices: unpinned }));
        }
        let record = self.record(inputs, dependencies)?;
        Ok(KeyOutcome::Ready(CacheKey::digest(&record)))
    }

    /// Encoded key record
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn record(&self, inputs: &KeyInputs<'_>, dependencies: &[DependencyInput]) -> CoreResult<Vec<u8>> {
        let element = inputs.element();
        let sources = element
            .sources()
            .iter()
            .zip(inputs.refs())
            .map(|(source, reference)| SourceRecord {
                kind: &source.kind,
                location: &source.location,
                reference: reference.unwrap_or_default(),
                directory: source.directory.as_deref(),
            })
            .collect();

        let nocache = element.environment_nocache();
        let mut environment: Vec<(&str, &str)> = element
            .environment()
            .iter()
            .filter(|(name, _)| !nocache.contains(name.as_str()))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        environment.sort_unstable();

        let record = KeyRecord {
            artifact_version: self.artifact_version,
            kind: element.kind().name(),
            kind_version: element.kind().version(),
            config: canonical_json(&Value::Object(element.config().clone())),
            public: canonical_json(&Value::Object(element.public().clone())),
            sources,
            dependencies,
            environment,
        };
        Ok(postcard::to_stdvec(&record)?)
    }
}

/// JSON with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Elements whose keys feed `element`'s key: the build scope, then any
/// cache-significant runtime dependency not already in it
#[must_use]
pub fn key_dependencies(element: &ResolvedElement) -> Vec<Arc<ResolvedElement>> {
    let mut deps = element.build_scope();
    let mut seen: IndexSet<ElementId> = deps.iter().map(|d| d.id().clone()).collect();
    for edge in element.dependencies() {
        if edge.cache_significant && seen.insert(edge.element.id().clone()) {
            deps.push(Arc::clone(&edge.element));
        }
    }
    deps
}

/// Key state of one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// Both keys known
    Ready {
        /// Key over dependency keys
        strong: CacheKey,
        /// Key tolerant of dependency changes
        weak: CacheKey,
    },
    /// Waiting on tracking
    Pending(PendingReason),
}

/// Keys for every element of a graph
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    keys: IndexMap<ElementId, KeyState>,
}

impl KeyTable {
    /// Compute every key in topological order
    ///
    /// # Errors
    ///
    /// Returns error if a key record cannot be encoded
    pub fn fold(graph: &ElementGraph, engine: &CacheKeyEngine, tracked: &TrackedRefs) -> CoreResult<Self> {
        let mut table = Self::default();
        for element in graph.iter() {
            let state = table.compute(element, engine, tracked)?;
            table.keys.insert(element.id().clone(), state);
        }
        Ok(table)
    }

    /// Recompute `element` and everything after it in topological order
    ///
    /// Returns the elements whose state changed.
    ///
    /// # Errors
    ///
    /// Returns error if a key record cannot be encoded
    pub fn refresh(
        &mut self,
        graph: &ElementGraph,
        engine: &CacheKeyEngine,
        tracked: &TrackedRefs,
        element: &ElementId,
    ) -> CoreResult<Vec<ElementId>> {
        let Some(start) = graph.position(element) else {
            return Ok(Vec::new());
        };
        let mut changed = Vec::new();
        for candidate in graph.iter().skip(start) {
            let state = self.compute(candidate, engine, tracked)?;
            if self.keys.get(candidate.id()) != Some(&state) {
                changed.push(candidate.id().clone());
                self.keys.insert(candidate.id().clone(), state);
            }
        }
        Ok(changed)
    }

    fn compute(
        &self,
        element: &ResolvedElement,
        engine: &CacheKeyEngine,
        tracked: &TrackedRefs,
    ) -> CoreResult<KeyState> {
        let inputs = KeyInputs::new(element, tracked.get(element.id()).map(Vec::as_slice));
        let unpinned = inputs.unpinned();
        if !unpinned.is_empty() {
            return Ok(KeyState::Pending(PendingReason::UnpinnedSources { indices: unpinned }));
        }

        let deps = key_dependencies(element);
        let mut strong_inputs = Vec::with_capacity(deps.len());
        let mut weak_inputs = Vec::with_capacity(deps.len());
        for dep in &deps {
            match self.keys.get(dep.id()) {
                Some(KeyState::Ready { strong, weak }) => {
                    strong_inputs.push(DependencyInput::Key(*strong));
                    weak_inputs.push(if element.strict_rebuild() {
                        DependencyInput::Key(*weak)
                    } else {
                        DependencyInput::Name(dep.id().to_string())
                    });
                }
                _ => {
                    return Ok(KeyState::Pending(PendingReason::DependencyPending {
                        dependency: dep.id().clone(),
                    }));
                }
            }
        }

        match (
            engine.compute_with(&inputs, &strong_inputs)?,
            engine.compute_with(&inputs, &weak_inputs)?,
        ) {
            (KeyOutcome::Ready(strong), KeyOutcome::Ready(weak)) => Ok(KeyState::Ready { strong, weak }),
            (KeyOutcome::Pending(reason), _) | (_, KeyOutcome::Pending(reason)) => Ok(KeyState::Pending(reason)),
        }
    }

    /// State of one element
    #[must_use]
    pub fn get(&self, id: &ElementId) -> Option<&KeyState> {
        self.keys.get(id)
    }

    /// Strong key, if ready
    #[must_use]
    pub fn strong(&self, id: &ElementId) -> Option<CacheKey> {
        match self.keys.get(id) {
            Some(KeyState::Ready { strong, .. }) => Some(*strong),
            _ => None,
        }
    }

    /// Weak key, if ready
    #[must_use]
    pub fn weak(&self, id: &ElementId) -> Option<CacheKey> {
        match self.keys.get(id) {
            Some(KeyState::Ready { weak, .. }) => Some(*weak),
            _ => None,
        }
    }

    /// Whether the element is waiting on tracking
    #[must_use]
    pub fn is_pending(&self, id: &ElementId) -> bool {
        matches!(self.keys.get(id), Some(KeyState::Pending(_)))
    }

    /// Every pending element with its reason
    pub fn pending(&self) -> impl Iterator<Item = (&ElementId, &PendingReason)> {
        self.keys.iter().filter_map(|(id, state)| match state {
            KeyState::Pending(reason) => Some((id, reason)),
            KeyState::Ready { .. } => None,
        })
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
