//! Run reports.

use crate::jobs::JobKind;
use crate::state::ElementState;
use kiln_cache::TrackedRefs;
use kiln_core::{CacheKey, ElementId, RunId};
use serde::Serialize;

/// Overall outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Every required element is cached or built
    Success,
    /// Something failed, but at least one artifact was produced
    PartialFailure,
    /// Something failed and nothing was produced
    Failed,
    /// Stopped by cancellation
    Terminated,
    /// Nothing ran: these elements need tracking first
    NeedsTracking {
        /// Elements with unpinned sources
        elements: Vec<ElementId>,
    },
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial failure"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
            Self::NeedsTracking { elements } => {
                let names: Vec<String> = elements.iter().map(ToString::to_string).collect();
                write!(f, "needs tracking: {}", names.join(", "))
            }
        }
    }
}

/// Final state of one element
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementReport {
    /// Identity
    pub element: ElementId,
    /// Final state
    pub state: ElementState,
    /// Key the artifact is available under, or the strong key
    pub key: Option<CacheKey>,
    /// Why it failed or was skipped
    pub error: Option<String>,
}

/// Jobs started per kind, retries included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Track jobs
    pub track: usize,
    /// Pull jobs
    pub pull: usize,
    /// Fetch jobs
    pub fetch: usize,
    /// Build jobs
    pub build: usize,
    /// Push jobs
    pub push: usize,
}

impl JobCounts {
    /// Count one started job
    pub fn record(&mut self, kind: JobKind) {
        match kind {
            JobKind::Track => self.track += 1,
            JobKind::Pull => self.pull += 1,
            JobKind::Fetch => self.fetch += 1,
            JobKind::Build => self.build += 1,
            JobKind::Push => self.push += 1,
        }
    }

    /// Jobs of one kind
    #[must_use]
    pub fn get(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Track => self.track,
            JobKind::Pull => self.pull,
            JobKind::Fetch => self.fetch,
            JobKind::Build => self.build,
            JobKind::Push => self.push,
        }
    }

    /// All jobs
    #[must_use]
    pub fn total(&self) -> usize {
        self.track + self.pull + self.fetch + self.build + self.push
    }
}

/// What a run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Run identifier
    pub run_id: RunId,
    /// Outcome
    pub status: RunStatus,
    /// Required elements, dependencies first
    pub elements: Vec<ElementReport>,
    /// Jobs started
    pub jobs: JobCounts,
    /// Refs found by tracking
    pub tracked: TrackedRefs,
}

impl BuildReport {
    /// Report for one element
    #[must_use]
    pub fn element(&self, id: &ElementId) -> Option<&ElementReport> {
        self.elements.iter().find(|e| &e.element == id)
    }

    /// Report by element name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ElementReport> {
        self.elements.iter().find(|e| e.element.name() == name)
    }

    /// Elements in `state`
    pub fn in_state(&self, state: ElementState) -> impl Iterator<Item = &ElementReport> {
        self.elements.iter().filter(move |e| e.state == state)
    }
}
