//! Per-element scheduling states.
//!
//! ```text
//! KeyPending -> Querying -> Cached
//!                        -> Fetching -> Waiting -> Building -> Pushing -> Built
//! any non-terminal -> Failed | Skipped
//! ```
//!
//! `Tracking` may precede `KeyPending` when tracking is requested.

use serde::Serialize;

/// Where an element is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementState {
    /// Not required by the run (yet)
    Inactive,
    /// A track job is queued or running
    Tracking,
    /// Required, but its key waits on tracking
    KeyPending,
    /// Key known; the cache is being queried
    Querying,
    /// Missed the cache; sources are being fetched
    Fetching,
    /// Sources ready; waiting on build dependencies
    Waiting,
    /// A build job is queued or running
    Building,
    /// Built; the artifact is being pushed
    Pushing,
    /// Done: the cache already had it
    Cached,
    /// Done: built and pushed
    Built,
    /// Done: sources tracked
    Tracked,
    /// A job failed for good
    Failed,
    /// A dependency failed, or the run stopped first
    Skipped,
}

impl ElementState {
    /// No further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cached | Self::Built | Self::Tracked | Self::Failed | Self::Skipped
        )
    }

    /// Artifact available to dependents
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Cached | Self::Built)
    }

    /// Failed or skipped
    #[must_use]
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ElementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Tracking => "tracking",
            Self::KeyPending => "key-pending",
            Self::Querying => "querying",
            Self::Fetching => "fetching",
            Self::Waiting => "waiting",
            Self::Building => "building",
            Self::Pushing => "pushing",
            Self::Cached => "cached",
            Self::Built => "built",
            Self::Tracked => "tracked",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ElementState::Cached.is_done());
        assert!(ElementState::Built.is_terminal());
        assert!(!ElementState::Tracked.is_done());
        assert!(ElementState::Skipped.is_unsuccessful());
        assert!(!ElementState::Pushing.is_terminal());
        assert_eq!(ElementState::KeyPending.to_string(), "key-pending");
    }
}
