//! KILN Cache
//!
//! Cache keys fingerprint an element's expected output from its config,
//! its pinned sources and its dependencies' keys. Artifacts are stored
//! under those keys in caches that publish atomically.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod cache;
pub mod key;
pub mod local;
pub mod memory;
pub mod tiered;

pub use artifact::{Artifact, ArtifactMeta, DependencyRecord};
pub use cache::{ArtifactCache, CacheError, CacheResult};
pub use key::{
    ARTIFACT_VERSION, CacheKeyEngine, DependencyInput, KeyInputs, KeyOutcome, KeyState, KeyTable,
    PendingReason, TrackedRefs, key_dependencies,
};
pub use local::LocalCache;
pub use memory::MemoryCache;
pub use tiered::TieredCache;
