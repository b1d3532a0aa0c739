//! KILN Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything that flows into a cache key has a stable, cross-platform encoding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod tree;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use hash::{CacheKey, Hash, HashError};
pub use id::{ElementId, RunId};
pub use tree::{FileEntry, FileTree};
