//! KILN Runtime
//!
//! Drives a resolved graph to completion: every required element ends
//! cached, built, failed or skipped. The [`Schedule`] owns all element
//! state and is advanced only by job completions; the [`Engine`] runs the
//! jobs it hands out on bounded fetch, build and push pools.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod jobs;
pub mod report;
pub mod sandbox;
pub mod scheduler;
pub mod source;
pub mod state;

pub use config::{OnError, PoolSizeError, SchedulerConfig};
pub use engine::{Engine, EngineError, EngineResult};
pub use jobs::{Job, JobDone, JobError, JobId, JobKind, Pool};
pub use report::{BuildReport, ElementReport, JobCounts, RunStatus};
pub use sandbox::{SandboxError, SandboxOutput, SandboxRequest, SandboxRunner};
pub use scheduler::Schedule;
pub use source::{FetchError, FetcherRegistry, SourceFetcher};
pub use state::ElementState;
