//! Execution engine.
//!
//! The engine owns the [`Schedule`] for the length of a run, turns the jobs
//! it hands out into [`JobSpec`]s and runs them on a `JoinSet`. Results
//! come back to this one task, which applies them in completion order, so
//! job futures never touch the schedule.

use crate::config::{PoolSizeError, SchedulerConfig};
use crate::jobs::{Job, JobContext, JobDone, JobError, JobKind, JobSpec};
use crate::report::BuildReport;
use crate::sandbox::SandboxRunner;
use crate::scheduler::Schedule;
use crate::source::SourceFetcher;
use kiln_cache::{Artifact, ArtifactCache, CacheKeyEngine, KeyInputs, TrackedRefs};
use kiln_core::{CoreError, ElementId, FileTree, RunId};
use kiln_plan::ElementGraph;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Keys could not be computed
    #[error("cache key computation failed: {0}")]
    Key(#[from] CoreError),

    /// The scheduler configuration cannot run jobs
    #[error("invalid scheduler configuration: {0}")]
    Config(#[from] PoolSizeError),
}

/// Result type for engine runs
pub type EngineResult<T> = Result<T, EngineError>;

/// Runs schedules against a cache, a sandbox and a source fetcher
pub struct Engine {
    config: SchedulerConfig,
    key_engine: CacheKeyEngine,
    cache: Arc<dyn ArtifactCache>,
    sandbox: Arc<dyn SandboxRunner>,
    fetcher: Arc<dyn SourceFetcher>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("cache", &self.cache.name())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        cache: Arc<dyn ArtifactCache>,
        sandbox: Arc<dyn SandboxRunner>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            config,
            key_engine: CacheKeyEngine::new(),
            cache,
            sandbox,
            fetcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a specific key engine
    #[must_use]
    pub fn with_key_engine(mut self, key_engine: CacheKeyEngine) -> Self {
        self.key_engine = key_engine;
        self
    }

    /// Terminate runs when `token` fires
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that terminates running builds
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Build the graph's targets
    ///
    /// Element failures are reported, not returned.
    ///
    /// # Errors
    ///
    /// Returns error if a pool is sized 0 or cache keys cannot be computed
    pub async fn build(&self, graph: &ElementGraph, tracked: &TrackedRefs) -> EngineResult<BuildReport> {
        self.build_excluding(graph, tracked, &[]).await
    }

    /// Build the graph's targets without building `excluded`
    ///
    /// Excluded elements are used when cached; otherwise they and the
    /// elements that need them are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if a pool is sized 0 or cache keys cannot be computed
    pub async fn build_excluding(
        &self,
        graph: &ElementGraph,
        tracked: &TrackedRefs,
        excluded: &[ElementId],
    ) -> EngineResult<BuildReport> {
        self.config.validate()?;
        let schedule = Schedule::build(graph, self.config.clone(), self.key_engine.clone(), tracked.clone())?
            .excluding(excluded.iter().cloned());
        self.drive(schedule, tracked).await
    }

    /// Track the sources of `elements`
    ///
    /// # Errors
    ///
    /// Returns error if a pool is sized 0 or cache keys cannot be computed
    pub async fn track(
        &self,
        graph: &ElementGraph,
        elements: &[ElementId],
        tracked: &TrackedRefs,
    ) -> EngineResult<BuildReport> {
        self.config.validate()?;
        let schedule = Schedule::track(
            graph,
            elements,
            self.config.clone(),
            self.key_engine.clone(),
            tracked.clone(),
        )?;
        self.drive(schedule, tracked).await
    }

    async fn drive(&self, schedule: Schedule, initial: &TrackedRefs) -> EngineResult<BuildReport> {
        let run_id = RunId::new();
        let span = tracing::info_span!("run", run_id = %run_id);
        let schedule = self.run_jobs(schedule).instrument(span.clone()).await?;
        let report = schedule.finish(run_id, initial);
        span.in_scope(|| {
            tracing::info!(status = %report.status, jobs = report.jobs.total(), "run finished");
        });
        Ok(report)
    }

    async fn run_jobs(&self, mut schedule: Schedule) -> EngineResult<Schedule> {
        let cancel = self.cancel.child_token();
        let ctx = JobContext {
            cache: Arc::clone(&self.cache),
            sandbox: Arc::clone(&self.sandbox),
            fetcher: Arc::clone(&self.fetcher),
            cancel: cancel.clone(),
        };

        let mut tasks: JoinSet<Result<JobDone, JobError>> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, Job> = HashMap::new();
        let mut inputs = Inputs::default();

        loop {
            for job in schedule.next_jobs() {
                match inputs.spec(&schedule, &job) {
                    Ok(spec) => {
                        let span = tracing::info_span!(
                            "job",
                            kind = %job.kind,
                            element = %job.element,
                            attempt = job.attempt
                        );
                        let handle = tasks.spawn(spec.run(ctx.clone()).instrument(span));
                        in_flight.insert(handle.id(), job);
                    }
                    Err(err) => schedule.complete(&job, &Err(err))?,
                }
            }

            if schedule.is_finished() {
                break;
            }
            if tasks.is_empty() {
                continue;
            }

            let joined = tokio::select! {
                () = self.cancel.cancelled(), if !schedule.is_terminated() => {
                    tracing::warn!(running = tasks.len(), "terminating run");
                    schedule.terminate();
                    cancel.cancel();
                    continue;
                }
                joined = tasks.join_next_with_id() => joined,
            };

            let (job, result) = match joined {
                Some(Ok((id, result))) => (in_flight.remove(&id), result),
                Some(Err(err)) => {
                    let job = in_flight.remove(&err.id());
                    let result = if err.is_panic() {
                        Err(JobError::Panicked(err.to_string()))
                    } else {
                        Err(JobError::Cancelled)
                    };
                    (job, result)
                }
                None => continue,
            };
            let Some(job) = job else {
                continue;
            };

            inputs.record(&job, &result);
            schedule.complete(&job, &result)?;
            if schedule.is_terminated() && !cancel.is_cancelled() {
                cancel.cancel();
            }
        }

        Ok(schedule)
    }
}

/// Outputs held between jobs: staged sources until the build, artifacts
/// until the push
#[derive(Default)]
struct Inputs {
    sources: HashMap<ElementId, FileTree>,
    built: HashMap<ElementId, Artifact>,
}

impl Inputs {
    fn record(&mut self, job: &Job, result: &Result<JobDone, JobError>) {
        match (job.kind, result) {
            (JobKind::Fetch, Ok(JobDone::Fetched(tree))) => {
                self.sources.insert(job.element.clone(), tree.clone());
            }
            (JobKind::Build, Ok(JobDone::Built(artifact))) => {
                self.sources.remove(&job.element);
                self.built.insert(job.element.clone(), (**artifact).clone());
            }
            (JobKind::Build, Err(_)) => {
                self.sources.remove(&job.element);
            }
            (JobKind::Push, Ok(JobDone::Pushed)) => {
                self.built.remove(&job.element);
            }
            _ => {}
        }
    }

    fn spec(&self, schedule: &Schedule, job: &Job) -> Result<JobSpec, JobError> {
        let id = &job.element;
        let element = schedule
            .element(id)
            .cloned()
            .ok_or_else(|| JobError::MissingInput(format!("element '{}'", id)))?;
        let strong = || {
            schedule
                .keys()
                .strong(id)
                .ok_or_else(|| JobError::MissingInput(format!("cache key of '{}'", id)))
        };

        let spec = match job.kind {
            JobKind::Track => JobSpec::Track { element },
            JobKind::Pull => JobSpec::Pull {
                strong: strong()?,
                weak: if schedule.config().strict {
                    None
                } else {
                    schedule.keys().weak(id)
                },
            },
            JobKind::Fetch => {
                let inputs = KeyInputs::new(&element, schedule.tracked().get(id).map(Vec::as_slice));
                let refs = inputs
                    .refs()
                    .iter()
                    .zip(element.sources())
                    .map(|(reference, source)| {
                        reference
                            .map(str::to_string)
                            .ok_or_else(|| JobError::MissingInput(format!("ref of source '{}'", source.location)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                JobSpec::Fetch {
                    element: Arc::clone(&element),
                    refs,
                }
            }
            JobKind::Build => {
                let dependencies = schedule
                    .build_scope(id)
                    .iter()
                    .map(|dep| {
                        schedule
                            .artifact_key(dep)
                            .map(|key| (dep.clone(), key))
                            .ok_or_else(|| JobError::MissingInput(format!("artifact of '{}'", dep)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let weak = schedule
                    .keys()
                    .weak(id)
                    .ok_or_else(|| JobError::MissingInput(format!("weak key of '{}'", id)))?;
                JobSpec::Build {
                    sources: self.sources.get(id).cloned().unwrap_or_default(),
                    element,
                    dependencies,
                    strong: strong()?,
                    weak,
                }
            }
            JobKind::Push => {
                let artifact = self
                    .built
                    .get(id)
                    .cloned()
                    .ok_or_else(|| JobError::MissingInput(format!("built artifact of '{}'", id)))?;
                JobSpec::Push {
                    artifact: Box::new(artifact),
                }
            }
        };
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnError;
    use crate::report::RunStatus;
    use crate::sandbox::{SandboxError, SandboxOutput, SandboxRequest};
    use crate::source::FetchError;
    use crate::state::ElementState;
    use async_trait::async_trait;
    use kiln_cache::MemoryCache;
    use kiln_core::FileEntry;
    use kiln_plan::{DescriptorStore, ElementDescriptor, KindRegistry, Loader, ProjectConfig, SourceSpec};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const ABC: &[(&str, &str)] = &[
        ("a", "kind: import\nsources:\n- {kind: local, location: a, ref: r1}\n"),
        ("b", "kind: manual\nbuild-depends: [a]\n"),
        ("c", "kind: manual\nbuild-depends: [b]\n"),
    ];

    fn graph(docs: &[(&str, &str)], target: &str) -> ElementGraph {
        graph_of(docs, &[target])
    }

    fn graph_of(docs: &[(&str, &str)], targets: &[&str]) -> ElementGraph {
        let targets: Vec<ElementId> = targets.iter().map(|t| ElementId::new(*t)).collect();
        let store = DescriptorStore::from_descriptors(
            ProjectConfig::new("t"),
            docs.iter()
                .map(|(n, y)| ElementDescriptor::from_yaml(*n, y).unwrap()),
        )
        .unwrap();
        Loader::new(&store, &KindRegistry::with_builtins())
            .load(&targets)
            .unwrap()
    }

    #[derive(Default)]
    struct FakeSandbox {
        fail: Option<&'static str>,
        panic: Option<&'static str>,
        hang: Option<&'static str>,
        entered: Notify,
        requests: Mutex<Vec<SandboxRequest>>,
    }

    #[async_trait]
    impl SandboxRunner for FakeSandbox {
        async fn run(&self, request: SandboxRequest, cancel: CancellationToken) -> Result<SandboxOutput, SandboxError> {
            let name = request.element.clone();
            self.requests.lock().unwrap().push(request);
            if self.hang == Some(name.as_str()) {
                self.entered.notify_one();
                cancel.cancelled().await;
                return Err(SandboxError::Cancelled);
            }
            if self.panic == Some(name.as_str()) {
                panic!("sandbox exploded");
            }
            if self.fail == Some(name.as_str()) {
                if self.hang.is_some() {
                    self.entered.notified().await;
                }
                return Err(SandboxError::CommandFailed {
                    group: "build-commands".into(),
                    command: "make".into(),
                    status: Some(2),
                    log: String::new(),
                });
            }
            let mut files = FileTree::new();
            files
                .insert(&format!("{}.out", name), FileEntry::new(name.clone()))
                .unwrap();
            Ok(SandboxOutput {
                files,
                log: format!("built {}", name),
            })
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        network_failures: AtomicU32,
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn track(&self, _source: &SourceSpec) -> Result<String, FetchError> {
            Ok("v2".to_string())
        }

        async fn fetch(&self, source: &SourceSpec, reference: &str) -> Result<FileTree, FetchError> {
            let remaining = self.network_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.network_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FetchError::Network {
                    location: source.location.clone(),
                    reason: "connection reset".into(),
                });
            }
            let mut tree = FileTree::new();
            tree.insert(&source.location, FileEntry::new(reference.to_string()))
                .unwrap();
            Ok(tree)
        }
    }

    fn engine(config: SchedulerConfig, cache: Arc<MemoryCache>, sandbox: Arc<FakeSandbox>, fetcher: Arc<FakeFetcher>) -> Engine {
        Engine::new(config, cache, sandbox, fetcher)
    }

    #[tokio::test]
    async fn test_rebuild_is_fully_cached() {
        let graph = graph(ABC, "c");
        let cache = Arc::new(MemoryCache::new());
        let sandbox = Arc::new(FakeSandbox::default());
        let engine = engine(
            SchedulerConfig::default(),
            Arc::clone(&cache),
            Arc::clone(&sandbox),
            Arc::new(FakeFetcher::default()),
        );

        let first = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert_eq!(first.status, RunStatus::Success);
        assert_eq!(first.jobs.build, 3);
        assert_eq!(first.jobs.fetch, 1);

        let second = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.jobs.build, 0);
        assert_eq!(second.jobs.fetch, 0);
        assert_eq!(second.find("c").unwrap().state, ElementState::Cached);
        assert_eq!(first.find("c").unwrap().key, second.find("c").unwrap().key);
    }

    #[tokio::test]
    async fn test_build_stages_build_scope_artifacts() {
        let graph = graph(ABC, "c");
        let sandbox = Arc::new(FakeSandbox::default());
        let engine = engine(
            SchedulerConfig::default(),
            Arc::new(MemoryCache::new()),
            Arc::clone(&sandbox),
            Arc::new(FakeFetcher::default()),
        );
        engine.build(&graph, &TrackedRefs::new()).await.unwrap();

        let requests = sandbox.requests.lock().unwrap();
        let a = requests.iter().find(|r| r.element == "a").unwrap();
        assert_eq!(a.sources.get("a").unwrap().data.as_ref(), b"r1");
        let c = requests.iter().find(|r| r.element == "c").unwrap();
        assert!(c.root.get("b.out").is_some());
        assert!(c.root.get("a.out").is_none());
    }

    #[tokio::test]
    async fn test_changed_pin_rebuilds_dependents() {
        let graph = graph(ABC, "c");
        let cache = Arc::new(MemoryCache::new());
        let engine = engine(
            SchedulerConfig::default(),
            Arc::clone(&cache),
            Arc::new(FakeSandbox::default()),
            Arc::new(FakeFetcher::default()),
        );
        let first = engine.build(&graph, &TrackedRefs::new()).await.unwrap();

        let mut tracked = TrackedRefs::new();
        tracked.insert(ElementId::new("a"), vec![Some("r2".to_string())]);
        let second = engine.build(&graph, &tracked).await.unwrap();
        assert_eq!(second.jobs.build, 3);
        assert_ne!(first.find("b").unwrap().key, second.find("b").unwrap().key);
        assert!(second.tracked.is_empty());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let graph = graph(ABC, "c");
        let sandbox = Arc::new(FakeSandbox {
            fail: Some("b"),
            ..FakeSandbox::default()
        });
        let engine = engine(
            SchedulerConfig::default().with_on_error(OnError::Continue),
            Arc::new(MemoryCache::new()),
            sandbox,
            Arc::new(FakeFetcher::default()),
        );
        let report = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.find("a").unwrap().state, ElementState::Built);
        assert_eq!(report.find("b").unwrap().state, ElementState::Failed);
        assert_eq!(report.find("c").unwrap().state, ElementState::Skipped);
    }

    #[tokio::test]
    async fn test_panicking_job_fails_its_element() {
        let graph = graph(ABC, "b");
        let sandbox = Arc::new(FakeSandbox {
            panic: Some("a"),
            ..FakeSandbox::default()
        });
        let engine = engine(
            SchedulerConfig::default(),
            Arc::new(MemoryCache::new()),
            sandbox,
            Arc::new(FakeFetcher::default()),
        );
        let report = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        let a = report.find("a").unwrap();
        assert_eq!(a.state, ElementState::Failed);
        assert!(a.error.as_deref().unwrap().contains("panicked"));
        assert_eq!(report.find("b").unwrap().state, ElementState::Skipped);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_fetch_retries_network_errors() {
        let graph = graph(ABC, "a");
        let fetcher = Arc::new(FakeFetcher {
            network_failures: AtomicU32::new(2),
        });
        let engine = engine(
            SchedulerConfig::default().with_network_retries(2),
            Arc::new(MemoryCache::new()),
            Arc::new(FakeSandbox::default()),
            fetcher,
        );
        let report = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.jobs.fetch, 3);
    }

    const FLOATING: &[(&str, &str)] = &[
        ("a", "kind: import\nsources:\n- {kind: local, location: a, track: main}\n"),
        ("b", "kind: manual\nbuild-depends: [a]\n"),
    ];

    #[tokio::test]
    async fn test_unpinned_sources_need_tracking() {
        let graph = graph(FLOATING, "b");
        let sandbox = Arc::new(FakeSandbox::default());
        let engine = engine(
            SchedulerConfig::default(),
            Arc::new(MemoryCache::new()),
            Arc::clone(&sandbox),
            Arc::new(FakeFetcher::default()),
        );
        let report = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert!(matches!(report.status, RunStatus::NeedsTracking { .. }));
        assert!(sandbox.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_with_tracking() {
        let graph = graph(FLOATING, "b");
        let engine = engine(
            SchedulerConfig::default().with_track(true),
            Arc::new(MemoryCache::new()),
            Arc::new(FakeSandbox::default()),
            Arc::new(FakeFetcher::default()),
        );
        let report = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(
            report.tracked.get(&ElementId::new("a")),
            Some(&vec![Some("v2".to_string())])
        );
    }

    #[tokio::test]
    async fn test_track_only() {
        let graph = graph(FLOATING, "b");
        let sandbox = Arc::new(FakeSandbox::default());
        let engine = engine(
            SchedulerConfig::default(),
            Arc::new(MemoryCache::new()),
            Arc::clone(&sandbox),
            Arc::new(FakeFetcher::default()),
        );
        let report = engine
            .track(&graph, &[ElementId::new("a")], &TrackedRefs::new())
            .await
            .unwrap();
        assert_eq!(report.jobs.total(), 1);
        assert_eq!(report.find("a").unwrap().state, ElementState::Tracked);
        assert_eq!(report.tracked.len(), 1);
        assert!(sandbox.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_terminates_run() {
        let graph = graph(ABC, "a");
        let token = CancellationToken::new();
        let sandbox = Arc::new(FakeSandbox {
            hang: Some("a"),
            ..FakeSandbox::default()
        });
        let engine = engine(
            SchedulerConfig::default(),
            Arc::new(MemoryCache::new()),
            sandbox,
            Arc::new(FakeFetcher::default()),
        )
        .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(5), engine.build(&graph, &TrackedRefs::new()))
            .await
            .unwrap()
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(report.status, RunStatus::Terminated);
        assert!(report.find("a").unwrap().state.is_unsuccessful());
    }

    const PAIR: &[(&str, &str)] = &[("x", "kind: manual\n"), ("y", "kind: manual\n")];

    #[tokio::test]
    async fn test_terminate_cancels_running_builds() {
        let graph = graph_of(PAIR, &["x", "y"]);
        let sandbox = Arc::new(FakeSandbox {
            fail: Some("x"),
            hang: Some("y"),
            ..FakeSandbox::default()
        });
        let engine = engine(
            SchedulerConfig::default().with_on_error(OnError::Terminate),
            Arc::new(MemoryCache::new()),
            Arc::clone(&sandbox),
            Arc::new(FakeFetcher::default()),
        );

        let report = tokio::time::timeout(Duration::from_secs(5), engine.build(&graph, &TrackedRefs::new()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.status, RunStatus::Terminated);
        assert_eq!(report.find("x").unwrap().state, ElementState::Failed);
        let y = report.find("y").unwrap();
        assert_eq!(y.state, ElementState::Failed);
        assert!(y.error.as_deref().unwrap().contains("cancel"));
        assert_eq!(report.jobs.push, 0);
        assert_eq!(sandbox.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_excluded_element_is_taken_from_cache() {
        let graph = graph(ABC, "c");
        let cache = Arc::new(MemoryCache::new());
        let sandbox = Arc::new(FakeSandbox::default());
        let engine = engine(
            SchedulerConfig::default(),
            Arc::clone(&cache),
            Arc::clone(&sandbox),
            Arc::new(FakeFetcher::default()),
        );
        let excluded = [ElementId::new("b")];

        let missing = engine
            .build_excluding(&graph, &TrackedRefs::new(), &excluded)
            .await
            .unwrap();
        assert_eq!(missing.find("b").unwrap().state, ElementState::Skipped);
        assert_eq!(missing.find("c").unwrap().state, ElementState::Skipped);
        assert!(sandbox.requests.lock().unwrap().is_empty());

        engine.build(&graph_of(ABC, &["b"]), &TrackedRefs::new()).await.unwrap();
        let report = engine
            .build_excluding(&graph, &TrackedRefs::new(), &excluded)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.find("b").unwrap().state, ElementState::Cached);
        assert_eq!(report.find("c").unwrap().state, ElementState::Built);
        assert!(report.find("a").is_none());
    }

    #[tokio::test]
    async fn test_zero_sized_pool_is_rejected() {
        let graph = graph(ABC, "c");
        let engine = engine(
            SchedulerConfig::default().with_fetchers(0),
            Arc::new(MemoryCache::new()),
            Arc::new(FakeSandbox::default()),
            Arc::new(FakeFetcher::default()),
        );
        let err = engine.build(&graph, &TrackedRefs::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(PoolSizeError { pool: "fetchers" })));
        assert!(engine.track(&graph, &[ElementId::new("a")], &TrackedRefs::new()).await.is_err());
    }
}
