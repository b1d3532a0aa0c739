//! The schedule: element states, job queues and pool bounds.
//!
//! The schedule does no I/O. It hands out [`Job`]s through
//! [`Schedule::next_jobs`] and is advanced only by
//! [`Schedule::complete`], so every transition happens on one owner and
//! readiness checks always see a consistent table.
//!
//! Planning is demand driven: the targets and their runtime closure are
//! required from the start, and an element that misses the cache makes its
//! build scope required. Elements never required get no jobs.

use crate::config::{OnError, SchedulerConfig};
use crate::jobs::{Job, JobDone, JobError, JobId, JobKind, Pool};
use crate::report::{BuildReport, ElementReport, JobCounts, RunStatus};
use crate::state::ElementState;
use indexmap::IndexMap;
use kiln_cache::{CacheKeyEngine, KeyState, KeyTable, PendingReason, TrackedRefs, key_dependencies};
use kiln_core::{CacheKey, CoreResult, ElementId, RunId};
use kiln_plan::{ElementGraph, ResolvedElement, Scope};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Build,
    Track,
}

#[derive(Debug)]
struct Entry {
    element: Arc<ResolvedElement>,
    state: ElementState,
    required: bool,
    build_scope: Vec<ElementId>,
    key_deps: Vec<ElementId>,
    dependents: Vec<ElementId>,
    artifact_key: Option<CacheKey>,
    error: Option<String>,
}

/// Job state table for one run
#[derive(Debug)]
pub struct Schedule {
    config: SchedulerConfig,
    mode: Mode,
    graph: ElementGraph,
    keys: KeyTable,
    key_engine: CacheKeyEngine,
    tracked: TrackedRefs,
    entries: IndexMap<ElementId, Entry>,
    queues: HashMap<Pool, VecDeque<Job>>,
    running: HashMap<JobId, Job>,
    next_id: u64,
    counts: JobCounts,
    stopping: bool,
    terminated: bool,
    blocked: Option<Vec<ElementId>>,
    excluded: HashSet<ElementId>,
}

impl Schedule {
    /// Plan a build of the graph's targets
    ///
    /// # Errors
    ///
    /// Returns error if a key record cannot be encoded
    pub fn build(
        graph: &ElementGraph,
        config: SchedulerConfig,
        key_engine: CacheKeyEngine,
        tracked: TrackedRefs,
    ) -> CoreResult<Self> {
        let mut schedule = Self::new(graph, config, key_engine, tracked, Mode::Build)?;
        schedule.begin_build();
        Ok(schedule)
    }

    /// Plan tracking of `elements`
    ///
    /// # Errors
    ///
    /// Returns error if a key record cannot be encoded
    pub fn track(
        graph: &ElementGraph,
        elements: &[ElementId],
        config: SchedulerConfig,
        key_engine: CacheKeyEngine,
        tracked: TrackedRefs,
    ) -> CoreResult<Self> {
        let mut schedule = Self::new(graph, config, key_engine, tracked, Mode::Track)?;
        for id in elements {
            let Some(entry) = schedule.entries.get_mut(id) else {
                continue;
            };
            entry.required = true;
            if entry.element.sources().is_empty() {
                entry.state = ElementState::Tracked;
            } else {
                entry.state = ElementState::Tracking;
                schedule.enqueue(JobKind::Track, id.clone(), 1);
            }
        }
        Ok(schedule)
    }

    /// Never build `elements`; they finish only from the cache
    #[must_use]
    pub fn excluding(mut self, elements: impl IntoIterator<Item = ElementId>) -> Self {
        self.excluded.extend(elements);
        self
    }

    fn new(
        graph: &ElementGraph,
        config: SchedulerConfig,
        key_engine: CacheKeyEngine,
        tracked: TrackedRefs,
        mode: Mode,
    ) -> CoreResult<Self> {
        let keys = KeyTable::fold(graph, &key_engine, &tracked)?;

        let mut entries: IndexMap<ElementId, Entry> = graph
            .iter()
            .map(|element| {
                let ids = |deps: Vec<Arc<ResolvedElement>>| deps.iter().map(|d| d.id().clone()).collect();
                let entry = Entry {
                    element: Arc::clone(element),
                    state: ElementState::Inactive,
                    required: false,
                    build_scope: ids(element.build_scope()),
                    key_deps: ids(key_dependencies(element)),
                    dependents: Vec::new(),
                    artifact_key: None,
                    error: None,
                };
                (element.id().clone(), entry)
            })
            .collect();

        let edges: Vec<(ElementId, ElementId)> = entries
            .iter()
            .flat_map(|(id, entry)| entry.key_deps.iter().map(move |dep| (dep.clone(), id.clone())))
            .collect();
        for (dep, dependent) in edges {
            if let Some(entry) = entries.get_mut(&dep) {
                entry.dependents.push(dependent);
            }
        }

        Ok(Self {
            config,
            mode,
            graph: graph.clone(),
            keys,
            key_engine,
            tracked,
            entries,
            queues: HashMap::new(),
            running: HashMap::new(),
            next_id: 0,
            counts: JobCounts::default(),
            stopping: false,
            terminated: false,
            blocked: None,
            excluded: HashSet::new(),
        })
    }

    fn begin_build(&mut self) {
        let unpinned: Vec<ElementId> = self
            .keys
            .pending()
            .filter(|(_, reason)| matches!(reason, PendingReason::UnpinnedSources { .. }))
            .map(|(id, _)| id.clone())
            .collect();

        if !unpinned.is_empty() {
            if !self.config.track {
                tracing::warn!(elements = unpinned.len(), "sources need tracking; nothing scheduled");
                self.blocked = Some(unpinned);
                return;
            }
            for id in &unpinned {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.state = ElementState::Tracking;
                }
                self.enqueue(JobKind::Track, id.clone(), 1);
            }
        }

        let required: Vec<ElementId> = ElementGraph::scope(self.graph.targets(), Scope::Run)
            .iter()
            .map(|e| e.id().clone())
            .collect();
        for id in &required {
            self.activate(id);
        }
    }

    fn enqueue(&mut self, kind: JobKind, element: ElementId, attempt: u32) {
        self.next_id += 1;
        let job = Job {
            id: JobId(self.next_id),
            kind,
            element,
            attempt,
        };
        self.queues.entry(kind.pool()).or_default().push_back(job);
    }

    fn set_state(&mut self, id: &ElementId, state: ElementState) {
        if let Some(entry) = self.entries.get_mut(id) {
            tracing::trace!(element = %id, from = %entry.state, to = %state, "transition");
            entry.state = state;
        }
    }

    /// Mark an element required and start it moving
    fn activate(&mut self, id: &ElementId) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.required {
            return;
        }
        entry.required = true;
        if entry.state == ElementState::Inactive {
            self.advance_key(id);
        }
    }

    /// Move a required element forward once its key may be known
    fn advance_key(&mut self, id: &ElementId) {
        if self.has_key(id) {
            self.set_state(id, ElementState::Querying);
            self.enqueue(JobKind::Pull, id.clone(), 1);
            return;
        }
        match self.unresolvable_dependency(id) {
            Some(dep) => self.skip(id, &dep),
            None => self.set_state(id, ElementState::KeyPending),
        }
    }

    /// An unsuccessful key dependency whose own key will never be known
    fn unresolvable_dependency(&self, id: &ElementId) -> Option<ElementId> {
        let entry = self.entries.get(id)?;
        entry
            .key_deps
            .iter()
            .find(|dep| self.is_unsuccessful(dep) && !self.has_key(dep))
            .cloned()
    }

    /// An unsuccessful member of the build scope
    fn unbuildable_dependency(&self, id: &ElementId) -> Option<ElementId> {
        let entry = self.entries.get(id)?;
        entry.build_scope.iter().find(|dep| self.is_unsuccessful(dep)).cloned()
    }

    fn is_unsuccessful(&self, id: &ElementId) -> bool {
        self.state(id).is_some_and(ElementState::is_unsuccessful)
    }

    fn has_key(&self, id: &ElementId) -> bool {
        matches!(self.keys.get(id), Some(KeyState::Ready { .. }))
    }

    fn fail(&mut self, id: &ElementId, reason: String) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = ElementState::Failed;
            entry.error = Some(reason);
        }
        self.propagate(id);
    }

    fn skip(&mut self, id: &ElementId, cause: &ElementId) {
        tracing::info!(element = %id, cause = %cause, "skipped");
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = ElementState::Skipped;
            entry.error = Some(format!("dependency '{}' did not complete", cause));
        }
        self.propagate(id);
    }

    /// Whether `failed` leaves the required element `id` no way to finish
    ///
    /// Elements still querying the cache are decided by the query; a miss
    /// is checked again in [`Self::cache_miss`].
    fn is_blocked_by(&self, id: &ElementId, failed: &ElementId) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        if !entry.required {
            return false;
        }
        match entry.state {
            ElementState::Fetching | ElementState::Waiting => entry.build_scope.contains(failed),
            ElementState::KeyPending => entry.key_deps.contains(failed) && !self.has_key(failed),
            _ => false,
        }
    }

    /// Skip every transitive dependent that can no longer finish without `root`
    fn propagate(&mut self, root: &ElementId) {
        let mut stack = vec![root.clone()];
        while let Some(current) = stack.pop() {
            let dependents = self
                .entries
                .get(&current)
                .map(|e| e.dependents.clone())
                .unwrap_or_default();
            for dependent in dependents {
                if !self.is_blocked_by(&dependent, &current) {
                    continue;
                }
                tracing::info!(element = %dependent, cause = %root, "skipped");
                if let Some(entry) = self.entries.get_mut(&dependent) {
                    entry.state = ElementState::Skipped;
                    entry.error = Some(format!("dependency '{}' did not complete", root));
                }
                stack.push(dependent);
            }
        }
    }

    fn cache_miss(&mut self, id: &ElementId) {
        if self.excluded.contains(id) {
            tracing::info!(element = %id, "excluded element is not cached");
            if let Some(entry) = self.entries.get_mut(id) {
                entry.state = ElementState::Skipped;
                entry.error = Some("excluded from the build and not cached".to_string());
            }
            self.propagate(id);
            return;
        }
        let scope = self
            .entries
            .get(id)
            .map(|e| e.build_scope.clone())
            .unwrap_or_default();
        for dep in &scope {
            self.activate(dep);
        }
        if self.state(id).is_none_or(ElementState::is_terminal) {
            return;
        }
        if let Some(dep) = self.unbuildable_dependency(id) {
            self.skip(id, &dep);
            return;
        }
        let has_sources = self
            .entries
            .get(id)
            .is_some_and(|e| !e.element.sources().is_empty());
        if has_sources {
            self.set_state(id, ElementState::Fetching);
            self.enqueue(JobKind::Fetch, id.clone(), 1);
        } else {
            self.set_state(id, ElementState::Waiting);
            self.try_build(id);
        }
    }

    fn try_build(&mut self, id: &ElementId) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        if entry.state != ElementState::Waiting {
            return;
        }
        let ready = entry
            .build_scope
            .iter()
            .all(|dep| self.state(dep).is_some_and(ElementState::is_done));
        if ready {
            self.set_state(id, ElementState::Building);
            self.enqueue(JobKind::Build, id.clone(), 1);
        }
    }

    /// An artifact became available; wake dependents waiting to build
    fn release(&mut self, id: &ElementId) {
        let dependents = self
            .entries
            .get(id)
            .map(|e| e.dependents.clone())
            .unwrap_or_default();
        for dependent in &dependents {
            self.try_build(dependent);
        }
    }

    fn sources_tracked(&mut self, id: &ElementId, refs: Vec<Option<String>>) -> CoreResult<()> {
        self.tracked.insert(id.clone(), refs);
        let changed = self
            .keys
            .refresh(&self.graph, &self.key_engine, &self.tracked, id)?;

        match self.mode {
            Mode::Track => self.set_state(id, ElementState::Tracked),
            Mode::Build => {
                self.set_state(id, ElementState::Inactive);
                if self.entries.get(id).is_some_and(|e| e.required) {
                    self.advance_key(id);
                }
                for other in &changed {
                    let waiting = self
                        .entries
                        .get(other)
                        .is_some_and(|e| e.required && e.state == ElementState::KeyPending);
                    if waiting {
                        self.advance_key(other);
                    }
                }
            }
        }
        Ok(())
    }

    /// Jobs to start now, within pool bounds
    ///
    /// Returns nothing once the run is stopping.
    pub fn next_jobs(&mut self) -> Vec<Job> {
        if self.stopping || self.blocked.is_some() {
            return Vec::new();
        }
        let mut started = Vec::new();
        for pool in Pool::ALL {
            let limit = self.limit(pool);
            while self.running_in(pool) < limit {
                let Some(job) = self.queues.get_mut(&pool).and_then(VecDeque::pop_front) else {
                    break;
                };
                if self.state(&job.element).is_none_or(ElementState::is_terminal) {
                    continue;
                }
                self.counts.record(job.kind);
                self.running.insert(job.id, job.clone());
                started.push(job);
            }
        }
        started
    }

    fn limit(&self, pool: Pool) -> usize {
        match pool {
            Pool::Fetch => self.config.fetchers,
            Pool::Build => self.config.builders,
            Pool::Push => self.config.pushers,
        }
    }

    fn running_in(&self, pool: Pool) -> usize {
        self.running.values().filter(|j| j.kind.pool() == pool).count()
    }

    /// Record a job's result
    ///
    /// # Errors
    ///
    /// Returns error if keys cannot be recomputed after tracking
    pub fn complete(&mut self, job: &Job, result: &Result<JobDone, JobError>) -> CoreResult<()> {
        self.running.remove(&job.id);
        if self.state(&job.element).is_none_or(ElementState::is_terminal) {
            tracing::debug!(job = %job.id, element = %job.element, "result for finished element ignored");
            return Ok(());
        }
        match result {
            Err(error) => {
                self.job_failed(job, error);
                Ok(())
            }
            Ok(done) => self.job_succeeded(job, done),
        }
    }

    fn job_failed(&mut self, job: &Job, error: &JobError) {
        if job.kind.is_network() && error.is_network() && job.attempt <= self.config.network_retries {
            tracing::warn!(
                kind = %job.kind,
                element = %job.element,
                attempt = job.attempt,
                error = %error,
                "retrying"
            );
            self.enqueue(job.kind, job.element.clone(), job.attempt + 1);
            return;
        }

        tracing::error!(kind = %job.kind, element = %job.element, error = %error, "job failed");
        self.fail(&job.element, format!("{} failed: {}", job.kind, error));
        match self.config.on_error {
            OnError::Continue => {}
            OnError::Quit => self.stopping = true,
            OnError::Terminate => self.terminate(),
        }
    }

    fn job_succeeded(&mut self, job: &Job, done: &JobDone) -> CoreResult<()> {
        let id = &job.element;
        match (job.kind, done) {
            (JobKind::Track, JobDone::Tracked(refs)) => self.sources_tracked(id, refs.clone())?,
            (JobKind::Pull, JobDone::Pulled(Some(key))) => {
                tracing::info!(element = %id, key = %key.short(), "cached");
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.artifact_key = Some(*key);
                }
                self.set_state(id, ElementState::Cached);
                self.release(id);
            }
            (JobKind::Pull, JobDone::Pulled(None)) => {
                tracing::debug!(element = %id, "cache miss");
                self.cache_miss(id);
            }
            (JobKind::Fetch, JobDone::Fetched(_)) => {
                self.set_state(id, ElementState::Waiting);
                self.try_build(id);
            }
            (JobKind::Build, JobDone::Built(_)) => {
                self.set_state(id, ElementState::Pushing);
                self.enqueue(JobKind::Push, id.clone(), 1);
            }
            (JobKind::Push, JobDone::Pushed) => {
                let key = self.keys.strong(id);
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.artifact_key = key;
                }
                self.set_state(id, ElementState::Built);
                self.release(id);
            }
            (kind, _) => {
                self.fail(id, format!("{} job returned an unexpected result", kind));
            }
        }
        Ok(())
    }

    /// Stop admitting jobs and mark the run terminated
    pub fn terminate(&mut self) {
        self.stopping = true;
        self.terminated = true;
    }

    /// Whether the run was terminated
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether nothing is running and nothing more will start
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.running.is_empty()
            && (self.stopping || self.blocked.is_some() || self.queues.values().all(VecDeque::is_empty))
    }

    /// Jobs currently running
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// State of one element
    #[must_use]
    pub fn state(&self, id: &ElementId) -> Option<ElementState> {
        self.entries.get(id).map(|e| e.state)
    }

    /// The resolved element
    #[must_use]
    pub fn element(&self, id: &ElementId) -> Option<&Arc<ResolvedElement>> {
        self.entries.get(id).map(|e| &e.element)
    }

    /// Build scope of an element
    #[must_use]
    pub fn build_scope(&self, id: &ElementId) -> &[ElementId] {
        self.entries.get(id).map_or(&[], |e| e.build_scope.as_slice())
    }

    /// Key the element's artifact is available under
    #[must_use]
    pub fn artifact_key(&self, id: &ElementId) -> Option<CacheKey> {
        self.entries.get(id).and_then(|e| e.artifact_key)
    }

    /// Current keys
    #[must_use]
    pub fn keys(&self) -> &KeyTable {
        &self.keys
    }

    /// Refs known so far, tracked ones included
    #[must_use]
    pub fn tracked(&self) -> &TrackedRefs {
        &self.tracked
    }

    /// Run configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Jobs started so far
    #[must_use]
    pub fn counts(&self) -> JobCounts {
        self.counts
    }

    /// Close the run and summarize it
    #[must_use]
    pub fn finish(mut self, run_id: RunId, initial: &TrackedRefs) -> BuildReport {
        let tracked: TrackedRefs = self
            .tracked
            .iter()
            .filter(|(id, refs)| initial.get(*id) != Some(*refs))
            .map(|(id, refs)| (id.clone(), refs.clone()))
            .collect();

        if let Some(elements) = self.blocked.take() {
            return BuildReport {
                run_id,
                status: RunStatus::NeedsTracking { elements },
                elements: Vec::new(),
                jobs: self.counts,
                tracked,
            };
        }

        for entry in self.entries.values_mut() {
            if entry.required && !entry.state.is_terminal() {
                entry.state = ElementState::Skipped;
                entry.error = Some("run stopped before completion".to_string());
            }
        }

        let elements: Vec<ElementReport> = self
            .entries
            .iter()
            .filter(|(_, e)| e.required || e.state != ElementState::Inactive)
            .map(|(id, e)| ElementReport {
                element: id.clone(),
                state: e.state,
                key: e.artifact_key.or_else(|| self.keys.strong(id)),
                error: e.error.clone(),
            })
            .collect();

        let unsuccessful = elements.iter().any(|e| e.state.is_unsuccessful());
        let built = elements.iter().any(|e| e.state == ElementState::Built);
        let status = if self.terminated {
            RunStatus::Terminated
        } else if !unsuccessful {
            RunStatus::Success
        } else if built {
            RunStatus::PartialFailure
        } else {
            RunStatus::Failed
        };

        BuildReport {
            run_id,
            status,
            elements,
            jobs: self.counts,
            tracked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxError;
    use crate::source::FetchError;
    use kiln_cache::{Artifact, ArtifactMeta, CacheError};
    use kiln_core::FileTree;
    use kiln_plan::{DescriptorStore, ElementDescriptor, KindRegistry, Loader, ProjectConfig};
    use proptest::prelude::*;

    fn graph(docs: &[(&str, &str)], targets: &[&str]) -> ElementGraph {
        let store = DescriptorStore::from_descriptors(
            ProjectConfig::new("t"),
            docs.iter()
                .map(|(n, y)| ElementDescriptor::from_yaml(*n, y).unwrap()),
        )
        .unwrap();
        let kinds = KindRegistry::with_builtins();
        let targets: Vec<ElementId> = targets.iter().map(|t| ElementId::new(*t)).collect();
        Loader::new(&store, &kinds).load(&targets).unwrap()
    }

    const ABC: &[(&str, &str)] = &[
        ("a", "kind: import\nsources:\n- {kind: local, location: a, ref: r1}\n"),
        ("b", "kind: manual\nbuild-depends: [a]\n"),
        ("c", "kind: manual\nbuild-depends: [b]\n"),
    ];

    fn schedule(graph: &ElementGraph, config: SchedulerConfig) -> Schedule {
        Schedule::build(graph, config, CacheKeyEngine::new(), TrackedRefs::new()).unwrap()
    }

    fn built() -> JobDone {
        let key = CacheKey::digest(b"x");
        JobDone::Built(Box::new(Artifact::new(
            ArtifactMeta::new("x", key, key),
            FileTree::new(),
        )))
    }

    fn build_failure() -> JobError {
        JobError::Sandbox(SandboxError::CommandFailed {
            group: "build-commands".into(),
            command: "false".into(),
            status: Some(1),
            log: String::new(),
        })
    }

    fn network_failure() -> JobError {
        JobError::Fetch(FetchError::Network {
            location: "a".into(),
            reason: "reset".into(),
        })
    }

    /// Default responses: every query misses, every job succeeds
    fn ok(job: &Job) -> Result<JobDone, JobError> {
        Ok(match job.kind {
            JobKind::Track => JobDone::Tracked(vec![Some("tracked".into())]),
            JobKind::Pull => JobDone::Pulled(None),
            JobKind::Fetch => JobDone::Fetched(FileTree::new()),
            JobKind::Build => built(),
            JobKind::Push => JobDone::Pushed,
        })
    }

    /// Run to completion one batch at a time, returning every started job
    fn drive(
        schedule: &mut Schedule,
        mut respond: impl FnMut(&Job) -> Result<JobDone, JobError>,
    ) -> Vec<Job> {
        let mut log = Vec::new();
        loop {
            let jobs = schedule.next_jobs();
            if jobs.is_empty() && schedule.is_finished() {
                return log;
            }
            for job in jobs {
                let result = respond(&job);
                schedule.complete(&job, &result).unwrap();
                log.push(job);
            }
        }
    }

    fn jobs_for<'a>(log: &'a [Job], name: &str) -> Vec<JobKind> {
        log.iter()
            .filter(|j| j.element.name() == name)
            .map(|j| j.kind)
            .collect()
    }

    #[test]
    fn test_build_chain_in_order() {
        let graph = graph(ABC, &["c"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default());
        let log = drive(&mut schedule, ok);

        assert_eq!(
            jobs_for(&log, "a"),
            vec![JobKind::Pull, JobKind::Fetch, JobKind::Build, JobKind::Push]
        );
        assert_eq!(jobs_for(&log, "b"), vec![JobKind::Pull, JobKind::Build, JobKind::Push]);

        let builds: Vec<&str> = log
            .iter()
            .filter(|j| j.kind == JobKind::Build)
            .map(|j| j.element.name())
            .collect();
        assert_eq!(builds, vec!["a", "b", "c"]);

        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.status, RunStatus::Success);
        assert!(report.elements.iter().all(|e| e.state == ElementState::Built));
    }

    #[test]
    fn test_failed_build_skips_dependents() {
        let graph = graph(ABC, &["c"]);
        let config = SchedulerConfig::default().with_on_error(OnError::Continue);
        let mut schedule = schedule(&graph, config);
        let log = drive(&mut schedule, |job| {
            if job.kind == JobKind::Build && job.element.name() == "b" {
                Err(build_failure())
            } else {
                ok(job)
            }
        });

        assert_eq!(jobs_for(&log, "c"), vec![JobKind::Pull]);
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.find("a").unwrap().state, ElementState::Built);
        assert_eq!(report.find("b").unwrap().state, ElementState::Failed);
        let c = report.find("c").unwrap();
        assert_eq!(c.state, ElementState::Skipped);
        assert!(c.error.as_deref().unwrap().contains("'b'"));
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.jobs.build, 2);
    }

    const TOOL_AND_APP: &[(&str, &str)] = &[
        ("a", "kind: import\nsources:\n- {kind: local, location: a, ref: r1}\n"),
        ("c", "kind: manual\nbuild-depends: [a]\n"),
    ];

    /// Start the single queued job of `kind` for `name`
    fn start(schedule: &mut Schedule, pending: &mut Vec<Job>, kind: JobKind, name: &str) -> Job {
        pending.extend(schedule.next_jobs());
        let at = pending
            .iter()
            .position(|j| j.kind == kind && j.element.name() == name)
            .unwrap();
        pending.remove(at)
    }

    /// Fail `a` while `c` is still querying the cache
    fn fail_tool_during_query() -> (Schedule, Job) {
        let graph = graph(TOOL_AND_APP, &["a", "c"]);
        let config = SchedulerConfig::default().with_on_error(OnError::Continue);
        let mut schedule = schedule(&graph, config);
        let mut pending = Vec::new();

        let pull_a = start(&mut schedule, &mut pending, JobKind::Pull, "a");
        let pull_c = start(&mut schedule, &mut pending, JobKind::Pull, "c");
        schedule.complete(&pull_a, &Ok(JobDone::Pulled(None))).unwrap();
        let fetch = start(&mut schedule, &mut pending, JobKind::Fetch, "a");
        schedule.complete(&fetch, &ok(&fetch)).unwrap();
        let build = start(&mut schedule, &mut pending, JobKind::Build, "a");
        schedule.complete(&build, &Err(build_failure())).unwrap();

        assert_eq!(schedule.state(&ElementId::new("c")), Some(ElementState::Querying));
        (schedule, pull_c)
    }

    #[test]
    fn test_failed_dependency_leaves_querying_dependent_cached_on_hit() {
        let (mut schedule, pull_c) = fail_tool_during_query();
        let hit = Ok(JobDone::Pulled(Some(CacheKey::digest(b"c"))));
        schedule.complete(&pull_c, &hit).unwrap();
        assert!(schedule.next_jobs().is_empty());
        assert!(schedule.is_finished());

        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.find("a").unwrap().state, ElementState::Failed);
        assert_eq!(report.find("c").unwrap().state, ElementState::Cached);
    }

    #[test]
    fn test_failed_dependency_skips_querying_dependent_on_miss() {
        let (mut schedule, pull_c) = fail_tool_during_query();
        schedule.complete(&pull_c, &Ok(JobDone::Pulled(None))).unwrap();
        assert!(schedule.next_jobs().is_empty());
        assert!(schedule.is_finished());
        assert_eq!(schedule.counts().build, 1);

        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        let c = report.find("c").unwrap();
        assert_eq!(c.state, ElementState::Skipped);
        assert!(c.error.as_deref().unwrap().contains("'a'"));
    }

    #[test]
    fn test_excluded_elements_are_never_built() {
        let graph = graph(ABC, &["c"]);
        let config = SchedulerConfig::default().with_on_error(OnError::Continue);
        let mut schedule = schedule(&graph, config).excluding([ElementId::new("b")]);
        let log = drive(&mut schedule, ok);

        assert_eq!(jobs_for(&log, "b"), vec![JobKind::Pull]);
        assert!(jobs_for(&log, "a").is_empty());
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        let b = report.find("b").unwrap();
        assert_eq!(b.state, ElementState::Skipped);
        assert!(b.error.as_deref().unwrap().contains("excluded"));
        assert_eq!(report.find("c").unwrap().state, ElementState::Skipped);
    }

    #[test]
    fn test_cached_excluded_element_is_used() {
        let graph = graph(ABC, &["c"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default()).excluding([ElementId::new("b")]);
        let log = drive(&mut schedule, |job| match (job.kind, job.element.name()) {
            (JobKind::Pull, "b") => Ok(JobDone::Pulled(Some(CacheKey::digest(b"b")))),
            _ => ok(job),
        });
        assert_eq!(jobs_for(&log, "c"), vec![JobKind::Pull, JobKind::Build, JobKind::Push]);
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn test_cache_hit_short_circuits_subtree() {
        let graph = graph(ABC, &["c"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default());
        let log = drive(&mut schedule, |job| {
            assert_eq!(job.kind, JobKind::Pull);
            Ok(JobDone::Pulled(Some(CacheKey::digest(b"c"))))
        });
        assert_eq!(log.len(), 1);

        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.elements.len(), 1);
        assert_eq!(report.find("c").unwrap().state, ElementState::Cached);
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn test_cached_dependency_is_not_fetched() {
        let graph = graph(ABC, &["c"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default());
        let log = drive(&mut schedule, |job| match (job.kind, job.element.name()) {
            (JobKind::Pull, "b") => Ok(JobDone::Pulled(Some(CacheKey::digest(b"b")))),
            _ => ok(job),
        });
        assert!(jobs_for(&log, "a").is_empty());
        assert_eq!(jobs_for(&log, "b"), vec![JobKind::Pull]);
        assert_eq!(jobs_for(&log, "c"), vec![JobKind::Pull, JobKind::Build, JobKind::Push]);
    }

    #[test]
    fn test_network_jobs_retry() {
        let graph = graph(ABC, &["a"]);
        let mut failures = 2;
        let mut schedule = schedule(&graph, SchedulerConfig::default().with_network_retries(2));
        drive(&mut schedule, |job| {
            if job.kind == JobKind::Fetch && failures > 0 {
                failures -= 1;
                Err(network_failure())
            } else {
                ok(job)
            }
        });
        assert_eq!(schedule.counts().fetch, 3);
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn test_retries_exhausted() {
        let graph = graph(ABC, &["a"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default().with_network_retries(1));
        drive(&mut schedule, |job| {
            if job.kind == JobKind::Push {
                Err(JobError::Cache(CacheError::Unavailable {
                    remote: "r".into(),
                    reason: "down".into(),
                }))
            } else {
                ok(job)
            }
        });
        assert_eq!(schedule.counts().push, 2);
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.find("a").unwrap().state, ElementState::Failed);
    }

    #[test]
    fn test_builds_are_never_retried() {
        let graph = graph(ABC, &["b"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default().with_network_retries(5));
        drive(&mut schedule, |job| {
            if job.kind == JobKind::Build {
                Err(JobError::Cache(CacheError::Unavailable {
                    remote: "r".into(),
                    reason: "down".into(),
                }))
            } else {
                ok(job)
            }
        });
        assert_eq!(schedule.counts().build, 1);
    }

    const PAIR: &[(&str, &str)] = &[("x", "kind: manual\n"), ("y", "kind: manual\n")];

    fn fail_x(job: &Job) -> Result<JobDone, JobError> {
        if job.kind == JobKind::Build && job.element.name() == "x" {
            Err(build_failure())
        } else {
            ok(job)
        }
    }

    #[test]
    fn test_continue_finishes_independent_work() {
        let graph = graph(PAIR, &["x", "y"]);
        let config = SchedulerConfig::default()
            .with_builders(1)
            .with_on_error(OnError::Continue);
        let mut schedule = schedule(&graph, config);
        drive(&mut schedule, fail_x);
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.find("y").unwrap().state, ElementState::Built);
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn test_quit_stops_admitting_jobs() {
        let graph = graph(PAIR, &["x", "y"]);
        let config = SchedulerConfig::default()
            .with_builders(1)
            .with_on_error(OnError::Quit);
        let mut schedule = schedule(&graph, config);
        drive(&mut schedule, fail_x);
        assert_eq!(schedule.counts().build, 1);
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.find("y").unwrap().state, ElementState::Skipped);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[test]
    fn test_pool_bounds() {
        let docs: Vec<(String, String)> = (0..6)
            .map(|i| (format!("e{}", i), "kind: manual\n".to_string()))
            .collect();
        let docs: Vec<(&str, &str)> = docs.iter().map(|(n, y)| (n.as_str(), y.as_str())).collect();
        let names: Vec<&str> = docs.iter().map(|(n, _)| *n).collect();
        let graph = graph(&docs, &names);
        let mut schedule = schedule(&graph, SchedulerConfig::default().with_fetchers(2));

        let first = schedule.next_jobs();
        assert_eq!(first.len(), 2);
        assert!(schedule.next_jobs().is_empty());
        let hit = Ok(JobDone::Pulled(Some(CacheKey::digest(b"hit"))));
        schedule.complete(&first[0], &hit).unwrap();
        let next = schedule.next_jobs();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].kind, JobKind::Pull);
    }

    const FLOATING: &[(&str, &str)] = &[
        ("a", "kind: import\nsources:\n- {kind: local, location: a, track: main}\n"),
        ("b", "kind: manual\nbuild-depends: [a]\n"),
    ];

    #[test]
    fn test_unpinned_sources_block_the_run() {
        let graph = graph(FLOATING, &["b"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default());
        assert!(schedule.next_jobs().is_empty());
        assert!(schedule.is_finished());
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(
            report.status,
            RunStatus::NeedsTracking {
                elements: vec![ElementId::new("a")]
            }
        );
        assert_eq!(report.jobs.total(), 0);
    }

    #[test]
    fn test_tracking_unblocks_keys() {
        let graph = graph(FLOATING, &["b"]);
        let mut schedule = schedule(&graph, SchedulerConfig::default().with_track(true));
        assert_eq!(schedule.state(&ElementId::new("b")), Some(ElementState::KeyPending));

        let log = drive(&mut schedule, ok);
        assert_eq!(log[0].kind, JobKind::Track);
        assert_eq!(
            jobs_for(&log, "a"),
            vec![JobKind::Track, JobKind::Pull, JobKind::Fetch, JobKind::Build, JobKind::Push]
        );

        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(
            report.tracked.get(&ElementId::new("a")),
            Some(&vec![Some("tracked".to_string())])
        );
    }

    #[test]
    fn test_failed_tracking_skips_pending_dependents() {
        let graph = graph(FLOATING, &["b"]);
        let config = SchedulerConfig::default()
            .with_track(true)
            .with_network_retries(0);
        let mut schedule = schedule(&graph, config);
        drive(&mut schedule, |job| {
            if job.kind == JobKind::Track {
                Err(network_failure())
            } else {
                ok(job)
            }
        });
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert_eq!(report.find("a").unwrap().state, ElementState::Failed);
        assert_eq!(report.find("b").unwrap().state, ElementState::Skipped);
    }

    #[test]
    fn test_track_only_run() {
        let graph = graph(FLOATING, &["b"]);
        let ids = [ElementId::new("a"), ElementId::new("b")];
        let mut schedule = Schedule::track(
            &graph,
            &ids,
            SchedulerConfig::default(),
            CacheKeyEngine::new(),
            TrackedRefs::new(),
        )
        .unwrap();
        let log = drive(&mut schedule, ok);
        assert_eq!(log.len(), 1);
        assert!(schedule.keys().strong(&ElementId::new("b")).is_some());
        let report = schedule.finish(RunId::new(), &TrackedRefs::new());
        assert!(report.elements.iter().all(|e| e.state == ElementState::Tracked));
        assert_eq!(report.tracked.len(), 1);
    }

    fn chain(len: usize) -> ElementGraph {
        let docs: Vec<(String, String)> = (0..len)
            .map(|i| {
                let yaml = if i == 0 {
                    "kind: manual\n".to_string()
                } else {
                    format!("kind: manual\nbuild-depends: [e{}]\n", i - 1)
                };
                (format!("e{}", i), yaml)
            })
            .collect();
        let docs: Vec<(&str, &str)> = docs.iter().map(|(n, y)| (n.as_str(), y.as_str())).collect();
        let target = format!("e{}", len - 1);
        graph(&docs, &[target.as_str()])
    }

    proptest! {
        #[test]
        fn prop_failure_splits_chain(len in 1usize..7, fail_at in 0usize..7) {
            let fail_at = fail_at % len;
            let graph = chain(len);
            let config = SchedulerConfig::default().with_on_error(OnError::Continue);
            let mut schedule = schedule(&graph, config);
            let failing = format!("e{}", fail_at);
            drive(&mut schedule, |job| {
                if job.kind == JobKind::Build && job.element.name() == failing {
                    Err(build_failure())
                } else {
                    ok(job)
                }
            });
            let report = schedule.finish(RunId::new(), &TrackedRefs::new());
            for i in 0..len {
                let state = report.find(&format!("e{}", i)).unwrap().state;
                let expected = match i.cmp(&fail_at) {
                    std::cmp::Ordering::Less => ElementState::Built,
                    std::cmp::Ordering::Equal => ElementState::Failed,
                    std::cmp::Ordering::Greater => ElementState::Skipped,
                };
                prop_assert_eq!(state, expected);
            }
        }
    }
}
