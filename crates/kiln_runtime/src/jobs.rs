//! Jobs: the units of work handed out by the schedule.
//!
//! A [`Job`] names what to do; a [`JobSpec`] carries the owned inputs the
//! engine gathered for it, so running a job touches no shared state other
//! than the collaborators in [`JobContext`].

use crate::sandbox::{SandboxError, SandboxRequest, SandboxRunner};
use crate::source::{FetchError, SourceFetcher};
use kiln_cache::{Artifact, ArtifactCache, ArtifactMeta, CacheError, DependencyRecord};
use kiln_core::{CacheKey, CoreError, ElementId, FileTree};
use kiln_plan::ResolvedElement;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Job identifier, unique within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Kinds of job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Resolve floating source refs
    Track,
    /// Find the element's artifact and copy it from a remote when needed
    Pull,
    /// Retrieve sources
    Fetch,
    /// Run the sandbox
    Build,
    /// Publish the artifact
    Push,
}

impl JobKind {
    /// The pool this kind runs in
    #[must_use]
    pub fn pool(self) -> Pool {
        match self {
            Self::Track | Self::Pull | Self::Fetch => Pool::Fetch,
            Self::Build => Pool::Build,
            Self::Push => Pool::Push,
        }
    }

    /// Whether failures of this kind may be retried
    #[must_use]
    pub fn is_network(self) -> bool {
        !matches!(self, Self::Build)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Track => "track",
            Self::Pull => "pull",
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::Push => "push",
        };
        write!(f, "{}", s)
    }
}

/// Worker pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Track, pull and fetch
    Fetch,
    /// Build
    Build,
    /// Push
    Push,
}

impl Pool {
    /// Every pool
    pub const ALL: [Pool; 3] = [Pool::Fetch, Pool::Build, Pool::Push];
}

/// One unit of scheduled work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Identifier
    pub id: JobId,
    /// What to do
    pub kind: JobKind,
    /// Which element
    pub element: ElementId,
    /// Starts at 1; retries increment it
    pub attempt: u32,
}

/// What a successful job produced
#[derive(Debug, Clone, PartialEq)]
pub enum JobDone {
    /// A ref per source
    Tracked(Vec<Option<String>>),
    /// The key that hit, if any
    Pulled(Option<CacheKey>),
    /// Staged source tree
    Fetched(FileTree),
    /// The new artifact
    Built(Box<Artifact>),
    /// Published
    Pushed,
}

/// Job errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Source tracking or fetching failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The sandbox failed
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The cache failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Invalid tree path while staging
    #[error(transparent)]
    Tree(#[from] CoreError),

    /// Something the job needs was not produced
    #[error("missing {0}")]
    MissingInput(String),

    /// The job panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    /// Whether retrying could help
    #[must_use]
    pub fn is_network(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_network(),
            Self::Cache(e) => e.is_network(),
            _ => false,
        }
    }
}

/// Collaborators shared by every job of a run
#[derive(Clone)]
pub struct JobContext {
    /// Artifact cache
    pub cache: Arc<dyn ArtifactCache>,
    /// Sandbox runner
    pub sandbox: Arc<dyn SandboxRunner>,
    /// Source fetcher
    pub fetcher: Arc<dyn SourceFetcher>,
    /// Fires when the run is terminated
    pub cancel: CancellationToken,
}

/// A job's owned inputs
#[derive(Debug, Clone)]
pub enum JobSpec {
    /// Track every source of the element
    Track {
        /// The element
        element: Arc<ResolvedElement>,
    },
    /// Make the element's artifact available locally
    Pull {
        /// Strong key
        strong: CacheKey,
        /// Weak key, in non-strict runs
        weak: Option<CacheKey>,
    },
    /// Fetch every source at its ref
    Fetch {
        /// The element
        element: Arc<ResolvedElement>,
        /// Effective ref per source
        refs: Vec<String>,
    },
    /// Build the element
    Build {
        /// The element
        element: Arc<ResolvedElement>,
        /// Fetched sources
        sources: FileTree,
        /// Build scope with the key each artifact is stored under
        dependencies: Vec<(ElementId, CacheKey)>,
        /// Strong key
        strong: CacheKey,
        /// Weak key
        weak: CacheKey,
    },
    /// Publish under both keys
    Push {
        /// The artifact
        artifact: Box<Artifact>,
    },
}

impl JobSpec {
    /// Run to completion or cancellation
    ///
    /// # Errors
    ///
    /// Returns the job's failure
    pub async fn run(self, ctx: JobContext) -> Result<JobDone, JobError> {
        let cancel = ctx.cancel.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(JobError::Cancelled),
            result = self.execute(ctx) => result,
        }
    }

    async fn execute(self, ctx: JobContext) -> Result<JobDone, JobError> {
        match self {
            Self::Track { element } => track(&element, ctx.fetcher.as_ref()).await,
            Self::Pull { strong, weak } => pull(ctx.cache.as_ref(), strong, weak).await,
            Self::Fetch { element, refs } => fetch(&element, &refs, ctx.fetcher.as_ref()).await,
            Self::Build {
                element,
                sources,
                dependencies,
                strong,
                weak,
            } => {
                build(
                    &element,
                    sources,
                    &dependencies,
                    (strong, weak),
                    &ctx,
                )
                .await
            }
            Self::Push { artifact } => push(ctx.cache.as_ref(), &artifact).await,
        }
    }
}

async fn track(element: &ResolvedElement, fetcher: &dyn SourceFetcher) -> Result<JobDone, JobError> {
    let mut refs = Vec::with_capacity(element.sources().len());
    for source in element.sources() {
        let reference = fetcher.track(source).await?;
        tracing::info!(element = %element.id(), location = %source.location, reference = %reference, "tracked source");
        refs.push(Some(reference));
    }
    Ok(JobDone::Tracked(refs))
}

/// Strong key first; the weak key is tried only in non-strict runs
async fn pull(cache: &dyn ArtifactCache, strong: CacheKey, weak: Option<CacheKey>) -> Result<JobDone, JobError> {
    if cache.pull(&strong).await? {
        return Ok(JobDone::Pulled(Some(strong)));
    }
    if let Some(weak) = weak
        && cache.pull(&weak).await?
    {
        return Ok(JobDone::Pulled(Some(weak)));
    }
    Ok(JobDone::Pulled(None))
}

async fn fetch(element: &ResolvedElement, refs: &[String], fetcher: &dyn SourceFetcher) -> Result<JobDone, JobError> {
    let mut staged = FileTree::new();
    for (source, reference) in element.sources().iter().zip(refs) {
        let tree = fetcher.fetch(source, reference).await?;
        let tree = match &source.directory {
            Some(dir) => tree.prefixed(dir)?,
            None => tree,
        };
        staged.overlay(&tree);
    }
    tracing::debug!(element = %element.id(), files = staged.len(), "fetched sources");
    Ok(JobDone::Fetched(staged))
}

async fn build(
    element: &ResolvedElement,
    sources: FileTree,
    dependencies: &[(ElementId, CacheKey)],
    (strong, weak): (CacheKey, CacheKey),
    ctx: &JobContext,
) -> Result<JobDone, JobError> {
    let mut root = FileTree::new();
    let mut records = Vec::with_capacity(dependencies.len());
    for (dep, key) in dependencies {
        let artifact = ctx.cache.retrieve(key).await?;
        root.overlay(&artifact.files);
        records.push(DependencyRecord {
            element: dep.to_string(),
            key: *key,
        });
    }

    let plan = element.build_plan();
    let request = SandboxRequest {
        element: element.id().to_string(),
        root,
        sources,
        source_directory: plan.source_directory,
        output_directory: plan.output_directory,
        commands: plan.commands,
        environment: plan.environment,
    };
    let output = ctx.sandbox.run(request, ctx.cancel.clone()).await?;

    let mut meta = ArtifactMeta::new(element.name(), strong, weak);
    meta.variant = element.id().variant().map(str::to_string);
    meta.dependencies = records;
    meta.public = element.public().clone();
    meta.build_log = output.log;
    tracing::info!(element = %element.id(), key = %strong.short(), files = output.files.len(), "built");
    Ok(JobDone::Built(Box::new(Artifact::new(meta, output.files))))
}

async fn push(cache: &dyn ArtifactCache, artifact: &Artifact) -> Result<JobDone, JobError> {
    let mut keys = vec![artifact.meta.strong_key];
    if artifact.meta.weak_key != artifact.meta.strong_key {
        keys.push(artifact.meta.weak_key);
    }
    for key in keys {
        match cache.store(&key, artifact).await {
            Ok(()) => {}
            Err(CacheError::Conflict { .. }) => {
                tracing::debug!(key = %key.short(), "artifact already cached");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(JobDone::Pushed)
}
