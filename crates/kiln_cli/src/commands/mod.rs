//! Subcommands and the state they share.

pub mod build;
pub mod checkout;
pub mod shell;
pub mod show;
pub mod track;

use crate::config::UserConfig;
use crate::host::HostSandbox;
use crate::local_source::{LOCAL_KIND, LocalSourceFetcher};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use console::style;
use kiln_cache::{ArtifactCache, LocalCache, TieredCache, TrackedRefs};
use kiln_plan::{DescriptorStore, ElementGraph, KindRegistry, Loader, ResolvedElement};
use kiln_runtime::{BuildReport, ElementState, Engine, FetcherRegistry, RunStatus, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Exit status when the run needs tracking first
pub const EXIT_NEEDS_TRACKING: u8 = 3;

/// Exit status for load and configuration errors
pub const EXIT_LOAD_ERROR: u8 = 2;

/// A loaded project plus user configuration
pub struct Session {
    store: DescriptorStore,
    kinds: KindRegistry,
    config: UserConfig,
    project_dir: PathBuf,
}

impl Session {
    /// Open the project in `project_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the project or its elements cannot be read
    pub fn open(project_dir: &Path, config: UserConfig) -> Result<Self> {
        let store = DescriptorStore::open(project_dir)
            .wrap_err_with(|| format!("failed to open project in {}", project_dir.display()))?;
        tracing::debug!(project = %store.project().name, elements = store.len(), "opened project");
        Ok(Self {
            store,
            kinds: KindRegistry::with_builtins(),
            config,
            project_dir: project_dir.to_path_buf(),
        })
    }

    /// The descriptor store
    #[must_use]
    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    /// User configuration
    #[must_use]
    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    /// Resolve targets given as `name` or `name:variant`
    ///
    /// # Errors
    ///
    /// Returns error if a target is malformed or the graph does not load
    pub fn load(&self, targets: &[String]) -> Result<ElementGraph> {
        let ids = Loader::parse_targets(targets)?;
        let graph = Loader::new(&self.store, &self.kinds).load(&ids)?;
        tracing::info!(targets = ids.len(), elements = graph.len(), "loaded graph");
        Ok(graph)
    }

    /// Resolve targets together with `--except` elements
    ///
    /// Both are resolved in one pass so they agree on variants. The returned
    /// graph holds only the targets.
    ///
    /// # Errors
    ///
    /// Returns error if an element is malformed or the graph does not load
    pub fn load_except(&self, targets: &[String], except: &[String]) -> Result<(ElementGraph, Vec<Arc<ResolvedElement>>)> {
        if except.is_empty() {
            return Ok((self.load(targets)?, Vec::new()));
        }
        let names: Vec<String> = targets.iter().chain(except).cloned().collect();
        let combined = self.load(&names)?;
        let (roots, excepted) = combined.targets().split_at(targets.len());
        Ok((ElementGraph::new(roots.to_vec()), excepted.to_vec()))
    }

    /// Local cache with configured remotes
    ///
    /// # Errors
    ///
    /// Returns error if a cache directory cannot be created
    pub fn cache(&self) -> Result<Arc<dyn ArtifactCache>> {
        let local = LocalCache::open(&self.config.cachedir)
            .wrap_err_with(|| format!("failed to open cache in {}", self.config.cachedir.display()))?;
        let remotes = &self.config.artifacts;
        if remotes.pull.is_empty() && remotes.push.is_empty() {
            return Ok(Arc::new(local));
        }

        let mut tiered = TieredCache::new(Arc::new(local));
        for location in &remotes.pull {
            tiered = tiered.with_pull(Arc::new(open_remote(location)?));
        }
        for location in &remotes.push {
            tiered = tiered.with_push(Arc::new(open_remote(location)?));
        }
        Ok(Arc::new(tiered))
    }

    /// Engine wired to the host runner and the built-in source kinds
    ///
    /// # Errors
    ///
    /// Returns error if the cache cannot be opened
    pub fn engine(&self, config: SchedulerConfig, cancel: CancellationToken) -> Result<Engine> {
        let sandbox = HostSandbox::new().with_scratch(self.config.cachedir.join("build"));
        let fetcher = FetcherRegistry::new().with(LOCAL_KIND, Arc::new(LocalSourceFetcher::new(&self.project_dir)));
        Ok(Engine::new(config, self.cache()?, Arc::new(sandbox), Arc::new(fetcher)).with_cancellation(cancel))
    }

    /// Store tracked refs; returns whether `project.refs` was written
    ///
    /// # Errors
    ///
    /// Returns error if a ref cannot be recorded or written
    pub fn record_tracked(&mut self, tracked: &TrackedRefs) -> Result<bool> {
        for (id, refs) in tracked {
            for (index, reference) in refs.iter().enumerate() {
                if let Some(reference) = reference {
                    self.store.set_source_ref(id.name(), index, reference)?;
                }
            }
        }
        Ok(self.store.save_refs()?)
    }
}

fn open_remote(location: &str) -> Result<LocalCache> {
    let cache = LocalCache::open(location)
        .wrap_err_with(|| format!("failed to open artifact remote '{}'", location))?
        .with_name(location);
    Ok(cache)
}

/// Exit status for a finished run
#[must_use]
pub fn exit_code(status: &RunStatus) -> ExitCode {
    match status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::NeedsTracking { .. } => ExitCode::from(EXIT_NEEDS_TRACKING),
        RunStatus::PartialFailure | RunStatus::Failed | RunStatus::Terminated => ExitCode::FAILURE,
    }
}

/// Styled state label
#[must_use]
pub fn state_label(state: ElementState) -> String {
    let label = format!("{:<9}", state.to_string());
    let styled = match state {
        ElementState::Cached | ElementState::Built | ElementState::Tracked => style(label).green(),
        ElementState::Failed => style(label).red().bold(),
        ElementState::Skipped => style(label).yellow(),
        _ => style(label).dim(),
    };
    styled.to_string()
}

/// Print one line per element, then the outcome
pub fn print_report(report: &BuildReport) {
    for element in &report.elements {
        let key = element
            .key
            .map_or_else(|| "-".repeat(8), |k| k.short());
        println!("{} {} {}", state_label(element.state), style(key).cyan(), element.element);
        if let Some(error) = &element.error {
            println!("          {}", style(error).dim());
        }
    }

    let jobs = &report.jobs;
    println!(
        "{} {} (track {}, pull {}, fetch {}, build {}, push {})",
        style("run").bold(),
        status_label(&report.status),
        jobs.track,
        jobs.pull,
        jobs.fetch,
        jobs.build,
        jobs.push
    );
}

fn status_label(status: &RunStatus) -> String {
    match status {
        RunStatus::Success => style(status.to_string()).green().bold().to_string(),
        RunStatus::NeedsTracking { .. } => style(status.to_string()).yellow().bold().to_string(),
        _ => style(status.to_string()).red().bold().to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::commands::checkout::{self, CheckoutArgs};

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("kiln.yaml"), "name: demo\nref-storage: project.refs\n").unwrap();
        std::fs::create_dir_all(root.join("elements")).unwrap();
        std::fs::write(
            root.join("elements/hello.kiln"),
            "kind: import\nsources:\n- kind: local\n  location: files/hello\n",
        )
        .unwrap();
        std::fs::write(
            root.join("elements/app.kiln"),
            concat!(
                "kind: manual\n",
                "build-depends: [hello]\n",
                "config:\n",
                "  install-commands:\n",
                "  - mkdir -p %{install-root}%{bindir}\n",
                "  - echo app > %{install-root}%{bindir}/app\n",
            ),
        )
        .unwrap();
        std::fs::create_dir_all(root.join("files/hello/usr/share")).unwrap();
        std::fs::write(root.join("files/hello/usr/share/hello.txt"), "hello\n").unwrap();
        dir
    }

    fn session(dir: &Path) -> Session {
        let config = UserConfig {
            cachedir: dir.join("cache"),
            ..UserConfig::default()
        };
        Session::open(dir, config).unwrap()
    }

    #[tokio::test]
    async fn test_track_build_and_rebuild() {
        let dir = project();
        let mut session = session(dir.path());
        let graph = session.load(&["app".to_string()]).unwrap();

        let untracked = session
            .engine(SchedulerConfig::default(), CancellationToken::new())
            .unwrap()
            .build(&graph, &TrackedRefs::new())
            .await
            .unwrap();
        assert_eq!(exit_code(&untracked.status), ExitCode::from(EXIT_NEEDS_TRACKING));

        let engine = session
            .engine(SchedulerConfig::default().with_track(true), CancellationToken::new())
            .unwrap();
        let report = engine.build(&graph, &TrackedRefs::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Success, "{:?}", report.elements);
        assert_eq!(report.jobs.build, 2);
        assert!(session.record_tracked(&report.tracked).unwrap());
        assert!(dir.path().join("project.refs").is_file());

        let session = self::session(dir.path());
        let graph = session.load(&["app".to_string()]).unwrap();
        let rerun = session
            .engine(SchedulerConfig::default(), CancellationToken::new())
            .unwrap()
            .build(&graph, &TrackedRefs::new())
            .await
            .unwrap();
        assert_eq!(rerun.status, RunStatus::Success);
        assert_eq!(rerun.jobs.build, 0);
        assert_eq!(rerun.find("app").unwrap().state, ElementState::Cached);

        let out = dir.path().join("out");
        let code = checkout::run(
            &session,
            CheckoutArgs {
                target: "app".to_string(),
                directory: out.clone(),
                include: Vec::new(),
                exclude: Vec::new(),
                no_orphans: false,
                force: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(std::fs::read_to_string(out.join("usr/bin/app")).unwrap(), "app\n");

        let code = shell::run(
            &session,
            shell::ShellArgs {
                target: "app".to_string(),
                command: Some("test -f usr/bin/app && test -d \"$KILN_ROOT\"".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }
}
