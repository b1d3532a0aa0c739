//! `kiln build`

use super::{Session, exit_code, print_report};
use clap::Args;
use color_eyre::Result;
use kiln_cache::TrackedRefs;
use kiln_core::ElementId;
use kiln_plan::{ElementGraph, ResolvedElement, Scope, except};
use kiln_runtime::{OnError, SchedulerConfig};
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Arguments for `kiln build`
#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Elements to build, as `name` or `name:variant`
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Do not build this element or the dependencies only it needs
    #[arg(long, value_name = "ELEMENT")]
    pub except: Vec<String>,

    /// Track unpinned sources before building
    #[arg(long)]
    pub track: bool,

    /// What to do when a job fails: continue, quit or terminate
    #[arg(long, value_name = "POLICY")]
    pub on_error: Option<OnError>,

    /// Concurrent track, pull and fetch jobs
    #[arg(long, value_name = "N", value_parser = pool_size)]
    pub fetchers: Option<usize>,

    /// Concurrent build jobs
    #[arg(long, value_name = "N", value_parser = pool_size)]
    pub builders: Option<usize>,

    /// Concurrent push jobs
    #[arg(long, value_name = "N", value_parser = pool_size)]
    pub pushers: Option<usize>,

    /// Extra attempts for failed network jobs
    #[arg(long, value_name = "N")]
    pub network_retries: Option<u32>,

    /// Accept artifacts built against different dependency versions
    #[arg(long)]
    pub no_strict: bool,
}

fn pool_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Elements of the graph that `--except` removes
#[must_use]
pub fn excluded_elements(graph: &ElementGraph, excepted: &[Arc<ResolvedElement>]) -> Vec<ElementId> {
    let all = ElementGraph::scope(graph.targets(), Scope::All);
    let kept: HashSet<ElementId> = except(graph.targets(), all.clone(), excepted)
        .iter()
        .map(|e| e.id().clone())
        .collect();
    all.iter()
        .map(|e| e.id().clone())
        .filter(|id| !kept.contains(id))
        .collect()
}

impl BuildArgs {
    /// Layer the flags over configured settings
    #[must_use]
    pub fn apply(&self, mut config: SchedulerConfig) -> SchedulerConfig {
        if let Some(on_error) = self.on_error {
            config.on_error = on_error;
        }
        if let Some(n) = self.fetchers {
            config.fetchers = n;
        }
        if let Some(n) = self.builders {
            config.builders = n;
        }
        if let Some(n) = self.pushers {
            config.pushers = n;
        }
        if let Some(n) = self.network_retries {
            config.network_retries = n;
        }
        if self.no_strict {
            config.strict = false;
        }
        let track = self.track || config.track;
        config.with_track(track)
    }
}

/// Build the targets
///
/// # Errors
///
/// Returns error if the graph fails to load or keys cannot be computed
pub async fn run(session: &mut Session, args: BuildArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let (graph, excepted) = session.load_except(&args.targets, &args.except)?;
    let excluded = excluded_elements(&graph, &excepted);
    if !excluded.is_empty() {
        tracing::info!(elements = excluded.len(), "excluded from the build");
    }
    let config = args.apply(session.config().scheduler.clone());
    let engine = session.engine(config, cancel)?;

    let report = engine.build_excluding(&graph, &TrackedRefs::new(), &excluded).await?;
    if !report.tracked.is_empty() {
        let written = session.record_tracked(&report.tracked)?;
        tracing::info!(elements = report.tracked.len(), written, "recorded tracked refs");
    }

    print_report(&report);
    Ok(exit_code(&report.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: BuildArgs,
    }

    #[test]
    fn test_flags_override_config() {
        let wrapper = Wrapper::parse_from([
            "kiln",
            "app.kiln",
            "--on-error",
            "continue",
            "--builders",
            "1",
            "--no-strict",
        ]);
        let config = wrapper.args.apply(SchedulerConfig::default().with_fetchers(3));
        assert_eq!(config.on_error, OnError::Continue);
        assert_eq!(config.builders, 1);
        assert_eq!(config.fetchers, 3);
        assert!(!config.strict);
        assert!(!config.track);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        assert!(Wrapper::try_parse_from(["kiln", "app", "--builders", "0"]).is_err());
        assert!(Wrapper::try_parse_from(["kiln", "app", "--fetchers", "many"]).is_err());
        let wrapper = Wrapper::parse_from(["kiln", "app", "--pushers", "2"]);
        assert_eq!(wrapper.args.pushers, Some(2));
    }

    #[test]
    fn test_except_flag_excludes_unique_dependencies() {
        use kiln_plan::{DescriptorStore, ElementDescriptor, KindRegistry, Loader, ProjectConfig};

        let wrapper = Wrapper::parse_from(["kiln", "app", "--except", "sdk", "--except", "docs"]);
        assert_eq!(wrapper.args.except, vec!["sdk", "docs"]);

        let store = DescriptorStore::from_descriptors(
            ProjectConfig::new("t"),
            [
                ("app", "kind: manual\nbuild-depends: [sdk, base]\n"),
                ("sdk", "kind: stack\ndepends: [compiler, base]\n"),
                ("compiler", "kind: stack\n"),
                ("base", "kind: stack\n"),
            ]
            .into_iter()
            .map(|(n, y)| ElementDescriptor::from_yaml(n, y).unwrap()),
        )
        .unwrap();
        let ids = Loader::parse_targets(&["app", "sdk"]).unwrap();
        let combined = Loader::new(&store, &KindRegistry::with_builtins()).load(&ids).unwrap();
        let graph = ElementGraph::new(combined.targets()[..1].to_vec());

        let mut excluded: Vec<String> = excluded_elements(&graph, &combined.targets()[1..])
            .iter()
            .map(ToString::to_string)
            .collect();
        excluded.sort_unstable();
        assert_eq!(excluded, vec!["compiler", "sdk"]);
        assert!(excluded_elements(&graph, &[]).is_empty());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let parsed = Wrapper::try_parse_from(["kiln", "app", "--on-error", "panic"]);
        assert!(parsed.is_err());
    }
}
