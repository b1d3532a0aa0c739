//! `kiln show`

use super::Session;
use clap::Args;
use color_eyre::Result;
use console::style;
use kiln_cache::{ArtifactCache, CacheKeyEngine, KeyTable, TrackedRefs};
use kiln_core::ElementId;
use kiln_plan::{ElementGraph, Selection, except};
use std::collections::HashSet;
use std::process::ExitCode;

/// Arguments for `kiln show`
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Elements to show, as `name` or `name:variant`
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Which elements around the targets to show: none, plan, all, build or run
    #[arg(long, default_value_t = Selection::All, value_name = "SELECTION")]
    pub deps: Selection,

    /// Leave out this element and the dependencies only it brings in
    #[arg(long, value_name = "ELEMENT")]
    pub except: Vec<String>,
}

/// What `show` reports for one element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    /// An artifact is cached
    Cached,
    /// Every build dependency is cached
    Buildable,
    /// Some build dependency is not cached yet
    Waiting,
    /// The key needs tracked refs
    PendingTrack,
}

impl std::fmt::Display for ShowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cached => "cached",
            Self::Buildable => "buildable",
            Self::Waiting => "waiting",
            Self::PendingTrack => "pending-track",
        };
        write!(f, "{}", s)
    }
}

/// Classify every element of the graph
///
/// # Errors
///
/// Returns error if the cache cannot be queried
pub async fn classify(
    graph: &ElementGraph,
    keys: &KeyTable,
    cache: &dyn ArtifactCache,
    strict: bool,
) -> Result<Vec<(ElementId, ShowState)>> {
    let mut cached: HashSet<ElementId> = HashSet::new();
    for element in graph.iter() {
        let id = element.id();
        let mut candidates = keys.strong(id).into_iter().collect::<Vec<_>>();
        if !strict {
            candidates.extend(keys.weak(id));
        }
        for key in candidates {
            if cache.has(&key).await? {
                cached.insert(id.clone());
                break;
            }
        }
    }

    Ok(graph
        .iter()
        .map(|element| {
            let id = element.id();
            let state = if cached.contains(id) {
                ShowState::Cached
            } else if keys.is_pending(id) {
                ShowState::PendingTrack
            } else if element.build_scope().iter().all(|d| cached.contains(d.id())) {
                ShowState::Buildable
            } else {
                ShowState::Waiting
            };
            (id.clone(), state)
        })
        .collect())
}

/// Print key and state of the selected elements
///
/// # Errors
///
/// Returns error if the graph fails to load or the cache cannot be queried
pub async fn run(session: &Session, args: ShowArgs) -> Result<ExitCode> {
    let (graph, excepted) = session.load_except(&args.targets, &args.except)?;
    let keys = KeyTable::fold(&graph, &CacheKeyEngine::new(), &TrackedRefs::new())?;
    let cache = session.cache()?;
    let states = classify(&graph, &keys, cache.as_ref(), session.config().scheduler.strict).await?;
    let cached: HashSet<&ElementId> = states
        .iter()
        .filter(|(_, s)| *s == ShowState::Cached)
        .map(|(id, _)| id)
        .collect();

    let selected = args.deps.select(graph.targets(), &|id: &ElementId| cached.contains(id));
    for element in except(graph.targets(), selected, &excepted) {
        let Some((_, state)) = states.iter().find(|(id, _)| id == element.id()) else {
            continue;
        };
        let key = keys
            .strong(element.id())
            .map_or_else(|| "-".repeat(8), |k| k.short());
        let label = format!("{:<13}", state.to_string());
        let label = match state {
            ShowState::Cached => style(label).green(),
            ShowState::Buildable => style(label).cyan(),
            ShowState::Waiting => style(label).dim(),
            ShowState::PendingTrack => style(label).yellow(),
        };
        println!("{} {} {}", label, style(key).cyan(), element.id());
    }
    Ok(ExitCode::SUCCESS)
}
