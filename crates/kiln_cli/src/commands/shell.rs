//! `kiln shell`

use super::Session;
use super::checkout::find_artifact;
use crate::fs_tree::write_tree;
use clap::Args;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use kiln_cache::{ArtifactCache, CacheKeyEngine, KeyTable, TrackedRefs};
use kiln_core::{ElementId, FileTree};
use kiln_plan::{ElementGraph, Scope};
use std::process::ExitCode;

/// Arguments for `kiln shell`
#[derive(Debug, Args)]
pub struct ShellArgs {
    /// Element to enter, as `name` or `name:variant`
    pub target: String,

    /// Run this command instead of an interactive shell
    #[arg(short, long)]
    pub command: Option<String>,
}

/// Stage the runtime closure of the first target from the cache
///
/// Returns the elements that are not cached when any are missing.
///
/// # Errors
///
/// Returns error on cache failures other than a miss
pub async fn stage(
    graph: &ElementGraph,
    keys: &KeyTable,
    cache: &dyn ArtifactCache,
    strict: bool,
) -> Result<std::result::Result<FileTree, Vec<ElementId>>> {
    let mut root = FileTree::new();
    let mut missing = Vec::new();
    for element in ElementGraph::scope(graph.targets(), Scope::Run) {
        let id = element.id();
        let mut candidates: Vec<_> = keys.strong(id).into_iter().collect();
        if !strict {
            candidates.extend(keys.weak(id));
        }
        match find_artifact(cache, &candidates).await? {
            Some(artifact) => root.overlay(&artifact.files),
            None => missing.push(id.clone()),
        }
    }
    if missing.is_empty() {
        Ok(Ok(root))
    } else {
        Ok(Err(missing))
    }
}

/// Open a shell in a directory holding the target and its runtime dependencies
///
/// # Errors
///
/// Returns error if the target does not load, staging fails or the shell
/// cannot be started
pub async fn run(session: &Session, args: ShellArgs) -> Result<ExitCode> {
    let graph = session.load(std::slice::from_ref(&args.target))?;
    let element = graph
        .targets()
        .first()
        .ok_or_else(|| eyre!("no target given"))?;

    let keys = KeyTable::fold(&graph, &CacheKeyEngine::new(), &TrackedRefs::new())?;
    if keys.strong(element.id()).is_none() {
        eprintln!("'{}' has unpinned sources; run `kiln track` first", element.id());
        return Ok(ExitCode::from(super::EXIT_NEEDS_TRACKING));
    }

    let cache = session.cache()?;
    let root = match stage(&graph, &keys, cache.as_ref(), session.config().scheduler.strict).await? {
        Ok(root) => root,
        Err(missing) => {
            for id in &missing {
                eprintln!("'{}' is not cached; run `kiln build` first", id);
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    let dir = tempfile::Builder::new()
        .prefix("kiln-shell-")
        .tempdir()
        .wrap_err("failed to create shell directory")?;
    write_tree(dir.path(), &root).wrap_err_with(|| format!("failed to stage {}", dir.path().display()))?;
    tracing::info!(element = %element.id(), files = root.len(), dir = %dir.path().display(), "staged shell");

    let mut command = tokio::process::Command::new("sh");
    if let Some(line) = &args.command {
        command.arg("-c").arg(line);
    } else {
        command.arg("-i");
    }
    command
        .current_dir(dir.path())
        .env_clear()
        .envs(element.environment())
        .env("KILN_ROOT", dir.path());
    if let Ok(term) = std::env::var("TERM") {
        command.env("TERM", term);
    }

    let status = command.status().await.wrap_err("failed to start shell")?;
    Ok(status
        .code()
        .and_then(|c| u8::try_from(c).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from))
}
