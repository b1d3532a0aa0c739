//! `kiln checkout`

use super::Session;
use crate::fs_tree::write_tree;
use clap::Args;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use kiln_cache::{Artifact, ArtifactCache, CacheError, CacheKeyEngine, KeyTable, TrackedRefs};
use kiln_core::CacheKey;
use kiln_plan::SplitRules;
use std::path::PathBuf;
use std::process::ExitCode;

/// Arguments for `kiln checkout`
#[derive(Debug, Args)]
pub struct CheckoutArgs {
    /// Element to check out, as `name` or `name:variant`
    pub target: String,

    /// Directory to write the artifact into
    pub directory: PathBuf,

    /// Only files in these split domains
    #[arg(long = "include", value_name = "DOMAIN")]
    pub include: Vec<String>,

    /// Leave out files in these split domains
    #[arg(long = "exclude", value_name = "DOMAIN")]
    pub exclude: Vec<String>,

    /// Leave out files that are in no split domain
    #[arg(long)]
    pub no_orphans: bool,

    /// Write into a directory that is not empty
    #[arg(long)]
    pub force: bool,
}

/// First cached artifact among `keys`
///
/// # Errors
///
/// Returns error on cache failures other than a miss
pub async fn find_artifact(cache: &dyn ArtifactCache, keys: &[CacheKey]) -> Result<Option<Artifact>> {
    for key in keys {
        match cache.retrieve(key).await {
            Ok(artifact) => return Ok(Some(artifact)),
            Err(CacheError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

/// Write a cached artifact's files to a directory
///
/// # Errors
///
/// Returns error if the target does not load, the directory is in use, or
/// writing fails
pub async fn run(session: &Session, args: CheckoutArgs) -> Result<ExitCode> {
    let graph = session.load(std::slice::from_ref(&args.target))?;
    let element = graph
        .targets()
        .first()
        .ok_or_else(|| eyre!("no target given"))?;

    let keys = KeyTable::fold(&graph, &CacheKeyEngine::new(), &TrackedRefs::new())?;
    let Some(strong) = keys.strong(element.id()) else {
        eprintln!("'{}' has unpinned sources; run `kiln track` first", element.id());
        return Ok(ExitCode::from(super::EXIT_NEEDS_TRACKING));
    };
    let mut candidates = vec![strong];
    if !session.config().scheduler.strict {
        candidates.extend(keys.weak(element.id()));
    }

    let cache = session.cache()?;
    let Some(artifact) = find_artifact(cache.as_ref(), &candidates).await? else {
        eprintln!("'{}' is not cached; run `kiln build` first", element.id());
        return Ok(ExitCode::FAILURE);
    };

    if !args.force && args.directory.read_dir().is_ok_and(|mut d| d.next().is_some()) {
        return Err(eyre!(
            "{} is not empty (use --force to write into it)",
            args.directory.display()
        ));
    }

    let rules = SplitRules::for_element(session.store().project(), element)?;
    let files = rules.select(&artifact.files, &args.include, &args.exclude, !args.no_orphans)?;
    write_tree(&args.directory, &files)
        .wrap_err_with(|| format!("failed to write {}", args.directory.display()))?;

    tracing::info!(
        element = %element.id(),
        key = %artifact.meta.strong_key.short(),
        files = files.len(),
        "checked out"
    );
    println!(
        "checked out {} files of {} into {}",
        files.len(),
        element.id(),
        args.directory.display()
    );
    Ok(ExitCode::SUCCESS)
}
