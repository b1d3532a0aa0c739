//! `kiln track`

use super::{Session, exit_code, print_report};
use clap::Args;
use color_eyre::Result;
use console::style;
use kiln_cache::TrackedRefs;
use kiln_core::ElementId;
use kiln_plan::{Selection, except};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Arguments for `kiln track`
#[derive(Debug, Args)]
pub struct TrackArgs {
    /// Elements to track, as `name` or `name:variant`
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Which elements around the targets to track: none, plan, all, build or run
    #[arg(long, default_value_t = Selection::None, value_name = "SELECTION")]
    pub deps: Selection,

    /// Do not track this element or the dependencies only it brings in
    #[arg(long, value_name = "ELEMENT")]
    pub except: Vec<String>,
}

/// Resolve floating source refs and store them
///
/// # Errors
///
/// Returns error if the graph fails to load or refs cannot be written
pub async fn run(session: &mut Session, args: TrackArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let (graph, excepted) = session.load_except(&args.targets, &args.except)?;
    let selected = args.deps.select(graph.targets(), &|_: &ElementId| false);
    let elements: Vec<ElementId> = except(graph.targets(), selected, &excepted)
        .iter()
        .map(|e| e.id().clone())
        .collect();

    let engine = session.engine(session.config().scheduler.clone(), cancel)?;
    let report = engine.track(&graph, &elements, &TrackedRefs::new()).await?;
    print_report(&report);

    if report.tracked.is_empty() {
        println!("{}", style("all refs unchanged").dim());
        return Ok(exit_code(&report.status));
    }

    let written = session.record_tracked(&report.tracked)?;
    if !written {
        println!("ref storage is inline; pin these refs in the element files:");
        for id in &elements {
            let Some(refs) = report.tracked.get(id) else {
                continue;
            };
            for (index, reference) in refs.iter().enumerate() {
                if let Some(reference) = reference {
                    println!("  {} sources[{}].ref: {}", id, index, style(reference).cyan());
                }
            }
        }
    }
    Ok(exit_code(&report.status))
}
