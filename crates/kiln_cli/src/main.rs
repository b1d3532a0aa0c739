//! KILN CLI
//!
//! Builds element graphs with a local artifact cache and the host runner.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;
mod config;
mod fs_tree;
mod host;
mod local_source;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use commands::build::BuildArgs;
use commands::checkout::CheckoutArgs;
use commands::shell::ShellArgs;
use commands::show::ShowArgs;
use commands::track::TrackArgs;
use commands::{EXIT_LOAD_ERROR, Session};
use config::UserConfig;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
const LOG_ENV: &str = "KILN_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "KILN - Build orchestrator for element graphs", long_about = None)]
struct Cli {
    /// Project directory
    #[arg(short = 'C', long, global = true, default_value = ".")]
    directory: PathBuf,

    /// User configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build targets and their dependencies
    Build(BuildArgs),
    /// Show keys and cache state
    Show(ShowArgs),
    /// Resolve floating source refs
    Track(TrackArgs),
    /// Write a cached artifact to a directory
    Checkout(CheckoutArgs),
    /// Open a shell on a cached artifact and its runtime dependencies
    Shell(ShellArgs),
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("kiln=info")),
        1 => EnvFilter::new("kiln=debug"),
        _ => EnvFilter::new("kiln=trace"),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel `token` on Ctrl-C
fn watch_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; terminating");
            token.cancel();
        }
    });
}

async fn run(cli: Cli) -> color_eyre::Result<ExitCode> {
    let config = UserConfig::load(cli.config.as_deref())?;
    let mut session = Session::open(&cli.directory, config)?;
    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    match cli.command {
        Commands::Build(args) => commands::build::run(&mut session, args, cancel).await,
        Commands::Show(args) => commands::show::run(&session, args).await,
        Commands::Track(args) => commands::track::run(&mut session, args, cancel).await,
        Commands::Checkout(args) => commands::checkout::run(&session, args).await,
        Commands::Shell(args) => commands::shell::run(&session, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error reporter: {}", err);
    }
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{} {:?}", style("error:").red().bold(), report);
            ExitCode::from(EXIT_LOAD_ERROR)
        }
    }
}
