//! Grounded CLI: cited answers, streamed answers and eval runs from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Grounded: answers from your documents, with citations or an honest refusal
#[derive(Parser, Debug)]
#[command(name = "grounded", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Corpus file (JSONL), overrides `corpus.path`
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Answer one question
    Query {
        question: String,
        /// Number of candidates to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Print retrieval counts and timings
        #[arg(long)]
        diagnostics: bool,
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
    /// Answer one question, printing protocol events as they arrive
    Stream {
        question: String,
        /// Number of candidates to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Print each event as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Run an eval dataset (JSON or JSONL) and score it
    Eval {
        dataset: PathBuf,
        /// Cutoff for hit@k and MRR
        #[arg(short, long)]
        k: Option<usize>,
        /// SQLite file for run history, overrides `eval.runs_db`
        #[arg(long)]
        runs_db: Option<PathBuf>,
        /// Keep run history in memory only
        #[arg(long, conflicts_with = "runs_db")]
        no_history: bool,
        /// Print the full run as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// SQLite file for run history, overrides `eval.runs_db`
        #[arg(long)]
        runs_db: Option<PathBuf>,
        /// Keep run history in memory only
        #[arg(long, conflicts_with = "runs_db")]
        no_history: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write a default user configuration file
    Init,
}

/// Human-readable stderr plus JSON files in the platform data directory.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(verbose: u8, quiet: bool) -> WorkerGuard {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let log_dir = directories::ProjectDirs::from("dev", "grounded", "grounded")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "grounded.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.quiet);

    let config = commands::load_config(cli.config.as_deref(), cli.corpus.as_deref())?;
    commands::handle_command(cli.command, config, cli.quiet).await
}
