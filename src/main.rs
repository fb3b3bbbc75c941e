use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use imaginize::errors::exit_code_for;
use imaginize::logging::{LogFormat, init_logging};
use imaginize::pipeline::new_worker_id;
use imaginize::state::PhaseName;

mod cmd;

#[derive(Parser)]
#[command(name = "imaginize")]
#[command(version, about = "Resumable multi-process chapter pipeline for book illustration")]
pub struct Cli {
    /// Directory holding state, manifests, config and logs
    #[arg(long, global = true, default_value = ".imaginize", env = "IMAGINIZE_STATE_DIR")]
    pub state_dir: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Console log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every phase over a book, resuming or restarting an existing run on request
    Run {
        /// Path of the source book
        source: String,

        /// Number of chapters in the book
        #[arg(long)]
        chapters: u32,

        /// Book title (defaults to the file name)
        #[arg(long)]
        title: Option<String>,

        /// Resume the existing run, retrying failed chapters
        #[arg(long = "continue", conflicts_with = "force")]
        resume: bool,

        /// Discard any existing state and start over
        #[arg(long)]
        force: bool,

        /// Worker processes for per-chapter phases
        #[arg(long)]
        concurrent: Option<usize>,

        /// Command run once per chapter via `sh -c`
        #[arg(long)]
        exec: Option<String>,

        /// Keep going after a chapter fails
        #[arg(long, overrides_with = "no_skip_failed")]
        skip_failed: bool,

        /// Stop the run at the first failed chapter
        #[arg(long, overrides_with = "skip_failed")]
        no_skip_failed: bool,
    },
    /// Claim and process chapters from a phase manifest (started by `run --concurrent`)
    Worker {
        #[arg(long)]
        phase: PhaseName,

        /// Worker identity (generated when omitted)
        #[arg(long)]
        worker_id: Option<String>,

        #[arg(long)]
        source: String,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long)]
        exec: Option<String>,
    },
    /// Show pipeline progress
    Status,
    /// Return chapters held by dead workers to pending
    Recover {
        #[arg(long)]
        phase: PhaseName,

        /// Treat claims older than this as abandoned
        #[arg(long)]
        stuck_threshold_ms: Option<u64>,
    },
    /// Delete pipeline state and manifests
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", console::style("error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let log_dir = imaginize::config::log_dir(&cli.state_dir);

    match &cli.command {
        Commands::Run {
            source,
            chapters,
            title,
            resume,
            force,
            concurrent,
            exec,
            skip_failed,
            no_skip_failed,
        } => {
            let _guard = init_logging(cli.verbose, cli.log_format, Some((log_dir.as_path(), "run")))?;
            let skip_failed = match (*skip_failed, *no_skip_failed) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let args = cmd::RunArgs {
                source: source.clone(),
                chapters: *chapters,
                title: title.clone(),
                resume: *resume,
                force: *force,
                concurrent: *concurrent,
                exec: exec.clone(),
                skip_failed,
            };
            cmd::cmd_run(cli, &args).await
        }
        Commands::Worker {
            phase,
            worker_id,
            source,
            title,
            exec,
        } => {
            let worker_id = worker_id.clone().unwrap_or_else(new_worker_id);
            let _guard = init_logging(cli.verbose, cli.log_format, Some((log_dir.as_path(), worker_id.as_str())))?;
            let args = cmd::WorkerArgs {
                phase: *phase,
                worker_id,
                source: source.clone(),
                title: title.clone(),
                exec: exec.clone(),
            };
            cmd::cmd_worker(cli, &args).await
        }
        Commands::Status => {
            let _guard = init_logging(cli.verbose, cli.log_format, None)?;
            cmd::cmd_status(&cli.state_dir)
        }
        Commands::Recover {
            phase,
            stuck_threshold_ms,
        } => {
            let _guard = init_logging(cli.verbose, cli.log_format, None)?;
            cmd::cmd_recover(&cli.state_dir, *phase, *stuck_threshold_ms)
        }
        Commands::Reset { force } => {
            let _guard = init_logging(cli.verbose, cli.log_format, None)?;
            cmd::cmd_reset(&cli.state_dir, *force)
        }
    }
}
