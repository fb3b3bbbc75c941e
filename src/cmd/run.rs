//! Pipeline execution: `imaginize run` and the `imaginize worker` child process.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use imaginize::config::{CliOverrides, Config};
use imaginize::errors::PipelineError;
use imaginize::manifest::ManifestManager;
use imaginize::pipeline::{
    CommandProcessor, PipelineRunner, ProcessLauncher, RunReport, RunSettings, Worker, WorkerSpec,
};
use imaginize::retry::RetryCoordinator;
use imaginize::shutdown::Shutdown;
use imaginize::state::{PhaseName, PipelineState, StateManager};

use super::super::Cli;

pub struct RunArgs {
    pub source: String,
    pub chapters: u32,
    pub title: Option<String>,
    pub resume: bool,
    pub force: bool,
    pub concurrent: Option<usize>,
    pub exec: Option<String>,
    pub skip_failed: Option<bool>,
}

pub struct WorkerArgs {
    pub phase: PhaseName,
    pub worker_id: String,
    pub source: String,
    pub title: String,
    pub exec: Option<String>,
}

fn print_warnings(config: &Config) {
    for warning in config.validate() {
        warn!("{warning}");
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }
}

fn default_title(source: &str) -> String {
    Path::new(source)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}

/// Remove every phase manifest left in `state_dir`.
pub fn delete_manifests(config: &Config) -> Result<()> {
    for phase in PhaseName::ALL {
        ManifestManager::for_phase(&config.state_dir, phase, config.lock_options())
            .delete()
            .with_context(|| format!("Failed to delete the {phase} manifest"))?;
    }
    Ok(())
}

/// Load, restart or create the state for this run.
///
/// Returns `None` when `--continue` finds nothing left to do.
fn prepare_state(
    args: &RunArgs,
    config: &Config,
    manager: &StateManager,
) -> Result<Option<PipelineState>> {
    let existing = manager.load()?;

    if let Some(mut state) = existing {
        if args.resume {
            if state.source_path != args.source {
                warn!(
                    stored = %state.source_path,
                    requested = %args.source,
                    "Continuing a run that was started for a different source"
                );
            }
            let reopened = manager.reopen_failed(&mut state)?;
            if !reopened.is_empty() {
                println!(
                    "Retrying failed chapters in: {}",
                    reopened.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
                );
            }
            if state.is_complete() {
                return Ok(None);
            }
            if state.metadata.total_chapters == 0 {
                manager.set_total_chapters(&mut state, args.chapters)?;
            }
            return Ok(Some(state));
        }
        if !args.force {
            return Err(PipelineError::StateExists {
                path: manager.state_file().to_path_buf(),
            }
            .into());
        }
        manager.discard()?;
        delete_manifests(config)?;
        println!("Discarded previous run for {}", state.source_title);
    }

    let title = args
        .title
        .clone()
        .unwrap_or_else(|| default_title(&args.source));
    let mut state = manager.initialize(&args.source, &title, config.snapshot())?;
    manager.set_total_chapters(&mut state, args.chapters)?;
    Ok(Some(state))
}

fn print_report(report: &RunReport, state: &PipelineState) {
    println!();
    println!(
        "{} {} chapter(s) processed across {} phase(s) in {:.1}s",
        style("Done:").bold(),
        report.chapters_processed,
        report.phases_run.len(),
        report.duration.as_secs_f64()
    );
    for (phase, failed) in &report.failed {
        println!(
            "  {} {phase}: chapters {:?} failed",
            style("✗").red(),
            failed
        );
    }
    if report.interrupted {
        println!(
            "  {} interrupted; resume with `imaginize run {} --chapters {} --continue`",
            style("!").yellow(),
            state.source_path,
            state.metadata.total_chapters
        );
    } else if report.is_partial() {
        println!("  Retry failed chapters with --continue");
    }
}

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let overrides = CliOverrides {
        concurrency: args.concurrent,
        exec: args.exec.clone(),
        skip_failed: args.skip_failed,
        stuck_threshold_ms: None,
    };
    let config = Config::load(&cli.state_dir, &overrides)?;
    print_warnings(&config);

    let command = config
        .processor_command()
        .ok_or(PipelineError::NoProcessor)?
        .to_string();

    let manager = StateManager::new(&config.state_dir);
    let Some(mut state) = prepare_state(args, &config, &manager)? else {
        println!("{} nothing left to do", style("Run already complete:").green().bold());
        return Ok(());
    };
    info!(
        source = %state.source_path,
        chapters = state.metadata.total_chapters,
        concurrency = config.concurrency(),
        "Starting run"
    );

    let shutdown = Shutdown::new();
    let _ctrl_c = shutdown.listen_for_ctrl_c();

    let processor = Arc::new(CommandProcessor::new(command).with_timeout(config.processor_timeout()));
    let settings = RunSettings {
        state_dir: config.state_dir.clone(),
        skip_failed: config.skip_failed(),
        concurrency: config.concurrency(),
        max_chapter_attempts: config.max_chapter_attempts(),
        stuck_threshold: config.stuck_threshold(),
        lock_options: config.lock_options(),
    };
    let mut runner = PipelineRunner::new(
        settings,
        processor,
        RetryCoordinator::new(config.retry_policy()),
        shutdown,
    );
    if config.concurrency() > 1 {
        let launcher = ProcessLauncher::current_exe(config.state_dir.clone())?
            .with_exec(args.exec.clone())
            .with_logging(cli.verbose, cli.log_format);
        runner = runner.with_launcher(Arc::new(launcher));
    }

    let report = runner.run(&mut state).await?;
    print_report(&report, &state);
    report.into_result()?;
    Ok(())
}

/// Body of a worker child process. Never writes the state file.
pub async fn cmd_worker(cli: &Cli, args: &WorkerArgs) -> Result<()> {
    let overrides = CliOverrides {
        exec: args.exec.clone(),
        ..Default::default()
    };
    let config = Config::load(&cli.state_dir, &overrides)?;
    let command = config
        .processor_command()
        .ok_or(PipelineError::NoProcessor)?
        .to_string();

    let manifest = ManifestManager::for_phase(
        &config.state_dir,
        args.phase,
        config.lock_options().owner(args.worker_id.clone()),
    );
    let shutdown = Shutdown::new();
    let _ctrl_c = shutdown.listen_for_ctrl_c();

    let worker = Worker::new(
        WorkerSpec {
            worker_id: args.worker_id.clone(),
            phase: args.phase,
            source_path: args.source.clone(),
            title: args.title.clone(),
        },
        manifest,
        Arc::new(CommandProcessor::new(command).with_timeout(config.processor_timeout())),
        RetryCoordinator::new(config.retry_policy()),
        shutdown,
        config.max_chapter_attempts(),
    );

    let report = worker.run().await?;
    if report.interrupted {
        return Err(PipelineError::Interrupted.into());
    }
    Ok(())
}
