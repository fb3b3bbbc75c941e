//! State inspection and maintenance: `status`, `recover`, `reset`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use imaginize::config::{CliOverrides, Config};
use imaginize::manifest::ManifestManager;
use imaginize::state::{PhaseName, PipelineState, StateManager, Status};

use super::run::delete_manifests;

fn styled_status(status: Status) -> String {
    let text = format!("{status:<12}");
    match status {
        Status::Completed => style(text).green().to_string(),
        Status::InProgress => style(text).yellow().to_string(),
        Status::Failed => style(text).red().to_string(),
        Status::Skipped => style(text).dim().to_string(),
        Status::NotStarted => text,
    }
}

fn print_phase(state: &PipelineState, phase: PhaseName, config: &Config) {
    let total = state.metadata.total_chapters;
    let completed = state.completed_chapters(phase);
    let failed = state.failed_chapters(phase);

    println!(
        "{:<12} {} {:>4}/{:<4} {}",
        phase.as_str(),
        styled_status(state.phase_status(phase)),
        completed.len(),
        total,
        if failed.is_empty() {
            String::new()
        } else {
            style(format!("failed: {failed:?}")).red().to_string()
        }
    );

    if let Some(entry) = state.phase(phase) {
        for (name, sub) in &entry.sub_phases {
            println!("  {:<10} {} {:>4}/{:<4}", name, styled_status(sub.status), sub.progress, sub.total);
        }
        if let Some(error) = &entry.error {
            println!("  {} {error}", style("error:").red());
        }
    }

    let manifest = ManifestManager::for_phase(&config.state_dir, phase, config.lock_options());
    if manifest.exists() {
        match manifest.load() {
            Ok(file) => println!("  manifest: {}", file.progress()),
            Err(e) => println!("  manifest: {}", style(e).red()),
        }
    }
}

pub fn cmd_status(state_dir: &Path) -> Result<()> {
    let config = Config::load(state_dir, &CliOverrides::default())?;
    let manager = StateManager::new(state_dir);

    let Some(state) = manager.load()? else {
        println!();
        println!("No pipeline state found in {}", state_dir.display());
        println!("Start a run with `imaginize run <SOURCE> --chapters N --exec CMD`.");
        println!();
        return Ok(());
    };

    println!();
    println!("{}", style(format!("imaginize: {}", state.source_title)).bold());
    println!("Source:   {}", state.source_path);
    println!("Chapters: {} ({} processed)", state.metadata.total_chapters, state.metadata.processed_chapters);
    println!("Updated:  {}", state.metadata.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for phase in PhaseName::ALL {
        print_phase(&state, phase, &config);
    }
    println!();

    if state.is_complete() {
        println!("{}", style("Run complete").green().bold());
    } else if let Some(phase) = state.resume_phase() {
        println!("Next phase: {phase} (resume with --continue)");
    } else {
        println!("Failed chapters remain (retry with --continue)");
    }
    println!();
    Ok(())
}

/// Return stuck chapters in `phase`'s manifest to pending.
pub fn cmd_recover(state_dir: &Path, phase: PhaseName, stuck_threshold_ms: Option<u64>) -> Result<()> {
    let config = Config::load(
        state_dir,
        &CliOverrides {
            stuck_threshold_ms,
            ..Default::default()
        },
    )?;
    let manifest = ManifestManager::for_phase(state_dir, phase, config.lock_options());
    if !manifest.exists() {
        bail!(
            "No manifest for phase {phase} at {}; nothing to recover",
            manifest.path().display()
        );
    }

    let stuck = manifest.detect_stuck(config.stuck_threshold())?;
    if stuck.is_empty() {
        println!("No stuck chapters in {phase}");
        return Ok(());
    }
    let reset = manifest.reset_to_pending(&stuck)?;
    println!(
        "Reset {} stuck chapter(s) in {phase} to pending: {reset:?}",
        reset.len()
    );
    println!("  {}", manifest.progress()?);
    Ok(())
}

pub fn cmd_reset(state_dir: &Path, force: bool) -> Result<()> {
    let config = Config::load(state_dir, &CliOverrides::default())?;
    let manager = StateManager::new(state_dir);

    if !force {
        println!("This will delete {} and every phase manifest.", manager.state_file().display());
        println!("Run again with --force to confirm.");
        return Ok(());
    }

    manager
        .discard()
        .context("Failed to delete pipeline state")?;
    delete_manifests(&config)?;
    println!("Pipeline state reset. Next run will start fresh.");
    Ok(())
}
