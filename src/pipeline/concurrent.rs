//! Concurrent execution of one phase across worker processes.
//!
//! The driver prepares the phase manifest, launches the workers, waits for all of them,
//! then folds the manifest back into the pipeline state. Workers never touch the state
//! file.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::blocking;
use super::processor::INTERRUPTED;
use super::runner::{PhaseOutcome, RunSettings};
use super::worker::{WorkerSpec, worker_id_with_prefix};
use crate::errors::{EXIT_INTERRUPTED, EXIT_SUCCESS, PipelineError};
use crate::logging::LogFormat;
use crate::manifest::{EntryStatus, ManifestFile, ManifestManager};
use crate::shutdown::Shutdown;
use crate::state::{ChapterUpdate, PhaseName, PipelineState, StateManager, Status};

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: String,
    /// Process exit code; `None` when killed by a signal
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn succeeded(&self) -> bool {
        self.code == Some(i32::from(EXIT_SUCCESS))
    }

    pub fn interrupted(&self) -> bool {
        self.code == Some(i32::from(EXIT_INTERRUPTED))
    }
}

/// Starts a worker and waits for it to finish.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerExit, PipelineError>;
}

/// Launches workers as `imaginize worker` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    state_dir: PathBuf,
    exec: Option<String>,
    verbose: bool,
    log_format: LogFormat,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            program,
            state_dir,
            exec: None,
            verbose: false,
            log_format: LogFormat::Text,
        }
    }

    /// Relaunch the running executable.
    pub fn current_exe(state_dir: PathBuf) -> Result<Self, PipelineError> {
        let program = std::env::current_exe()
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("Cannot locate own executable: {e}")))?;
        Ok(Self::new(program, state_dir))
    }

    #[must_use]
    pub fn with_exec(mut self, exec: Option<String>) -> Self {
        self.exec = exec;
        self
    }

    #[must_use]
    pub fn with_logging(mut self, verbose: bool, log_format: LogFormat) -> Self {
        self.verbose = verbose;
        self.log_format = log_format;
        self
    }

    fn command(&self, spec: &WorkerSpec) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("--state-dir").arg(&self.state_dir);
        if self.verbose {
            cmd.arg("--verbose");
        }
        cmd.arg("--log-format")
            .arg(self.log_format.as_str())
            .arg("worker")
            .arg("--phase")
            .arg(spec.phase.as_str())
            .arg("--worker-id")
            .arg(&spec.worker_id)
            .arg("--source")
            .arg(&spec.source_path)
            .arg("--title")
            .arg(&spec.title);
        if let Some(exec) = &self.exec {
            cmd.arg("--exec").arg(exec);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerExit, PipelineError> {
        let status = self.command(spec).status().await.map_err(|e| {
            PipelineError::Other(anyhow::anyhow!(
                "Failed to start worker {}: {e}",
                spec.worker_id
            ))
        })?;
        Ok(WorkerExit {
            worker_id: spec.worker_id.clone(),
            code: status.code(),
        })
    }
}

/// Run `phase` with `settings.concurrency` workers.
pub async fn run_phase(
    state_manager: &StateManager,
    state: &mut PipelineState,
    phase: PhaseName,
    settings: &RunSettings,
    launcher: &dyn WorkerLauncher,
    shutdown: &Shutdown,
) -> Result<PhaseOutcome, PipelineError> {
    let manifest = ManifestManager::for_phase(&settings.state_dir, phase, settings.lock_options.clone());
    prepare_manifest(&manifest, state, phase, settings).await?;

    let specs: Vec<WorkerSpec> = (1..=settings.concurrency)
        .map(|i| WorkerSpec {
            worker_id: worker_id_with_prefix(&i.to_string()),
            phase,
            source_path: state.source_path.clone(),
            title: state.source_title.clone(),
        })
        .collect();
    info!(phase = %phase, workers = specs.len(), "Launching workers");

    let exits = join_all(specs.iter().map(|spec| launcher.launch(spec))).await;

    let ours: HashSet<String> = specs.iter().map(|s| s.worker_id.clone()).collect();
    let abandoned = {
        let manifest = manifest.clone();
        blocking(move || {
            let loaded = manifest.load()?;
            let active: Vec<u32> = loaded
                .chapters
                .iter()
                .filter(|(_, e)| e.status.is_active())
                .filter(|(_, e)| e.claimed_by.as_ref().is_some_and(|w| ours.contains(w)))
                .map(|(n, _)| *n)
                .collect();
            manifest.reset_to_pending(&active)
        })
        .await?
    };
    if !abandoned.is_empty() {
        warn!(phase = %phase, chapters = ?abandoned, "Workers left chapters unfinished");
    }

    let mut worker_error = None;
    let mut interrupted = shutdown.is_triggered();
    for exit in exits {
        match exit {
            Ok(exit) if exit.interrupted() => interrupted = true,
            Ok(exit) if exit.succeeded() => {}
            Ok(exit) => {
                warn!(worker = %exit.worker_id, code = ?exit.code, "Worker exited abnormally");
                worker_error.get_or_insert(PipelineError::WorkerFailed {
                    worker: exit.worker_id,
                    code: exit.code,
                });
            }
            Err(err) => {
                warn!(phase = %phase, error = %err, "Worker could not run");
                worker_error.get_or_insert(err);
            }
        }
    }

    let final_manifest = {
        let manifest = manifest.clone();
        blocking(move || manifest.load()).await?
    };
    let outcome = fold_into_state(state_manager, state, phase, &final_manifest, interrupted)?;

    if let Some(err) = worker_error {
        return Err(err);
    }
    if !outcome.interrupted && outcome.failed.is_empty() {
        blocking(move || manifest.delete()).await?;
    }
    info!(phase = %phase, progress = %final_manifest.progress(), "Concurrent phase finished");
    Ok(outcome)
}

/// Create the manifest, or reuse the one a previous run left behind.
async fn prepare_manifest(
    manifest: &ManifestManager,
    state: &PipelineState,
    phase: PhaseName,
    settings: &RunSettings,
) -> Result<(), PipelineError> {
    let manifest = manifest.clone();
    let completed = state.completed_chapters(phase);
    let total = state.metadata.total_chapters;
    let stuck_threshold = settings.stuck_threshold;

    blocking(move || {
        if manifest.exists() {
            let existing = manifest.load()?;
            let mut retry = manifest.detect_stuck(stuck_threshold)?;
            retry.extend(existing.with_status(EntryStatus::Failed));
            retry.sort_unstable();
            let reset = manifest.reset_to_pending(&retry)?;
            info!(path = %manifest.path().display(), reset = ?reset, "Reusing chapter manifest");
        } else {
            manifest.create(total)?;
        }
        let seeded = manifest.seed_completed(&completed)?;
        debug!(seeded = ?seeded, "Seeded chapters completed in state");
        Ok(())
    })
    .await
}

/// Copy worker results into the state with one write.
fn fold_into_state(
    state_manager: &StateManager,
    state: &mut PipelineState,
    phase: PhaseName,
    manifest: &ManifestFile,
    interrupted: bool,
) -> Result<PhaseOutcome, PipelineError> {
    let mut outcome = PhaseOutcome {
        interrupted,
        ..Default::default()
    };
    let mut updates = Vec::new();

    for (chapter, entry) in &manifest.chapters {
        let recorded = state.chapter(phase, *chapter).map(|c| c.status);
        match entry.status {
            EntryStatus::Completed => {
                if recorded != Some(Status::Completed) {
                    outcome.processed += 1;
                    updates.push((
                        *chapter,
                        ChapterUpdate {
                            status: Some(Status::Completed),
                            artifact: entry.artifact.clone(),
                            tokens_used: entry.tokens_used,
                            ..Default::default()
                        },
                    ));
                }
            }
            EntryStatus::Failed => {
                let error = entry.error.clone().unwrap_or_else(|| "failed".to_string());
                if error != INTERRUPTED {
                    outcome.failed.push(*chapter);
                }
                updates.push((*chapter, ChapterUpdate::failed(error)));
            }
            EntryStatus::Pending | EntryStatus::Claimed | EntryStatus::InProgress => {
                if !interrupted {
                    outcome.failed.push(*chapter);
                    updates.push((*chapter, ChapterUpdate::failed("not processed by any worker")));
                }
            }
        }
    }

    state_manager.apply_chapter_updates(state, phase, updates)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use crate::persist::LockOptions;
    use crate::pipeline::processor::{ChapterOutcome, ChapterProcessor, WorkItem};
    use crate::pipeline::runner::PipelineRunner;
    use crate::pipeline::worker::Worker;
    use crate::retry::{RetryCoordinator, RetryPolicy};
    use serde_json::Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Tracking {
        seen: Mutex<Vec<(PhaseName, u32)>>,
        fail: Option<(PhaseName, u32)>,
    }

    #[async_trait]
    impl ChapterProcessor for Tracking {
        async fn process(&self, item: &WorkItem) -> Result<ChapterOutcome, RemoteError> {
            self.seen.lock().unwrap().push((item.phase, item.chapter));
            if self.fail == Some((item.phase, item.chapter)) {
                return Err(RemoteError::http(403, "forbidden"));
            }
            Ok(ChapterOutcome {
                artifact: Some(format!("{}-{}", item.phase, item.chapter)),
                ..Default::default()
            })
        }
    }

    /// Runs workers as tasks in this process.
    struct TaskLauncher {
        settings: RunSettings,
        processor: Arc<dyn ChapterProcessor>,
        launched: AtomicU32,
    }

    #[async_trait]
    impl WorkerLauncher for TaskLauncher {
        async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerExit, PipelineError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            let manifest = ManifestManager::for_phase(
                &self.settings.state_dir,
                spec.phase,
                self.settings.lock_options.clone(),
            );
            let worker = Worker::new(
                spec.clone(),
                manifest,
                self.processor.clone(),
                RetryCoordinator::new(RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                }),
                Shutdown::new(),
                self.settings.max_chapter_attempts,
            );
            let report = worker.run().await?;
            Ok(WorkerExit {
                worker_id: spec.worker_id.clone(),
                code: Some(if report.interrupted { 130 } else { 0 }),
            })
        }
    }

    /// Always fails to start.
    struct BrokenLauncher;

    #[async_trait]
    impl WorkerLauncher for BrokenLauncher {
        async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerExit, PipelineError> {
            Ok(WorkerExit {
                worker_id: spec.worker_id.clone(),
                code: Some(1),
            })
        }
    }

    fn settings(dir: &std::path::Path) -> RunSettings {
        RunSettings {
            state_dir: dir.to_path_buf(),
            skip_failed: true,
            concurrency: 3,
            max_chapter_attempts: 2,
            stuck_threshold: Duration::from_secs(300),
            lock_options: LockOptions::default().poll_interval(Duration::from_millis(2)),
        }
    }

    fn build_runner(dir: &std::path::Path, processor: Arc<Tracking>) -> (PipelineRunner, Arc<TaskLauncher>) {
        let launcher = Arc::new(TaskLauncher {
            settings: settings(dir),
            processor: processor.clone(),
            launched: AtomicU32::new(0),
        });
        let runner = PipelineRunner::new(
            settings(dir),
            processor,
            RetryCoordinator::new(RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            }),
            Shutdown::new(),
        )
        .with_launcher(launcher.clone());
        (runner, launcher)
    }

    fn fresh_state(runner: &PipelineRunner, chapters: u32) -> PipelineState {
        let manager = runner.state_manager();
        let mut state = manager.initialize("/b.epub", "B", Map::new()).unwrap();
        manager.set_total_chapters(&mut state, chapters).unwrap();
        state
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_run_processes_each_chapter_once() {
        let dir = tempdir().unwrap();
        let processor = Arc::new(Tracking::default());
        let (runner, launcher) = build_runner(dir.path(), processor.clone());
        let mut state = fresh_state(&runner, 6);

        let report = runner.run(&mut state).await.unwrap();

        assert!(!report.is_partial());
        assert!(state.is_complete());
        // parse, extract and illustrate fan out; analyze runs in-process
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 9);

        let seen = processor.seen.lock().unwrap().clone();
        for phase in [PhaseName::Parse, PhaseName::Extract, PhaseName::Illustrate] {
            let mut chapters: Vec<u32> = seen.iter().filter(|(p, _)| *p == phase).map(|(_, n)| *n).collect();
            chapters.sort_unstable();
            assert_eq!(chapters, (1..=6).collect::<Vec<_>>(), "phase {phase}");
            assert!(!ManifestManager::for_phase(dir.path(), phase, LockOptions::default()).exists());
        }
        assert_eq!(
            state.chapter(PhaseName::Illustrate, 4).unwrap().artifact.as_deref(),
            Some("illustrate-4")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_chapters_keep_manifest() {
        let dir = tempdir().unwrap();
        let processor = Arc::new(Tracking {
            fail: Some((PhaseName::Illustrate, 5)),
            ..Default::default()
        });
        let (runner, _) = build_runner(dir.path(), processor);
        let mut state = fresh_state(&runner, 6);

        let report = runner.run(&mut state).await.unwrap();

        assert_eq!(report.failed.get(&PhaseName::Illustrate), Some(&vec![5]));
        let chapter = state.chapter(PhaseName::Illustrate, 5).unwrap();
        assert_eq!(chapter.status, Status::Failed);
        assert!(chapter.error.as_deref().unwrap().contains("forbidden"));

        let manifest = ManifestManager::for_phase(dir.path(), PhaseName::Illustrate, LockOptions::default());
        assert!(manifest.exists());
        assert_eq!(manifest.load().unwrap().chapters[&5].retry_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_reuses_manifest_and_retries_failures() {
        let dir = tempdir().unwrap();
        let failing = Arc::new(Tracking {
            fail: Some((PhaseName::Illustrate, 2)),
            ..Default::default()
        });
        let (runner, _) = build_runner(dir.path(), failing);
        let mut state = fresh_state(&runner, 4);
        runner.run(&mut state).await.unwrap();

        let healthy = Arc::new(Tracking::default());
        let (runner, _) = build_runner(dir.path(), healthy.clone());
        let mut state = runner.state_manager().load().unwrap().unwrap();
        runner.state_manager().reopen_failed(&mut state).unwrap();
        let report = runner.run(&mut state).await.unwrap();

        assert!(!report.is_partial());
        assert_eq!(*healthy.seen.lock().unwrap(), vec![(PhaseName::Illustrate, 2)]);
        assert_eq!(
            state.chapter(PhaseName::Illustrate, 2).unwrap().status,
            Status::Completed
        );
        assert!(!ManifestManager::for_phase(dir.path(), PhaseName::Illustrate, LockOptions::default()).exists());
    }

    #[tokio::test]
    async fn test_worker_failure_is_reported_after_fold() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let mut state = manager.initialize("/b.epub", "B", Map::new()).unwrap();
        manager.set_total_chapters(&mut state, 2).unwrap();

        let err = run_phase(
            &manager,
            &mut state,
            PhaseName::Extract,
            &settings(dir.path()),
            &BrokenLauncher,
            &Shutdown::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::WorkerFailed { code: Some(1), .. }));
        let saved = manager.load().unwrap().unwrap();
        assert_eq!(
            saved.chapter(PhaseName::Extract, 1).unwrap().status,
            Status::Failed
        );
    }

    #[test]
    fn test_process_launcher_command_line() {
        let launcher = ProcessLauncher::new(PathBuf::from("/usr/bin/imaginize"), PathBuf::from(".imaginize"))
            .with_exec(Some("./render.sh".into()))
            .with_logging(true, LogFormat::Json);
        let spec = WorkerSpec {
            worker_id: "worker-1-abcd1234".into(),
            phase: PhaseName::Illustrate,
            source_path: "/b.epub".into(),
            title: "B".into(),
        };
        let cmd = launcher.command(&spec);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--state-dir", ".imaginize", "--verbose", "--log-format", "json", "worker",
                "--phase", "illustrate", "--worker-id", "worker-1-abcd1234", "--source",
                "/b.epub", "--title", "B", "--exec", "./render.sh",
            ]
        );
    }
}
