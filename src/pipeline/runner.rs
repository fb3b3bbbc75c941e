//! The pipeline driver: walks phases in order, one chapter at a time, and hands
//! concurrency-capable phases to worker processes when asked to.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::concurrent::{self, WorkerLauncher};
use super::processor::{ChapterProcessor, ChapterResult, INTERRUPTED, WorkItem, run_chapter};
use crate::errors::PipelineError;
use crate::persist::LockOptions;
use crate::retry::RetryCoordinator;
use crate::shutdown::Shutdown;
use crate::state::{ChapterUpdate, PhaseName, PipelineState, StateManager, Status};

/// Settings the driver needs beyond the state itself.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub state_dir: PathBuf,
    /// Keep going after a chapter fails
    pub skip_failed: bool,
    /// Worker processes for concurrency-capable phases; `1` runs everything in-process
    pub concurrency: usize,
    pub max_chapter_attempts: u32,
    pub stuck_threshold: Duration,
    pub lock_options: LockOptions,
}

/// What happened to one phase in this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub processed: u32,
    pub failed: Vec<u32>,
    pub interrupted: bool,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub phases_run: Vec<PhaseName>,
    pub chapters_processed: u32,
    pub failed: BTreeMap<PhaseName, Vec<u32>>,
    pub interrupted: bool,
    pub duration: Duration,
}

impl RunReport {
    /// Chapters were recorded as failed but the run went on.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    /// The run-level error for this report, if any.
    pub fn into_result(self) -> Result<RunReport, PipelineError> {
        if self.interrupted {
            return Err(PipelineError::Interrupted);
        }
        if let Some((phase, failed)) = self.failed.iter().next() {
            return Err(PipelineError::ChaptersFailed {
                phase: *phase,
                failed: failed.clone(),
            });
        }
        Ok(self)
    }
}

pub struct PipelineRunner {
    state_manager: StateManager,
    processor: Arc<dyn ChapterProcessor>,
    retry: RetryCoordinator,
    shutdown: Shutdown,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    settings: RunSettings,
}

impl PipelineRunner {
    pub fn new(
        settings: RunSettings,
        processor: Arc<dyn ChapterProcessor>,
        retry: RetryCoordinator,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            state_manager: StateManager::new(&settings.state_dir),
            processor,
            retry: retry.with_shutdown(shutdown.clone()),
            shutdown,
            launcher: None,
            settings,
        }
    }

    /// Use `launcher` to fan out concurrency-capable phases.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    /// Run every phase that still has work, in canonical order.
    ///
    /// Chapter failures are recorded and reported, not returned as errors, unless
    /// `skip_failed` is off. An interrupt persists the state and stops between chapters.
    pub async fn run(&self, state: &mut PipelineState) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut report = RunReport::default();

        while let Some(phase) = state.resume_phase() {
            if self.shutdown.is_triggered() {
                report.interrupted = true;
                break;
            }

            if state.phase_status(phase) != Status::InProgress {
                self.state_manager
                    .set_phase_status(state, phase, Status::InProgress)?;
            }
            info!(phase = %phase, "Starting phase");
            report.phases_run.push(phase);

            let outcome = match self.launcher_for(phase) {
                Some(launcher) => {
                    concurrent::run_phase(
                        &self.state_manager,
                        state,
                        phase,
                        &self.settings,
                        launcher,
                        &self.shutdown,
                    )
                    .await?
                }
                None => self.run_phase(state, phase).await?,
            };
            report.chapters_processed += outcome.processed;

            if outcome.interrupted {
                // The phase stays in progress so --continue picks it up.
                self.state_manager.save(state)?;
                report.interrupted = true;
                warn!(phase = %phase, "Run interrupted; state saved");
                break;
            }

            if !outcome.failed.is_empty() {
                report.failed.insert(phase, outcome.failed.clone());
                if !self.settings.skip_failed {
                    let message = format!("chapters failed: {:?}", outcome.failed);
                    self.state_manager.fail_phase(state, phase, message)?;
                    error!(phase = %phase, failed = ?outcome.failed, "Phase failed");
                    report.duration = started.elapsed();
                    return Err(PipelineError::ChaptersFailed {
                        phase,
                        failed: outcome.failed,
                    });
                }
                warn!(phase = %phase, failed = ?outcome.failed, "Phase finished with failed chapters");
            }

            self.state_manager
                .set_phase_status(state, phase, Status::Completed)?;
        }

        report.duration = started.elapsed();
        info!(
            phases = report.phases_run.len(),
            chapters = report.chapters_processed,
            duration_ms = report.duration.as_millis() as u64,
            "Run finished"
        );
        Ok(report)
    }

    fn launcher_for(&self, phase: PhaseName) -> Option<&dyn WorkerLauncher> {
        if self.settings.concurrency > 1 && phase.supports_concurrency() {
            self.launcher.as_deref()
        } else {
            None
        }
    }

    /// Process one phase in-process, pass by pass for multi-pass phases.
    async fn run_phase(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
    ) -> Result<PhaseOutcome, PipelineError> {
        let passes = phase.sub_phases();
        if passes.is_empty() {
            let chapters = pending_chapters(state, phase, None);
            return self.run_pass(state, phase, None, chapters).await;
        }

        let total = state.metadata.total_chapters;
        let mut outcome = PhaseOutcome::default();
        for (index, pass) in passes.iter().enumerate() {
            let chapters = pending_chapters(state, phase, Some(index));
            let pass_done = state
                .phase(phase)
                .and_then(|p| p.sub_phases.get(*pass))
                .is_some_and(|s| s.status.is_done());
            if chapters.is_empty() && pass_done {
                continue;
            }

            let done = passes_reached(state, phase, index);
            self.state_manager
                .set_sub_phase_progress(state, phase, pass, Status::InProgress, done, total)?;

            let pass_outcome = self.run_pass(state, phase, Some(pass), chapters).await?;
            outcome.processed += pass_outcome.processed;
            outcome.failed.extend(pass_outcome.failed);

            let done = passes_reached(state, phase, index);
            if pass_outcome.interrupted {
                outcome.interrupted = true;
                return Ok(outcome);
            }
            self.state_manager
                .set_sub_phase_progress(state, phase, pass, Status::Completed, done, total)?;
        }
        outcome.failed.sort_unstable();
        outcome.failed.dedup();
        Ok(outcome)
    }

    async fn run_pass(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
        pass: Option<&str>,
        chapters: Vec<u32>,
    ) -> Result<PhaseOutcome, PipelineError> {
        let mut outcome = PhaseOutcome::default();
        let last_pass = phase.sub_phases().last().copied();

        for chapter in chapters {
            if self.shutdown.is_triggered() {
                outcome.interrupted = true;
                break;
            }

            let item = WorkItem {
                phase,
                sub_phase: pass.map(str::to_string),
                chapter,
                source_path: state.source_path.clone(),
                title: state.source_title.clone(),
            };
            self.state_manager.set_chapter_status(
                state,
                phase,
                chapter,
                ChapterUpdate::status(Status::InProgress),
            )?;

            let update = match run_chapter(self.processor.as_ref(), &self.retry, &item).await {
                ChapterResult::Completed(result) => {
                    outcome.processed += 1;
                    info!(phase = %phase, pass = pass.unwrap_or("-"), chapter, "Chapter completed");
                    let mut update = result.into_update();
                    if let Some(pass) = pass {
                        update.last_sub_phase = Some(pass.to_string());
                        if Some(pass) != last_pass {
                            update.status = Some(Status::InProgress);
                        }
                    }
                    update
                }
                ChapterResult::Failed(message) => {
                    warn!(phase = %phase, chapter, error = %message, "Chapter failed");
                    outcome.failed.push(chapter);
                    ChapterUpdate::failed(message)
                }
                ChapterResult::Interrupted => {
                    outcome.interrupted = true;
                    ChapterUpdate::failed(INTERRUPTED)
                }
            };
            self.state_manager
                .set_chapter_status(state, phase, chapter, update)?;

            if outcome.interrupted || (!outcome.failed.is_empty() && !self.settings.skip_failed) {
                break;
            }
        }
        Ok(outcome)
    }
}

/// Chapters that still need `pass` (by index) of `phase`; `None` for single-pass phases.
///
/// A chapter is due for pass `k` once it has finished pass `k - 1` and is not yet
/// completed.
pub fn pending_chapters(state: &PipelineState, phase: PhaseName, pass: Option<usize>) -> Vec<u32> {
    let passes = phase.sub_phases();
    (1..=state.metadata.total_chapters)
        .filter(|n| {
            let Some(chapter) = state.chapter(phase, *n) else {
                return pass.is_none_or(|k| k == 0);
            };
            if chapter.status.is_done() {
                return false;
            }
            match pass {
                None => true,
                Some(k) => next_pass_index(passes, chapter.last_sub_phase.as_deref()) == k,
            }
        })
        .collect()
}

fn next_pass_index(passes: &[&str], last: Option<&str>) -> usize {
    last.and_then(|last| passes.iter().position(|p| *p == last))
        .map_or(0, |i| i + 1)
}

/// Chapters that have finished pass `index` or a later one.
fn passes_reached(state: &PipelineState, phase: PhaseName, index: usize) -> u32 {
    let passes = phase.sub_phases();
    state.phase(phase).map_or(0, |p| {
        p.chapters
            .values()
            .filter(|c| next_pass_index(passes, c.last_sub_phase.as_deref()) > index)
            .count() as u32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use crate::pipeline::processor::ChapterOutcome;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records every call; fails the chapters in `failing` fatally.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(PhaseName, Option<String>, u32)>>,
        failing: HashSet<(PhaseName, u32)>,
    }

    impl Recorder {
        fn failing(failing: &[(PhaseName, u32)]) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(PhaseName, Option<String>, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChapterProcessor for Recorder {
        async fn process(&self, item: &WorkItem) -> Result<ChapterOutcome, RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push((item.phase, item.sub_phase.clone(), item.chapter));
            if self.failing.contains(&(item.phase, item.chapter)) {
                return Err(RemoteError::http(422, "content policy"));
            }
            Ok(ChapterOutcome {
                tokens_used: Some(10),
                artifact: Some(format!("{}-{}.out", item.phase, item.chapter)),
                ..Default::default()
            })
        }
    }

    fn settings(dir: &std::path::Path) -> RunSettings {
        RunSettings {
            state_dir: dir.to_path_buf(),
            skip_failed: true,
            concurrency: 1,
            max_chapter_attempts: 3,
            stuck_threshold: Duration::from_secs(300),
            lock_options: LockOptions::default(),
        }
    }

    fn no_retry() -> RetryCoordinator {
        RetryCoordinator::new(RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        })
    }

    fn fresh_state(runner: &PipelineRunner, chapters: u32) -> PipelineState {
        let manager = runner.state_manager();
        let mut state = manager.initialize("/books/b.epub", "B", Map::new()).unwrap();
        manager.set_total_chapters(&mut state, chapters).unwrap();
        state
    }

    #[tokio::test]
    async fn test_full_run_visits_every_chapter_once_per_pass() {
        let dir = tempdir().unwrap();
        let processor = Arc::new(Recorder::default());
        let runner = PipelineRunner::new(settings(dir.path()), processor.clone(), no_retry(), Shutdown::new());
        let mut state = fresh_state(&runner, 2);

        let report = runner.run(&mut state).await.unwrap();

        assert_eq!(report.phases_run, PhaseName::ALL.to_vec());
        // parse, analyze x2 passes, extract, illustrate
        assert_eq!(report.chapters_processed, 10);
        assert!(!report.is_partial());
        assert!(state.is_complete());

        let analyze_calls: Vec<_> = processor
            .calls()
            .into_iter()
            .filter(|(p, _, _)| *p == PhaseName::Analyze)
            .map(|(_, sub, n)| (sub.unwrap(), n))
            .collect();
        assert_eq!(
            analyze_calls,
            vec![
                ("elements".to_string(), 1),
                ("elements".to_string(), 2),
                ("scenes".to_string(), 1),
                ("scenes".to_string(), 2),
            ]
        );

        let chapter = state.chapter(PhaseName::Illustrate, 2).unwrap();
        assert_eq!(chapter.status, Status::Completed);
        assert_eq!(chapter.artifact.as_deref(), Some("illustrate-2.out"));
        let analyze = state.phase(PhaseName::Analyze).unwrap();
        assert_eq!(analyze.sub_phases["scenes"].progress, 2);
        assert_eq!(analyze.sub_phases["scenes"].status, Status::Completed);
    }

    #[tokio::test]
    async fn test_rerun_after_completion_does_no_work() {
        let dir = tempdir().unwrap();
        let first = Arc::new(Recorder::default());
        let runner = PipelineRunner::new(settings(dir.path()), first, no_retry(), Shutdown::new());
        let mut state = fresh_state(&runner, 3);
        runner.run(&mut state).await.unwrap();
        let finished = runner.state_manager().load().unwrap().unwrap();

        let second = Arc::new(Recorder::default());
        let runner = PipelineRunner::new(settings(dir.path()), second.clone(), no_retry(), Shutdown::new());
        let mut resumed = runner.state_manager().load().unwrap().unwrap();
        let report = runner.run(&mut resumed).await.unwrap();

        assert!(second.calls().is_empty());
        assert_eq!(report.chapters_processed, 0);
        assert_eq!(runner.state_manager().load().unwrap().unwrap(), finished);
    }

    #[tokio::test]
    async fn test_failed_chapter_is_recorded_and_run_continues() {
        let dir = tempdir().unwrap();
        let processor = Arc::new(Recorder::failing(&[(PhaseName::Extract, 2)]));
        let runner = PipelineRunner::new(settings(dir.path()), processor, no_retry(), Shutdown::new());
        let mut state = fresh_state(&runner, 3);

        let report = runner.run(&mut state).await.unwrap();

        assert_eq!(report.failed.get(&PhaseName::Extract), Some(&vec![2]));
        assert!(matches!(
            report.clone().into_result(),
            Err(PipelineError::ChaptersFailed { phase: PhaseName::Extract, .. })
        ));
        let chapter = state.chapter(PhaseName::Extract, 2).unwrap();
        assert_eq!(chapter.status, Status::Failed);
        assert!(chapter.error.as_deref().unwrap().contains("content policy"));
        assert_eq!(state.phase_status(PhaseName::Illustrate), Status::Completed);
    }

    #[tokio::test]
    async fn test_failure_stops_run_without_skip_failed() {
        let dir = tempdir().unwrap();
        let processor = Arc::new(Recorder::failing(&[(PhaseName::Parse, 1)]));
        let runner = PipelineRunner::new(
            RunSettings {
                skip_failed: false,
                ..settings(dir.path())
            },
            processor.clone(),
            no_retry(),
            Shutdown::new(),
        );
        let mut state = fresh_state(&runner, 3);

        let err = runner.run(&mut state).await.unwrap_err();

        assert!(matches!(err, PipelineError::ChaptersFailed { phase: PhaseName::Parse, .. }));
        assert_eq!(processor.calls().len(), 1);
        assert_eq!(state.phase_status(PhaseName::Parse), Status::Failed);
        assert_eq!(state.phase_status(PhaseName::Analyze), Status::NotStarted);
    }

    #[tokio::test]
    async fn test_reopened_phase_retries_only_failed_chapters() {
        let dir = tempdir().unwrap();
        let processor = Arc::new(Recorder::failing(&[(PhaseName::Illustrate, 2)]));
        let runner = PipelineRunner::new(settings(dir.path()), processor, no_retry(), Shutdown::new());
        let mut state = fresh_state(&runner, 3);
        runner.run(&mut state).await.unwrap();

        let retry = Arc::new(Recorder::default());
        let runner = PipelineRunner::new(settings(dir.path()), retry.clone(), no_retry(), Shutdown::new());
        let mut state = runner.state_manager().load().unwrap().unwrap();
        runner.state_manager().reopen_failed(&mut state).unwrap();
        let report = runner.run(&mut state).await.unwrap();

        assert_eq!(retry.calls(), vec![(PhaseName::Illustrate, None, 2)]);
        assert!(!report.is_partial());
        assert!(state.chapter(PhaseName::Illustrate, 2).unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_chapter() {
        let dir = tempdir().unwrap();
        let shutdown = Shutdown::new();

        struct StopAfterFirst(Shutdown);

        #[async_trait]
        impl ChapterProcessor for StopAfterFirst {
            async fn process(&self, _item: &WorkItem) -> Result<ChapterOutcome, RemoteError> {
                self.0.trigger();
                Ok(ChapterOutcome::default())
            }
        }

        let runner = PipelineRunner::new(
            settings(dir.path()),
            Arc::new(StopAfterFirst(shutdown.clone())),
            no_retry(),
            shutdown,
        );
        let mut state = fresh_state(&runner, 3);

        let report = runner.run(&mut state).await.unwrap();

        assert!(report.interrupted);
        assert!(matches!(report.into_result(), Err(PipelineError::Interrupted)));
        let saved = runner.state_manager().load().unwrap().unwrap();
        assert_eq!(saved.phase_status(PhaseName::Parse), Status::InProgress);
        assert_eq!(saved.completed_chapters(PhaseName::Parse), vec![1]);
        assert_eq!(saved.resume_phase(), Some(PhaseName::Parse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_retry_wait_abandons_chapter() {
        let dir = tempdir().unwrap();
        let shutdown = Shutdown::new();

        struct RateLimited;

        #[async_trait]
        impl ChapterProcessor for RateLimited {
            async fn process(&self, _item: &WorkItem) -> Result<ChapterOutcome, RemoteError> {
                Err(RemoteError::http(429, "rate limit"))
            }
        }

        let runner = PipelineRunner::new(
            settings(dir.path()),
            Arc::new(RateLimited),
            RetryCoordinator::default(),
            shutdown.clone(),
        );
        let mut state = fresh_state(&runner, 2);

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.trigger();
        });
        let report = runner.run(&mut state).await.unwrap();

        assert!(report.interrupted);
        let chapter = state.chapter(PhaseName::Parse, 1).unwrap();
        assert_eq!(chapter.status, Status::Failed);
        assert_eq!(chapter.error.as_deref(), Some(INTERRUPTED));
        assert!(state.chapter(PhaseName::Parse, 2).is_none());
    }

    #[tokio::test]
    async fn test_command_killed_by_ctrl_c_is_not_a_failure() {
        let dir = tempdir().unwrap();
        let shutdown = Shutdown::new();

        struct KilledByCtrlC(Shutdown);

        #[async_trait]
        impl ChapterProcessor for KilledByCtrlC {
            async fn process(&self, _item: &WorkItem) -> Result<ChapterOutcome, RemoteError> {
                self.0.trigger();
                Err(RemoteError::new("Chapter command was killed by a signal"))
            }
        }

        let runner = PipelineRunner::new(
            settings(dir.path()),
            Arc::new(KilledByCtrlC(shutdown.clone())),
            no_retry(),
            shutdown,
        );
        let mut state = fresh_state(&runner, 2);

        let report = runner.run(&mut state).await.unwrap();

        assert!(report.interrupted);
        assert!(report.failed.is_empty());
        let saved = runner.state_manager().load().unwrap().unwrap();
        let chapter = saved.chapter(PhaseName::Parse, 1).unwrap();
        assert_eq!(chapter.error.as_deref(), Some(INTERRUPTED));
        assert!(saved.chapter(PhaseName::Parse, 2).is_none());
    }

    #[test]
    fn test_pending_chapters_by_pass() {
        let mut state = PipelineState::new("/b", "B", Map::new());
        state.metadata.total_chapters = 3;
        let now = chrono::Utc::now();
        let analyze = state.phase_mut(PhaseName::Analyze);
        analyze.chapters.entry(1).or_default().merge(
            ChapterUpdate::status(Status::InProgress).with_sub_phase("elements"),
            now,
        );
        analyze.chapters.entry(2).or_default().merge(
            ChapterUpdate::status(Status::Completed).with_sub_phase("scenes"),
            now,
        );

        assert_eq!(pending_chapters(&state, PhaseName::Analyze, Some(0)), vec![3]);
        assert_eq!(pending_chapters(&state, PhaseName::Analyze, Some(1)), vec![1]);
        assert_eq!(pending_chapters(&state, PhaseName::Parse, None), vec![1, 2, 3]);
        assert_eq!(passes_reached(&state, PhaseName::Analyze, 0), 2);
        assert_eq!(passes_reached(&state, PhaseName::Analyze, 1), 1);
    }
}
