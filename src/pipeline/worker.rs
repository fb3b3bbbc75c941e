//! A worker process's claim loop.
//!
//! Claim the lowest claimable chapter, mark it in progress, process it under the retry
//! coordinator, record the result, repeat. The loop ends when nothing is claimable or
//! shutdown is requested. Manifest calls block on the lock file, so they run on the
//! blocking pool.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::blocking;
use super::processor::{ChapterProcessor, ChapterResult, INTERRUPTED, WorkItem, run_chapter};
use crate::errors::PipelineError;
use crate::manifest::ManifestManager;
use crate::retry::RetryCoordinator;
use crate::shutdown::Shutdown;
use crate::state::PhaseName;

/// Identity for a newly started worker: `worker-<pid>-<8 hex chars>`.
pub fn new_worker_id() -> String {
    worker_id_with_prefix(&std::process::id().to_string())
}

/// `worker-<prefix>-<8 hex chars>`.
pub fn worker_id_with_prefix(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{prefix}-{}", &suffix[..8])
}

/// What a worker is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub worker_id: String,
    pub phase: PhaseName,
    pub source_path: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: Vec<u32>,
    pub failed: Vec<u32>,
    pub interrupted: bool,
}

pub struct Worker {
    spec: WorkerSpec,
    manifest: ManifestManager,
    processor: Arc<dyn ChapterProcessor>,
    retry: RetryCoordinator,
    shutdown: Shutdown,
    max_attempts: u32,
}

impl Worker {
    pub fn new(
        spec: WorkerSpec,
        manifest: ManifestManager,
        processor: Arc<dyn ChapterProcessor>,
        retry: RetryCoordinator,
        shutdown: Shutdown,
        max_attempts: u32,
    ) -> Self {
        Self {
            spec,
            manifest,
            processor,
            retry: retry.with_shutdown(shutdown.clone()),
            shutdown,
            max_attempts,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.worker_id
    }

    pub async fn run(&self) -> Result<WorkerReport, PipelineError> {
        let mut report = WorkerReport::default();
        info!(worker = %self.id(), phase = %self.spec.phase, "Worker started");

        loop {
            if self.shutdown.is_triggered() {
                report.interrupted = true;
                break;
            }

            let claimed = {
                let manifest = self.manifest.clone();
                let worker = self.spec.worker_id.clone();
                let max_attempts = self.max_attempts;
                blocking(move || manifest.claim_next(&worker, max_attempts)).await?
            };
            let Some((chapter, entry)) = claimed else {
                break;
            };
            info!(
                worker = %self.id(),
                chapter,
                attempt = entry.retry_count + 1,
                "Processing chapter"
            );
            self.record(move |m, w| m.mark_in_progress(chapter, w)).await?;

            let item = WorkItem {
                phase: self.spec.phase,
                sub_phase: None,
                chapter,
                source_path: self.spec.source_path.clone(),
                title: self.spec.title.clone(),
            };
            match run_chapter(self.processor.as_ref(), &self.retry, &item).await {
                ChapterResult::Completed(outcome) => {
                    self.record(move |m, w| {
                        m.mark_completed(chapter, w, outcome.artifact, outcome.tokens_used)
                    })
                    .await?;
                    report.completed.push(chapter);
                }
                ChapterResult::Failed(message) => {
                    warn!(worker = %self.id(), chapter, error = %message, "Chapter failed");
                    self.record(move |m, w| m.mark_failed(chapter, w, &message))
                        .await?;
                    report.failed.push(chapter);
                }
                ChapterResult::Interrupted => {
                    self.record(move |m, w| m.mark_failed(chapter, w, INTERRUPTED))
                        .await?;
                    report.interrupted = true;
                    break;
                }
            }
        }

        info!(
            worker = %self.id(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            interrupted = report.interrupted,
            "Worker finished"
        );
        Ok(report)
    }

    async fn record<F>(&self, op: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&ManifestManager, &str) -> Result<(), crate::errors::ManifestError>
            + Send
            + 'static,
    {
        let manifest = self.manifest.clone();
        let worker = self.spec.worker_id.clone();
        blocking(move || op(&manifest, &worker)).await
    }
}
