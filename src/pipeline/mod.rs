//! Pipeline driver, worker loop and the per-chapter processor seam.
//!
//! - `processor`: what runs for one chapter, and its retry wrapper
//! - `runner`: the single-writer driver over all phases
//! - `concurrent`: fan-out of one phase to worker processes through the manifest
//! - `worker`: the claim loop each worker process runs

pub mod concurrent;
pub mod processor;
pub mod runner;
pub mod worker;

pub use concurrent::{ProcessLauncher, WorkerExit, WorkerLauncher};
pub use processor::{ChapterOutcome, ChapterProcessor, ChapterResult, CommandProcessor, WorkItem};
pub use runner::{PhaseOutcome, PipelineRunner, RunReport, RunSettings};
pub use worker::{Worker, WorkerReport, WorkerSpec, new_worker_id};

use crate::errors::{ManifestError, PipelineError};

/// Run a manifest operation on the blocking pool; lock acquisition sleeps between polls.
pub(crate) async fn blocking<T, F>(op: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, ManifestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("Manifest task failed: {e}")))?
        .map_err(PipelineError::from)
}
