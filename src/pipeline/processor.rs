//! The per-chapter work seam.
//!
//! The pipeline only knows that a chapter of a phase is handed to a [`ChapterProcessor`]
//! and comes back as a [`ChapterOutcome`] or a [`RemoteError`]. The bundled
//! [`CommandProcessor`] runs a shell command per chapter and treats it as the remote
//! collaborator: its stderr is parsed into a `RemoteError` for classification.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::{RemoteError, RetryError};
use crate::retry::RetryCoordinator;
use crate::state::{ChapterUpdate, PhaseName, Status};

/// One unit of work handed to a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub phase: PhaseName,
    pub sub_phase: Option<String>,
    pub chapter: u32,
    pub source_path: String,
    pub title: String,
}

/// What a processor reports for a finished chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterOutcome {
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub element_count: Option<u32>,
    #[serde(default)]
    pub scene_count: Option<u32>,
}

impl ChapterOutcome {
    /// Read the outcome from command stdout: the last line that parses as a JSON object.
    /// Anything else (or nothing) is an empty outcome.
    pub fn from_stdout(stdout: &str) -> Self {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str(line).ok())
            .unwrap_or_default()
    }

    /// State update recording this outcome as a completed chapter.
    pub fn into_update(self) -> ChapterUpdate {
        ChapterUpdate {
            status: Some(Status::Completed),
            tokens_used: self.tokens_used,
            artifact: self.artifact,
            element_count: self.element_count,
            scene_count: self.scene_count,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ChapterProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem) -> Result<ChapterOutcome, RemoteError>;
}

/// Runs `sh -c <command>` once per chapter.
///
/// The work item is passed through `IMAGINIZE_*` environment variables. Exit 0 is
/// success; any other exit is a remote error built from stderr.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    command: String,
    timeout: Option<Duration>,
}

impl CommandProcessor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl ChapterProcessor for CommandProcessor {
    async fn process(&self, item: &WorkItem) -> Result<ChapterOutcome, RemoteError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("IMAGINIZE_PHASE", item.phase.as_str())
            .env("IMAGINIZE_SUB_PHASE", item.sub_phase.as_deref().unwrap_or(""))
            .env("IMAGINIZE_CHAPTER", item.chapter.to_string())
            .env("IMAGINIZE_SOURCE", &item.source_path)
            .env("IMAGINIZE_TITLE", &item.title);

        debug!(
            phase = %item.phase,
            chapter = item.chapter,
            command = %self.command,
            "Running chapter command"
        );

        let output = cmd.output();
        let output = match self.timeout {
            Some(limit) => match timeout(limit, output).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(RemoteError::new(format!(
                        "Chapter command timed out after {}ms",
                        limit.as_millis()
                    ))
                    .with_code("ETIMEDOUT"));
                }
            },
            None => output.await,
        };
        let output = output.map_err(|e| {
            RemoteError::new(format!("Failed to spawn chapter command '{}': {e}", self.command))
        })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(ChapterOutcome::from_stdout(&stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if stderr.trim().is_empty() {
            match output.status.code() {
                Some(code) => format!("Chapter command exited with code {code}"),
                None => "Chapter command was killed by a signal".to_string(),
            }
        } else {
            stderr.into_owned()
        };
        Err(RemoteError::parse(&text))
    }
}

/// Final result of one chapter after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterResult {
    Completed(ChapterOutcome),
    Failed(String),
    /// A retry wait was cut short by shutdown; the chapter is abandoned.
    Interrupted,
}

/// Error text recorded for chapters abandoned on shutdown.
pub const INTERRUPTED: &str = "interrupted";

/// Process one chapter under the retry coordinator.
///
/// A failure seen after shutdown was triggered counts as an interruption: Ctrl-C also
/// reaches the chapter command, which then dies by signal.
pub async fn run_chapter(
    processor: &dyn ChapterProcessor,
    retry: &RetryCoordinator,
    item: &WorkItem,
) -> ChapterResult {
    match retry.run(|_| processor.process(item)).await {
        Ok(outcome) => ChapterResult::Completed(outcome),
        Err(RetryError::Cancelled) => ChapterResult::Interrupted,
        Err(_) if retry.is_shutting_down() => ChapterResult::Interrupted,
        Err(err @ (RetryError::Fatal(_) | RetryError::Exhausted { .. })) => {
            ChapterResult::Failed(err.to_string())
        }
    }
}
