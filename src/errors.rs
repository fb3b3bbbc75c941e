//! Typed error hierarchy for imaginize.
//!
//! One enum per subsystem:
//! - `PersistError`: atomic file writes and JSON reads
//! - `LockError`: lock-file acquisition
//! - `StateError`: pipeline state loading and schema migration
//! - `ManifestError`: concurrent chapter claiming
//! - `RetryError`: remote calls that could not be completed
//! - `PipelineError`: run-level failures surfaced by the driver
//!
//! `exit_code_for` maps any of these (possibly wrapped in `anyhow` context) to the
//! process exit codes automation relies on.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::manifest::EntryStatus;
use crate::state::PhaseName;

/// Everything went through.
pub const EXIT_SUCCESS: u8 = 0;
/// Unclassified failure.
pub const EXIT_FAILURE: u8 = 1;
/// Some chapters failed; the rest of the run completed.
pub const EXIT_PARTIAL: u8 = 2;
/// The run cannot continue without an operator (corrupt state, lock timeout, ...).
pub const EXIT_OPERATOR: u8 = 3;
/// Stopped by Ctrl-C; resume with `--continue`.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Errors from crash-safe persistence.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from lock-file acquisition and release.
#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "Timed out after {}ms waiting for lock {path} (held by {holder}). If no worker is running, delete the lock file",
        waited.as_millis()
    )]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: String,
    },

    #[error("Lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from loading, migrating and saving pipeline state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State file {path} is corrupt: {message}. Delete it or re-run with --force to start over")]
    Corrupt { path: PathBuf, message: String },

    #[error("Invalid schemaVersion {value}: expected a positive integer")]
    InvalidVersion { value: String },

    #[error(
        "State schema version {found} is newer than the supported version {current}. Upgrade imaginize or re-run with --force"
    )]
    UnsupportedVersion { found: u32, current: u32 },

    #[error(
        "No migration registered from schema version {from}. Re-run with --force to regenerate the state"
    )]
    MissingMigration { from: u32 },

    #[error("Migration from schema version {from} failed: {message}")]
    Migration { from: u32, message: String },

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Errors from the concurrent chapter manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest not found at {path}")]
    Missing { path: PathBuf },

    #[error("Manifest {path} has schema version {found}, expected {current}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        current: u32,
    },

    #[error("Chapter {chapter} is not in the manifest ({total} chapters)")]
    UnknownChapter { chapter: u32, total: u32 },

    #[error("Chapter {chapter} cannot move from {from} to {to}")]
    InvalidTransition {
        chapter: u32,
        from: EntryStatus,
        to: EntryStatus,
    },

    #[error("Chapter {chapter} is claimed by {owner}, not {worker}")]
    NotOwner {
        chapter: u32,
        owner: String,
        worker: String,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// A failed call to a remote collaborator (model API, image service, external command).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// HTTP-style status code, when the collaborator reported one
    pub status: Option<u16>,
    /// Network error code such as `ECONNRESET`
    pub code: Option<String>,
    /// Human-readable description
    pub message: String,
    /// Server-advertised wait before retrying
    pub retry_after: Option<Duration>,
}

/// Outcome of a remote call that the retry coordinator could not turn into success.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Fatal remote error: {0}")]
    Fatal(RemoteError),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: RemoteError },

    #[error("Interrupted while waiting to retry")]
    Cancelled,
}

/// Run-level failures reported by the pipeline driver and workers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase {phase}: {} chapter(s) failed: {failed:?}", failed.len())]
    ChaptersFailed { phase: PhaseName, failed: Vec<u32> },

    #[error("Interrupted. Run again with --continue to resume")]
    Interrupted,

    #[error("State already exists at {path}. Use --continue to resume or --force to start over")]
    StateExists { path: PathBuf },

    #[error("No processor configured. Pass --exec or set [processor] command in imaginize.toml")]
    NoProcessor,

    #[error("Worker {worker} exited with {}", code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    WorkerFailed { worker: String, code: Option<i32> },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LockError {
    pub fn exit_code(&self) -> u8 {
        match self {
            LockError::Timeout { .. } => EXIT_OPERATOR,
            LockError::Io { .. } => EXIT_FAILURE,
        }
    }
}

impl StateError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StateError::Persist(PersistError::Write { .. } | PersistError::Read { .. }) => {
                EXIT_FAILURE
            }
            _ => EXIT_OPERATOR,
        }
    }
}

impl ManifestError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ManifestError::Lock(err) => err.exit_code(),
            ManifestError::UnsupportedVersion { .. }
            | ManifestError::Persist(PersistError::Parse { .. }) => EXIT_OPERATOR,
            _ => EXIT_FAILURE,
        }
    }
}

impl PipelineError {
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::ChaptersFailed { .. } => EXIT_PARTIAL,
            PipelineError::Interrupted => EXIT_INTERRUPTED,
            PipelineError::StateExists { .. } | PipelineError::NoProcessor => EXIT_OPERATOR,
            PipelineError::WorkerFailed { code, .. } => match code.and_then(|c| u8::try_from(c).ok()) {
                Some(EXIT_OPERATOR) => EXIT_OPERATOR,
                Some(EXIT_INTERRUPTED) => EXIT_INTERRUPTED,
                _ => EXIT_FAILURE,
            },
            PipelineError::State(err) => err.exit_code(),
            PipelineError::Manifest(err) => err.exit_code(),
            PipelineError::Other(err) => exit_code_for(err),
        }
    }
}

/// Map an error chain to a process exit code.
///
/// The first recognised error in the chain wins; anything unrecognised is `EXIT_FAILURE`.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<StateError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ManifestError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<LockError>() {
            return e.exit_code();
        }
    }
    EXIT_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn lock_timeout_needs_operator() {
        let err = LockError::Timeout {
            path: PathBuf::from("/tmp/manifest.json.lock"),
            waited: Duration::from_millis(1500),
            holder: "worker-1".to_string(),
        };
        assert_eq!(err.exit_code(), EXIT_OPERATOR);
        let msg = err.to_string();
        assert!(msg.contains("1500ms"));
        assert!(msg.contains("worker-1"));
    }

    #[test]
    fn migration_failures_need_operator() {
        let err = StateError::MissingMigration { from: 1 };
        assert_eq!(err.exit_code(), EXIT_OPERATOR);
        assert!(err.to_string().contains("--force"));

        let err = StateError::UnsupportedVersion {
            found: 9,
            current: 3,
        };
        assert_eq!(err.exit_code(), EXIT_OPERATOR);
    }

    #[test]
    fn failed_chapters_are_partial_success() {
        let err = PipelineError::ChaptersFailed {
            phase: PhaseName::Illustrate,
            failed: vec![2, 5],
        };
        assert_eq!(err.exit_code(), EXIT_PARTIAL);
        assert!(err.to_string().contains("2 chapter(s)"));
    }

    #[test]
    fn exit_code_sees_through_anyhow_context() {
        let err: anyhow::Error = Err::<(), _>(StateError::MissingMigration { from: 2 })
            .context("Failed to load pipeline state")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_OPERATOR);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: anyhow::Error = anyhow::Error::new(io).context("something else");
        assert_eq!(exit_code_for(&err), EXIT_FAILURE);
    }

    #[test]
    fn nested_lock_timeout_maps_through_pipeline_error() {
        let lock = LockError::Timeout {
            path: PathBuf::from("m.lock"),
            waited: Duration::from_secs(1),
            holder: "w".into(),
        };
        let err = PipelineError::Manifest(ManifestError::Lock(lock));
        assert_eq!(err.exit_code(), EXIT_OPERATOR);
        let wrapped = anyhow::Error::new(err);
        assert_eq!(exit_code_for(&wrapped), EXIT_OPERATOR);
    }

    #[test]
    fn worker_exit_codes_propagate() {
        let err = PipelineError::WorkerFailed {
            worker: "w1".into(),
            code: Some(3),
        };
        assert_eq!(err.exit_code(), EXIT_OPERATOR);
        let err = PipelineError::WorkerFailed {
            worker: "w1".into(),
            code: None,
        };
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert!(err.to_string().contains("a signal"));
    }

    #[test]
    fn remote_error_displays_message() {
        let err = RemoteError {
            status: Some(503),
            code: None,
            message: "service unavailable".into(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "service unavailable");
    }
}
