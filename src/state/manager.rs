use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::migrate::{Migrator, stored_version};
use super::types::{ChapterUpdate, PhaseName, PipelineState, Status, SubPhaseState};
use crate::errors::{PersistError, StateError};
use crate::persist;

/// File name of the state record inside the state directory.
pub const STATE_FILE: &str = "state.json";

/// Owns the on-disk progress record for one run.
///
/// There is a single writer per run (the driver), so writes go straight through the
/// atomic writer without a lock.
pub struct StateManager {
    state_file: PathBuf,
    migrator: Migrator,
}

impl StateManager {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_file: state_dir.join(STATE_FILE),
            migrator: Migrator::default(),
        }
    }

    #[must_use]
    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    /// Create and persist a fresh state with every phase `not_started`.
    pub fn initialize(
        &self,
        source_path: &str,
        title: &str,
        config: Map<String, Value>,
    ) -> Result<PipelineState, StateError> {
        let state = PipelineState::new(source_path, title, config);
        persist::write_json(&self.state_file, &state)?;
        info!(path = %self.state_file.display(), title, "Initialized pipeline state");
        Ok(state)
    }

    /// Load the state record, migrating it to the current schema. A migrated record is
    /// written back so the file carries the current version.
    ///
    /// Returns `Ok(None)` when no state file exists. A file that exists but cannot be
    /// parsed or migrated is an error.
    pub fn load(&self) -> Result<Option<PipelineState>, StateError> {
        let raw: Option<Value> = match persist::read_json(&self.state_file) {
            Ok(raw) => raw,
            Err(PersistError::Parse { source, .. }) => {
                return Err(self.corrupt(source.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        let stored = stored_version(&raw).ok();
        let migrated = self.migrate(raw)?;
        let mut state: PipelineState =
            serde_json::from_value(migrated).map_err(|e| self.corrupt(e.to_string()))?;
        state.fill_missing_phases();
        if stored != Some(self.migrator.current()) {
            persist::write_json(&self.state_file, &state)?;
            info!(
                path = %self.state_file.display(),
                from = stored.unwrap_or(1),
                to = state.schema_version,
                "Migrated pipeline state on disk"
            );
        }
        debug!(
            path = %self.state_file.display(),
            version = state.schema_version,
            "Loaded pipeline state"
        );
        Ok(Some(state))
    }

    /// Apply the migration chain. The result always carries the current version.
    pub fn migrate(&self, raw: Value) -> Result<Value, StateError> {
        if !raw.is_object() {
            return Err(self.corrupt("expected a JSON object".to_string()));
        }
        self.migrator.migrate(raw)
    }

    /// Stamp `updatedAt` and persist.
    pub fn save(&self, state: &mut PipelineState) -> Result<(), StateError> {
        state.metadata.updated_at = Utc::now();
        persist::write_json(&self.state_file, state)?;
        Ok(())
    }

    pub fn set_phase_status(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
        status: Status,
    ) -> Result<(), StateError> {
        let entry = state.phase_mut(phase);
        entry.status = status;
        if status == Status::Completed {
            entry.completed_at = Some(Utc::now());
            entry.error = None;
            entry.current_sub_phase = None;
        }
        state.metadata.last_phase = Some(phase);
        recount_processed(state);
        info!(phase = %phase, status = %status, "Phase status changed");
        self.save(state)
    }

    /// Mark a phase failed with a reason.
    pub fn fail_phase(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
        error: impl Into<String>,
    ) -> Result<(), StateError> {
        state.phase_mut(phase).error = Some(error.into());
        self.set_phase_status(state, phase, Status::Failed)
    }

    /// Record progress of one pass of a multi-pass phase.
    pub fn set_sub_phase_progress(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
        sub_phase: &str,
        status: Status,
        progress: u32,
        total: u32,
    ) -> Result<(), StateError> {
        let entry = state.phase_mut(phase);
        entry.sub_phases.insert(
            sub_phase.to_string(),
            SubPhaseState {
                status,
                progress,
                total,
            },
        );
        entry.current_sub_phase = match status {
            Status::Completed | Status::Skipped => None,
            _ => Some(sub_phase.to_string()),
        };
        self.save(state)
    }

    /// Merge a partial chapter record and persist.
    pub fn set_chapter_status(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
        chapter: u32,
        update: ChapterUpdate,
    ) -> Result<(), StateError> {
        let status = update.status;
        state
            .phase_mut(phase)
            .chapters
            .entry(chapter)
            .or_default()
            .merge(update, Utc::now());
        state.metadata.last_phase = Some(phase);
        recount_processed(state);
        if let Some(status) = status {
            debug!(phase = %phase, chapter, status = %status, "Chapter status changed");
        }
        self.save(state)
    }

    /// Merge several chapter records with a single write.
    pub fn apply_chapter_updates(
        &self,
        state: &mut PipelineState,
        phase: PhaseName,
        updates: Vec<(u32, ChapterUpdate)>,
    ) -> Result<(), StateError> {
        if updates.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let chapters = &mut state.phase_mut(phase).chapters;
        for (chapter, update) in updates {
            chapters.entry(chapter).or_default().merge(update, now);
        }
        state.metadata.last_phase = Some(phase);
        recount_processed(state);
        self.save(state)
    }

    pub fn set_total_chapters(
        &self,
        state: &mut PipelineState,
        total: u32,
    ) -> Result<(), StateError> {
        state.metadata.total_chapters = total;
        self.save(state)
    }

    /// Put failed phases, and completed phases with failed chapters, back to
    /// `in_progress` so their unfinished chapters are retried. Returns the reopened phases.
    pub fn reopen_failed(&self, state: &mut PipelineState) -> Result<Vec<PhaseName>, StateError> {
        let reopened: Vec<PhaseName> = PhaseName::ALL
            .into_iter()
            .filter(|p| match state.phase_status(*p) {
                Status::Failed => true,
                Status::Completed => !state.failed_chapters(*p).is_empty(),
                _ => false,
            })
            .collect();
        if reopened.is_empty() {
            return Ok(reopened);
        }
        for phase in &reopened {
            let entry = state.phase_mut(*phase);
            entry.status = Status::InProgress;
            entry.error = None;
            info!(phase = %phase, "Reopened failed phase");
        }
        self.save(state)?;
        Ok(reopened)
    }

    /// Delete the state file. A missing file is not an error.
    pub fn discard(&self) -> Result<(), StateError> {
        match std::fs::remove_file(&self.state_file) {
            Ok(()) => {
                info!(path = %self.state_file.display(), "Discarded pipeline state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistError::Write {
                path: self.state_file.clone(),
                source,
            }
            .into()),
        }
    }

    fn corrupt(&self, message: String) -> StateError {
        StateError::Corrupt {
            path: self.state_file.clone(),
            message,
        }
    }
}

fn recount_processed(state: &mut PipelineState) {
    state.metadata.processed_chapters = state
        .metadata
        .last_phase
        .map_or(0, |phase| state.completed_chapters(phase).len() as u32);
}
