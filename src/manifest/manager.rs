//! Lock-protected chapter claiming shared by concurrent worker processes.
//!
//! Every mutation runs as one critical section over the whole file:
//! lock → read → mutate → write → unlock. Reads that only report (progress, stuck scan)
//! go straight to disk; atomic writes mean they never see a torn file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::types::{
    ChapterManifestEntry, ClaimOutcome, EntryStatus, MANIFEST_SCHEMA_VERSION, ManifestFile,
    ManifestProgress,
};
use crate::errors::ManifestError;
use crate::persist::{self, LockOptions};
use crate::state::PhaseName;

#[derive(Debug, Clone)]
pub struct ManifestManager {
    path: PathBuf,
    lock_path: PathBuf,
    lock_options: LockOptions,
}

impl ManifestManager {
    pub fn new(path: PathBuf, lock_options: LockOptions) -> Self {
        let lock_path = persist::lock_path_for(&path);
        Self {
            path,
            lock_path,
            lock_options,
        }
    }

    /// Manifest for one phase of the run in `state_dir` (`manifest-<phase>.json`).
    pub fn for_phase(state_dir: &Path, phase: PhaseName, lock_options: LockOptions) -> Self {
        Self::new(state_dir.join(format!("manifest-{phase}.json")), lock_options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write a fresh manifest with every chapter pending, replacing any existing one.
    pub fn create(&self, total_chapters: u32) -> Result<ManifestFile, ManifestError> {
        let guard = persist::acquire(&self.lock_path, &self.lock_options)?;
        let manifest = ManifestFile::new(total_chapters);
        persist::write_json(&self.path, &manifest)?;
        guard.release()?;
        info!(path = %self.path.display(), total_chapters, "Created chapter manifest");
        Ok(manifest)
    }

    pub fn load(&self) -> Result<ManifestFile, ManifestError> {
        let manifest: ManifestFile =
            persist::read_json(&self.path)?.ok_or_else(|| ManifestError::Missing {
                path: self.path.clone(),
            })?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                path: self.path.clone(),
                found: manifest.schema_version,
                current: MANIFEST_SCHEMA_VERSION,
            });
        }
        Ok(manifest)
    }

    /// Claim one chapter for `worker`. Losing the race yields `AlreadyClaimed`.
    pub fn claim(&self, chapter: u32, worker: &str) -> Result<ClaimOutcome, ManifestError> {
        self.update(|manifest| {
            let total = manifest.total_chapters;
            let entry = manifest
                .chapters
                .get_mut(&chapter)
                .ok_or(ManifestError::UnknownChapter { chapter, total })?;
            if !entry.status.is_claimable() {
                return Ok(ClaimOutcome::AlreadyClaimed {
                    status: entry.status,
                    claimed_by: entry.claimed_by.clone(),
                });
            }
            take_claim(entry, worker);
            debug!(chapter, worker, "Claimed chapter");
            Ok(ClaimOutcome::Claimed(entry.clone()))
        })
    }

    /// Claim the lowest-numbered claimable chapter, if any.
    ///
    /// Failed chapters that already used `max_attempts` tries are skipped.
    pub fn claim_next(
        &self,
        worker: &str,
        max_attempts: u32,
    ) -> Result<Option<(u32, ChapterManifestEntry)>, ManifestError> {
        self.update(|manifest| {
            let next = manifest
                .chapters
                .iter_mut()
                .find(|(_, entry)| entry.is_claimable(max_attempts));
            Ok(next.map(|(chapter, entry)| {
                take_claim(entry, worker);
                debug!(chapter, worker, "Claimed chapter");
                (*chapter, entry.clone())
            }))
        })
    }

    pub fn mark_in_progress(&self, chapter: u32, worker: &str) -> Result<(), ManifestError> {
        self.transition(chapter, worker, EntryStatus::InProgress, |_| {})
    }

    pub fn mark_completed(
        &self,
        chapter: u32,
        worker: &str,
        artifact: Option<String>,
        tokens_used: Option<u64>,
    ) -> Result<(), ManifestError> {
        self.transition(chapter, worker, EntryStatus::Completed, |entry| {
            entry.completed_at = Some(Utc::now());
            entry.error = None;
            entry.artifact = artifact;
            entry.tokens_used = tokens_used;
        })
    }

    /// Record a failure. The entry stays claimable until it runs out of attempts.
    pub fn mark_failed(&self, chapter: u32, worker: &str, error: &str) -> Result<(), ManifestError> {
        self.transition(chapter, worker, EntryStatus::Failed, |entry| {
            entry.failed_at = Some(Utc::now());
            entry.error = Some(error.to_string());
            entry.retry_count += 1;
        })
    }

    /// Claimed or in-progress chapters whose claim is older than `threshold`.
    pub fn detect_stuck(&self, threshold: Duration) -> Result<Vec<u32>, ManifestError> {
        let stuck = self.load()?.stuck_chapters(Utc::now(), threshold);
        if !stuck.is_empty() {
            warn!(
                chapters = ?stuck,
                threshold_ms = threshold.as_millis() as u64,
                "Detected stuck chapters"
            );
        }
        Ok(stuck)
    }

    /// Return chapters to `pending` with a fresh attempt budget.
    ///
    /// Completed and already pending chapters are left alone. Returns the chapters that
    /// were reset.
    pub fn reset_to_pending(&self, chapters: &[u32]) -> Result<Vec<u32>, ManifestError> {
        self.update(|manifest| {
            let mut reset = Vec::new();
            for chapter in chapters {
                let Some(entry) = manifest.chapters.get_mut(chapter) else {
                    continue;
                };
                if matches!(entry.status, EntryStatus::Pending | EntryStatus::Completed) {
                    continue;
                }
                info!(
                    chapter,
                    from = %entry.status,
                    previous_owner = entry.claimed_by.as_deref().unwrap_or("none"),
                    "Resetting chapter to pending"
                );
                entry.status = EntryStatus::Pending;
                entry.claimed_by = None;
                entry.claimed_at = None;
                entry.retry_count = 0;
                reset.push(*chapter);
            }
            Ok(reset)
        })
    }

    /// Mark chapters already finished elsewhere as completed.
    ///
    /// Only unclaimed entries (`pending` or `failed`) are seeded. This is the one path to
    /// `completed` that skips the claim cycle; a chapter held by a worker keeps its claim.
    pub fn seed_completed(&self, chapters: &[u32]) -> Result<Vec<u32>, ManifestError> {
        self.update(|manifest| {
            let now = Utc::now();
            let mut seeded = Vec::new();
            for chapter in chapters {
                let Some(entry) = manifest.chapters.get_mut(chapter) else {
                    continue;
                };
                if !entry.status.is_claimable() {
                    continue;
                }
                entry.status = EntryStatus::Completed;
                entry.completed_at = Some(now);
                entry.error = None;
                seeded.push(*chapter);
            }
            Ok(seeded)
        })
    }

    pub fn progress(&self) -> Result<ManifestProgress, ManifestError> {
        Ok(self.load()?.progress())
    }

    pub fn is_drained(&self, max_attempts: u32) -> Result<bool, ManifestError> {
        Ok(self.load()?.is_drained(max_attempts))
    }

    /// Remove the manifest file. A missing file is not an error.
    pub fn delete(&self) -> Result<(), ManifestError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Deleted chapter manifest");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(crate::errors::PersistError::Write {
                path: self.path.clone(),
                source,
            }
            .into()),
        }
    }

    /// Move one owned entry to `to`, then apply `apply`.
    fn transition(
        &self,
        chapter: u32,
        worker: &str,
        to: EntryStatus,
        apply: impl FnOnce(&mut ChapterManifestEntry),
    ) -> Result<(), ManifestError> {
        self.update(|manifest| {
            let total = manifest.total_chapters;
            let entry = manifest
                .chapters
                .get_mut(&chapter)
                .ok_or(ManifestError::UnknownChapter { chapter, total })?;
            if !entry.status.can_transition(to) {
                return Err(ManifestError::InvalidTransition {
                    chapter,
                    from: entry.status,
                    to,
                });
            }
            if let Some(owner) = &entry.claimed_by
                && owner != worker
            {
                return Err(ManifestError::NotOwner {
                    chapter,
                    owner: owner.clone(),
                    worker: worker.to_string(),
                });
            }
            entry.status = to;
            apply(entry);
            debug!(chapter, worker, status = %to, "Chapter transition");
            Ok(())
        })
    }

    /// Run `mutate` inside the manifest lock and persist the result if it changed.
    ///
    /// An error from `mutate` leaves the file untouched.
    fn update<R>(
        &self,
        mutate: impl FnOnce(&mut ManifestFile) -> Result<R, ManifestError>,
    ) -> Result<R, ManifestError> {
        let guard = persist::acquire(&self.lock_path, &self.lock_options)?;
        let mut manifest = self.load()?;
        let before = manifest.clone();
        let result = mutate(&mut manifest)?;
        if manifest != before {
            manifest.last_updated = Utc::now();
            persist::write_json(&self.path, &manifest)?;
        }
        guard.release()?;
        Ok(result)
    }
}

fn take_claim(entry: &mut ChapterManifestEntry, worker: &str) {
    entry.status = EntryStatus::Claimed;
    entry.claimed_by = Some(worker.to_string());
    entry.claimed_at = Some(Utc::now());
    entry.completed_at = None;
}
