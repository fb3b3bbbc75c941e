use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Status of a chapter in the concurrent manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl EntryStatus {
    /// Forward path `pending → claimed → in_progress → completed|failed`, plus the retry
    /// edges out of `failed`.
    pub fn can_transition(self, to: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Failed, Claimed)
        )
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Failed)
    }

    /// Held by a worker.
    pub fn is_active(self) -> bool {
        matches!(self, EntryStatus::Claimed | EntryStatus::InProgress)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Claimed => "claimed",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterManifestEntry {
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl ChapterManifestEntry {
    /// Claimable by a worker that allows `max_attempts` tries per chapter.
    pub fn is_claimable(&self, max_attempts: u32) -> bool {
        match self.status {
            EntryStatus::Pending => true,
            EntryStatus::Failed => self.retry_count < max_attempts,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub schema_version: u32,
    pub total_chapters: u32,
    pub chapters: BTreeMap<u32, ChapterManifestEntry>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ManifestFile {
    /// Every chapter `1..=total` pending.
    pub fn new(total_chapters: u32) -> Self {
        let now = Utc::now();
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            total_chapters,
            chapters: (1..=total_chapters)
                .map(|n| (n, ChapterManifestEntry::default()))
                .collect(),
            created_at: now,
            last_updated: now,
        }
    }

    /// Active entries whose claim is older than `threshold`, ascending.
    pub fn stuck_chapters(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<u32> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.chapters
            .iter()
            .filter(|(_, e)| e.status.is_active())
            .filter(|(_, e)| e.claimed_at.is_some_and(|at| now - at > threshold))
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn progress(&self) -> ManifestProgress {
        let mut progress = ManifestProgress {
            total: self.total_chapters,
            ..Default::default()
        };
        for entry in self.chapters.values() {
            match entry.status {
                EntryStatus::Pending => progress.pending += 1,
                EntryStatus::Claimed | EntryStatus::InProgress => progress.in_progress += 1,
                EntryStatus::Completed => progress.completed += 1,
                EntryStatus::Failed => progress.failed += 1,
            }
        }
        progress.percent = if progress.total == 0 {
            100.0
        } else {
            f64::from(progress.completed) * 100.0 / f64::from(progress.total)
        };
        progress
    }

    /// Nothing left that a worker could claim.
    pub fn is_drained(&self, max_attempts: u32) -> bool {
        !self.chapters.values().any(|e| e.is_claimable(max_attempts))
    }

    /// Chapters completed, ascending.
    pub fn completed(&self) -> Vec<u32> {
        self.with_status(EntryStatus::Completed)
    }

    pub fn with_status(&self, status: EntryStatus) -> Vec<u32> {
        self.chapters
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(n, _)| *n)
            .collect()
    }
}

/// Read-only aggregate over a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestProgress {
    pub total: u32,
    pub completed: u32,
    /// Claimed or in progress
    pub in_progress: u32,
    pub failed: u32,
    pub pending: u32,
    pub percent: f64,
}

impl std::fmt::Display for ManifestProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed ({:.0}%), {} in progress, {} failed, {} pending",
            self.completed, self.total, self.percent, self.in_progress, self.failed, self.pending
        )
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ChapterManifestEntry),
    /// Someone else got there first; not an error.
    AlreadyClaimed {
        status: EntryStatus,
        claimed_by: Option<String>,
    },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}
