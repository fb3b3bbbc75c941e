//! Pipeline state: the versioned progress record for one run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Pipeline stages, in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Parse,
    Analyze,
    Extract,
    Illustrate,
}

impl PhaseName {
    pub const ALL: [PhaseName; 4] = [
        PhaseName::Parse,
        PhaseName::Analyze,
        PhaseName::Extract,
        PhaseName::Illustrate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Parse => "parse",
            PhaseName::Analyze => "analyze",
            PhaseName::Extract => "extract",
            PhaseName::Illustrate => "illustrate",
        }
    }

    /// Passes over the whole book that make up this phase, in order.
    ///
    /// Analysis first collects story elements across every chapter, then plans scenes
    /// with those elements known.
    pub fn sub_phases(self) -> &'static [&'static str] {
        match self {
            PhaseName::Analyze => &["elements", "scenes"],
            _ => &[],
        }
    }

    /// Phases made of independent per-chapter work can be split across workers.
    pub fn supports_concurrency(self) -> bool {
        self.sub_phases().is_empty()
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parse" => Ok(PhaseName::Parse),
            "analyze" => Ok(PhaseName::Analyze),
            "extract" => Ok(PhaseName::Extract),
            "illustrate" => Ok(PhaseName::Illustrate),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: parse, analyze, extract, illustrate",
                s
            ),
        }
    }
}

/// Status of a phase, sub-phase or chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl Status {
    /// No further work is expected.
    pub fn is_done(self) -> bool {
        matches!(self, Status::Completed | Status::Skipped)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::NotStarted => "not_started",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub schema_version: u32,
    pub source_path: String,
    pub source_title: String,
    /// Effective configuration the run was started with
    #[serde(default)]
    pub config_snapshot: Map<String, Value>,
    #[serde(default)]
    pub phases: BTreeMap<PhaseName, PhaseState>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_phase: Option<PhaseName>,
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub processed_chapters: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_sub_phase: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_phases: BTreeMap<String, SubPhaseState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chapters: BTreeMap<u32, ChapterState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPhaseState {
    pub status: Status,
    pub progress: u32,
    pub total: u32,
}

/// Per-chapter record within a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterState {
    pub status: Status,
    /// Last sub-phase this chapter finished, for phases made of several passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sub_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Reference to the produced artifact (file path, URL, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial chapter record; `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterUpdate {
    pub status: Option<Status>,
    pub last_sub_phase: Option<String>,
    pub element_count: Option<u32>,
    pub scene_count: Option<u32>,
    pub tokens_used: Option<u64>,
    pub artifact: Option<String>,
    pub error: Option<String>,
}

impl ChapterUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_sub_phase(mut self, sub_phase: impl Into<String>) -> Self {
        self.last_sub_phase = Some(sub_phase.into());
        self
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

impl ChapterState {
    /// Merge a partial update. Completing a chapter clears any earlier error.
    pub fn merge(&mut self, update: ChapterUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
            if status == Status::Completed && update.error.is_none() {
                self.error = None;
            }
        }
        if update.last_sub_phase.is_some() {
            self.last_sub_phase = update.last_sub_phase;
        }
        if update.element_count.is_some() {
            self.element_count = update.element_count;
        }
        if update.scene_count.is_some() {
            self.scene_count = update.scene_count;
        }
        if update.tokens_used.is_some() {
            self.tokens_used = update.tokens_used;
        }
        if update.artifact.is_some() {
            self.artifact = update.artifact;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        self.updated_at = Some(now);
    }
}

impl PipelineState {
    /// A fresh state with every phase `not_started`.
    pub fn new(source_path: &str, source_title: &str, config_snapshot: Map<String, Value>) -> Self {
        let now = Utc::now();
        let mut state = Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            source_path: source_path.to_string(),
            source_title: source_title.to_string(),
            config_snapshot,
            phases: BTreeMap::new(),
            metadata: Metadata {
                created_at: now,
                updated_at: now,
                last_phase: None,
                total_chapters: 0,
                processed_chapters: 0,
            },
        };
        state.fill_missing_phases();
        state
    }

    /// Ensure every canonical phase (and its sub-phases) has an entry.
    pub fn fill_missing_phases(&mut self) {
        for phase in PhaseName::ALL {
            let entry = self.phases.entry(phase).or_default();
            for sub in phase.sub_phases() {
                entry.sub_phases.entry((*sub).to_string()).or_default();
            }
        }
    }

    pub fn phase(&self, phase: PhaseName) -> Option<&PhaseState> {
        self.phases.get(&phase)
    }

    pub fn phase_mut(&mut self, phase: PhaseName) -> &mut PhaseState {
        self.phases.entry(phase).or_default()
    }

    pub fn phase_status(&self, phase: PhaseName) -> Status {
        self.phase(phase).map(|p| p.status).unwrap_or_default()
    }

    pub fn chapter(&self, phase: PhaseName, chapter: u32) -> Option<&ChapterState> {
        self.phase(phase).and_then(|p| p.chapters.get(&chapter))
    }

    /// True if any phase was interrupted mid-way.
    pub fn can_resume(&self) -> bool {
        self.phases.values().any(|p| p.status == Status::InProgress)
    }

    /// First phase, in canonical order, that still has work to do.
    ///
    /// `None` means every phase is completed, skipped or failed.
    pub fn resume_phase(&self) -> Option<PhaseName> {
        PhaseName::ALL.into_iter().find(|phase| {
            matches!(
                self.phase_status(*phase),
                Status::InProgress | Status::NotStarted
            )
        })
    }

    /// Chapters recorded as completed in `phase`, ascending.
    pub fn completed_chapters(&self, phase: PhaseName) -> Vec<u32> {
        self.phase(phase)
            .map(|p| {
                p.chapters
                    .iter()
                    .filter(|(_, c)| c.status == Status::Completed)
                    .map(|(n, _)| *n)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Chapters recorded as failed in `phase`, ascending.
    pub fn failed_chapters(&self, phase: PhaseName) -> Vec<u32> {
        self.phase(phase)
            .map(|p| {
                p.chapters
                    .iter()
                    .filter(|(_, c)| c.status == Status::Failed)
                    .map(|(n, _)| *n)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.resume_phase().is_none() && self.phases.values().all(|p| p.status.is_done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PipelineState {
        PipelineState::new("/books/dune.epub", "Dune", Map::new())
    }

    #[test]
    fn test_new_state_has_all_phases_not_started() {
        let state = state();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(state.phases.len(), 4);
        assert!(state.phases.values().all(|p| p.status == Status::NotStarted));
        let analyze = state.phase(PhaseName::Analyze).unwrap();
        assert_eq!(analyze.sub_phases.len(), 2);
        assert!(analyze.sub_phases.contains_key("elements"));
    }

    #[test]
    fn test_resume_phase_follows_canonical_order() {
        let mut state = state();
        assert_eq!(state.resume_phase(), Some(PhaseName::Parse));
        assert!(!state.can_resume());

        state.phase_mut(PhaseName::Parse).status = Status::Completed;
        state.phase_mut(PhaseName::Analyze).status = Status::InProgress;
        assert_eq!(state.resume_phase(), Some(PhaseName::Analyze));
        assert!(state.can_resume());

        state.phase_mut(PhaseName::Analyze).status = Status::Completed;
        state.phase_mut(PhaseName::Extract).status = Status::Skipped;
        assert_eq!(state.resume_phase(), Some(PhaseName::Illustrate));

        state.phase_mut(PhaseName::Illustrate).status = Status::Completed;
        assert_eq!(state.resume_phase(), None);
        assert!(state.is_complete());
    }

    #[test]
    fn test_failed_phase_is_not_resumed() {
        let mut state = state();
        state.phase_mut(PhaseName::Parse).status = Status::Failed;
        assert_eq!(state.resume_phase(), Some(PhaseName::Analyze));
        assert!(!state.is_complete());
    }

    #[test]
    fn test_merge_preserves_missing_fields() {
        let now = Utc::now();
        let mut chapter = ChapterState::default();
        chapter.merge(
            ChapterUpdate::status(Status::InProgress).with_tokens(120),
            now,
        );
        chapter.merge(ChapterUpdate::default().with_artifact("ch1.png"), now);

        assert_eq!(chapter.status, Status::InProgress);
        assert_eq!(chapter.tokens_used, Some(120));
        assert_eq!(chapter.artifact.as_deref(), Some("ch1.png"));
        assert_eq!(chapter.updated_at, Some(now));
    }

    #[test]
    fn test_completion_clears_previous_error() {
        let now = Utc::now();
        let mut chapter = ChapterState::default();
        chapter.merge(ChapterUpdate::failed("HTTP 503"), now);
        assert_eq!(chapter.error.as_deref(), Some("HTTP 503"));

        chapter.merge(ChapterUpdate::status(Status::Completed), now);
        assert_eq!(chapter.status, Status::Completed);
        assert!(chapter.error.is_none());
    }

    #[test]
    fn test_serialized_keys_are_camel_case() {
        let mut state = state();
        state
            .phase_mut(PhaseName::Illustrate)
            .chapters
            .insert(3, ChapterState::default());
        let json = serde_json::to_value(&state).unwrap();

        for key in [
            "schemaVersion",
            "sourcePath",
            "sourceTitle",
            "configSnapshot",
            "phases",
            "metadata",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json["metadata"].get("totalChapters").is_some());
        assert!(json["phases"]["analyze"]["subPhases"]["scenes"].is_object());
        assert_eq!(
            json["phases"]["illustrate"]["chapters"]["3"]["status"],
            "not_started"
        );
    }

    #[test]
    fn test_phase_name_parsing() {
        assert_eq!("Illustrate".parse::<PhaseName>().unwrap(), PhaseName::Illustrate);
        assert!("render".parse::<PhaseName>().is_err());
        assert_eq!(PhaseName::Extract.to_string(), "extract");
        assert!(PhaseName::Illustrate.supports_concurrency());
        assert!(!PhaseName::Analyze.supports_concurrency());
    }
}
