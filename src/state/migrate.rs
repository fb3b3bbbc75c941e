//! Schema migrations for persisted pipeline state.
//!
//! Each step is a pure function over raw JSON from version `n` to `n + 1`. Steps run in
//! order until the stored version reaches [`CURRENT_SCHEMA_VERSION`]; a gap in the chain
//! is an error, never a pass-through.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use super::types::{CURRENT_SCHEMA_VERSION, PhaseName};
use crate::errors::StateError;

/// Transform from one schema version to the next.
pub type MigrationStep = fn(Value) -> Result<Value, String>;

#[derive(Debug, Clone)]
pub struct Migrator {
    current: u32,
    steps: BTreeMap<u32, MigrationStep>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::empty(CURRENT_SCHEMA_VERSION)
            .register(1, v1_to_v2)
            .register(2, v2_to_v3)
    }
}

impl Migrator {
    /// A migrator targeting `current` with no steps registered.
    pub fn empty(current: u32) -> Self {
        Self {
            current,
            steps: BTreeMap::new(),
        }
    }

    /// Register the step that upgrades `from` to `from + 1`.
    #[must_use]
    pub fn register(mut self, from: u32, step: MigrationStep) -> Self {
        self.steps.insert(from, step);
        self
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Bring `raw` up to the current version.
    pub fn migrate(&self, mut raw: Value) -> Result<Value, StateError> {
        let mut version = stored_version(&raw)?;
        if version > self.current {
            return Err(StateError::UnsupportedVersion {
                found: version,
                current: self.current,
            });
        }

        while version < self.current {
            let step = self
                .steps
                .get(&version)
                .ok_or(StateError::MissingMigration { from: version })?;
            raw = step(raw).map_err(|message| StateError::Migration {
                from: version,
                message,
            })?;
            version += 1;
            set_version(&mut raw, version)?;
            tracing::debug!(to = version, "Migrated state schema");
        }
        Ok(raw)
    }
}

/// Schema version of a raw state document. Files written before versioning have none and
/// count as version 1.
pub fn stored_version(raw: &Value) -> Result<u32, StateError> {
    match raw.get("schemaVersion") {
        None | Some(Value::Null) => Ok(1),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| StateError::InvalidVersion {
                value: value.to_string(),
            }),
    }
}

fn set_version(raw: &mut Value, version: u32) -> Result<(), StateError> {
    let obj = raw.as_object_mut().ok_or(StateError::Migration {
        from: version - 1,
        message: "state is not a JSON object".to_string(),
    })?;
    obj.insert("schemaVersion".to_string(), json!(version));
    Ok(())
}

fn as_object(raw: &mut Value) -> Result<&mut Map<String, Value>, String> {
    raw.as_object_mut()
        .ok_or_else(|| "state is not a JSON object".to_string())
}

/// v2 adds the config snapshot and chapter totals.
pub fn v1_to_v2(mut raw: Value) -> Result<Value, String> {
    let obj = as_object(&mut raw)?;
    obj.entry("configSnapshot")
        .or_insert_with(|| Value::Object(Map::new()));

    let phases = obj.get("phases").and_then(Value::as_object);
    let chapter_count = |phase: &Value| {
        phase
            .get("chapters")
            .and_then(Value::as_object)
            .map_or(0, Map::len)
    };
    let total = phases
        .map(|p| p.values().map(chapter_count).max().unwrap_or(0))
        .unwrap_or(0);

    let last_phase = obj
        .get("metadata")
        .and_then(|m| m.get("lastPhase"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let processed = match (phases, last_phase) {
        (Some(phases), Some(last)) => phases
            .get(&last)
            .and_then(|p| p.get("chapters"))
            .and_then(Value::as_object)
            .map_or(0, |chapters| {
                chapters
                    .values()
                    .filter(|c| c.get("status").and_then(Value::as_str) == Some("completed"))
                    .count()
            }),
        _ => 0,
    };

    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| "metadata is not an object".to_string())?;
    metadata.entry("totalChapters").or_insert(json!(total));
    metadata.entry("processedChapters").or_insert(json!(processed));
    Ok(raw)
}

/// v3 renames the legacy `pending` status and splits analysis into two passes.
pub fn v2_to_v3(mut raw: Value) -> Result<Value, String> {
    let obj = as_object(&mut raw)?;
    let Some(phases) = obj.get_mut("phases") else {
        return Ok(raw);
    };
    let phases = phases
        .as_object_mut()
        .ok_or_else(|| "phases is not an object".to_string())?;

    for (name, phase) in phases.iter_mut() {
        rename_pending(phase);
        if let Some(chapters) = phase.get_mut("chapters").and_then(Value::as_object_mut) {
            for chapter in chapters.values_mut() {
                rename_pending(chapter);
            }
        }

        if name == PhaseName::Analyze.as_str()
            && let Some(phase) = phase.as_object_mut()
        {
            let done = phase.get("status").and_then(Value::as_str) == Some("completed");
            let chapters = phase
                .get("chapters")
                .and_then(Value::as_object)
                .map_or(0, Map::len);
            let subs = phase
                .entry("subPhases")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(subs) = subs.as_object_mut() {
                for sub in PhaseName::Analyze.sub_phases() {
                    subs.entry((*sub).to_string()).or_insert_with(|| {
                        if done {
                            json!({"status": "completed", "progress": chapters, "total": chapters})
                        } else {
                            json!({"status": "not_started", "progress": 0, "total": chapters})
                        }
                    });
                }
            }
        }
    }
    Ok(raw)
}

fn rename_pending(record: &mut Value) {
    if let Some(status) = record.get_mut("status")
        && status.as_str() == Some("pending")
    {
        *status = json!("not_started");
    }
}
