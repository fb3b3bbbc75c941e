//! Versioned, resumable pipeline state.

pub mod manager;
pub mod migrate;
pub mod types;

pub use manager::{STATE_FILE, StateManager};
pub use migrate::Migrator;
pub use types::{
    CURRENT_SCHEMA_VERSION, ChapterState, ChapterUpdate, Metadata, PhaseName, PhaseState,
    PipelineState, Status, SubPhaseState,
};
