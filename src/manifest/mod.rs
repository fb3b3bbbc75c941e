//! Chapter manifest for concurrent workers.

pub mod manager;
pub mod types;

pub use manager::ManifestManager;
pub use types::{
    ChapterManifestEntry, ClaimOutcome, EntryStatus, MANIFEST_SCHEMA_VERSION, ManifestFile,
    ManifestProgress,
};
