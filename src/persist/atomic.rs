//! Crash-safe persistence for every structured file imaginize owns.
//!
//! Bytes go to `<path>.tmp`, are fsynced, and the temp file is renamed onto `<path>`.
//! The rename is the only point at which readers can observe the change, so a reader
//! sees either the previous content or the new content, never a mix.
//!
//! This gives crash-atomicity for a single writer. Concurrent writers to the same path
//! must be serialized by the caller (see [`crate::persist::lock`]).

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::PersistError;

/// Temp sibling used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `bytes`.
///
/// Missing parent directories are created. A temp file left behind by an earlier failed
/// attempt is removed first. On failure the original file is untouched.
pub fn write(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let write_err = |source: std::io::Error| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp = temp_path(path);
    discard_leftover(&tmp);

    if let Err(source) = write_temp(&tmp, bytes).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(source));
    }

    sync_parent(path);
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    write(path, &bytes)
}

/// Read and parse a JSON file.
///
/// Returns `Ok(None)` when the file does not exist, which callers treat differently from
/// a file that exists but cannot be parsed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_temp(tmp: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn discard_leftover(tmp: &Path) {
    match fs::remove_file(tmp) {
        Ok(()) => tracing::debug!(path = %tmp.display(), "Removed leftover temp file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %tmp.display(), error = %err, "Could not remove leftover temp file")
        }
    }
}

// Best effort: makes the rename itself durable on filesystems that need it.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        assert_eq!(
            temp_path(Path::new("/a/b/state.json")),
            PathBuf::from("/a/b/state.json.tmp")
        );
    }

    #[test]
    fn test_write_creates_file_and_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write(&path, b"hello").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_write_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        write(&path, b"first version").unwrap();
        write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_crash_before_rename_leaves_original_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write(&path, b"original").unwrap();

        // Simulate a crash after the temp file was written but before the rename.
        write_temp(&temp_path(&path), b"half-written new cont").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn test_next_write_cleans_up_leftover_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write(&path, b"original").unwrap();
        fs::write(temp_path(&path), b"garbage from a crashed run").unwrap();

        write(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_failed_rename_keeps_original() {
        let dir = tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("occupied");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("inner"), b"keep me").unwrap();

        let err = write(&path, b"new").unwrap_err();

        assert!(matches!(err, PersistError::Write { .. }));
        assert_eq!(fs::read(path.join("inner")).unwrap(), b"keep me");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_json_roundtrip_and_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");

        assert!(read_json::<Sample>(&path).unwrap().is_none());

        let sample = Sample {
            name: "chapter".into(),
            count: 19,
        };
        write_json(&path, &sample).unwrap();

        assert_eq!(read_json::<Sample>(&path).unwrap(), Some(sample));
    }

    #[test]
    fn test_read_json_reports_unparsable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        fs::write(&path, b"{ not json").unwrap();

        let err = read_json::<Sample>(&path).unwrap_err();
        assert!(matches!(err, PersistError::Parse { .. }));
    }
}
