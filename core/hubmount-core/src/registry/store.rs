//! File-backed registry persistence.
//!
//! # File Format
//!
//! ```json
//! [
//!   { "folder": "alpha", "repo": "org/dataset", "pid": 4242,
//!     "path": "/home/u/alpha", "created_at": "2026-01-01T00:00:00Z" }
//! ]
//! ```
//!
//! # Atomic Writes
//!
//! Uses temp file (same directory) + rename, so a crash mid-write leaves either
//! the old registry or the new one, never half of one.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs_err as fs;
use tempfile::NamedTempFile;

use crate::error::{MountError, Result};

use super::types::RegistryEntry;

/// Reads all entries. Missing or empty file is an empty registry.
pub(crate) fn read_entries(path: &Path) -> Result<Vec<RegistryEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MountError::io("read registry", e)),
    };

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&content).map_err(|e| MountError::Corruption {
        path: path.to_path_buf(),
        details: e.to_string(),
    })
}

/// Replaces the registry file with `entries`.
pub(crate) fn write_entries(path: &Path, entries: &[RegistryEntry]) -> Result<()> {
    let content = serde_json::to_string_pretty(entries).map_err(|e| MountError::Json {
        context: "serialize registry".to_string(),
        source: e,
    })?;

    let parent_dir = path.parent().ok_or_else(|| {
        MountError::io(
            "registry path has no parent directory",
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    fs::create_dir_all(parent_dir).map_err(|e| MountError::io("create registry directory", e))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|e| MountError::io("create temp registry file", e))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|e| MountError::io("write temp registry file", e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| MountError::io("sync temp registry file", e))?;
    temp_file
        .persist(path)
        .map_err(|e| MountError::io("replace registry file", e.error))?;

    Ok(())
}

/// Moves an unreadable registry aside so overwriting it loses nothing.
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf> {
    let backup = PathBuf::from(format!(
        "{}.corrupt-{}",
        path.display(),
        Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ));
    fs::rename(path, &backup).map_err(|e| MountError::io("quarantine corrupt registry", e))?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(folder: &str) -> RegistryEntry {
        RegistryEntry {
            folder: folder.to_string(),
            repo: "org/dataset".to_string(),
            pid: 42,
            path: format!("/home/u/{folder}"),
            created_at: Utc::now(),
            proc_started: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_load_nonexistent_file_is_empty() {
        let temp = tempdir().unwrap();
        assert!(read_entries(&temp.path().join("registry.json")).unwrap().is_empty());
    }

    #[test]
    fn test_load_empty_file_is_empty() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("registry.json");
        fs::write(&file, "  \n").unwrap();
        assert!(read_entries(&file).unwrap().is_empty());
    }

    #[test]
    fn test_load_corrupt_json_is_corruption_error() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("registry.json");
        fs::write(&file, "{invalid json}").unwrap();
        assert!(matches!(
            read_entries(&file),
            Err(MountError::Corruption { .. })
        ));
    }

    #[test]
    fn test_write_preserves_order() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("registry.json");
        let entries = vec![entry("zeta"), entry("alpha"), entry("mid")];
        write_entries(&file, &entries).unwrap();

        let loaded = read_entries(&file).unwrap();
        let folders: Vec<_> = loaded.iter().map(|e| e.folder.as_str()).collect();
        assert_eq!(folders, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_write_leaves_no_temp_files_behind() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("registry.json");
        write_entries(&file, &[entry("alpha")]).unwrap();
        write_entries(&file, &[]).unwrap();

        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, [std::ffi::OsString::from("registry.json")]);
    }

    #[test]
    fn test_quarantine_moves_file_aside() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("registry.json");
        fs::write(&file, "garbage").unwrap();

        let backup = quarantine(&file).unwrap();
        assert!(!file.exists());
        assert_eq!(fs::read_to_string(&backup).unwrap(), "garbage");
    }
}
