//! Cache Overlay: the writable, RAM-backed half of a session.
//!
//! ```text
//! ~/alpha/                     (merged view)
//! ├── README.md  -> /tmp/.hubmount_alpha_ro/README.md
//! ├── data       -> /tmp/.hubmount_alpha_ro/data
//! └── WRITE      -> /dev/shm/hubmount_alpha_cache
//! ```
//!
//! The merged view is built once from a listing of the read-only root. It is
//! not a union filesystem: entries that appear remotely after mount time are
//! not picked up.

use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::error::{MountError, Result};
use crate::storage::is_direct_child;

/// Name under the merged view where the writable cache is exposed.
pub const WRITE_LINK: &str = "WRITE";

/// Space on the volatile storage backing the caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Creates, exposes, and destroys per-session caches under one volatile root.
#[derive(Debug, Clone)]
pub struct CacheOverlay {
    cache_root: PathBuf,
    min_free_bytes: u64,
}

impl CacheOverlay {
    pub fn new(cache_root: PathBuf, min_free_mb: u64) -> Self {
        Self {
            cache_root,
            min_free_bytes: min_free_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Allocates the writable directory.
    ///
    /// Fails with [`MountError::Resource`] if the volatile root is missing,
    /// not a directory, or has less than the configured free space.
    pub fn create(&self, cache_path: &Path) -> Result<()> {
        self.check_confined(cache_path)?;

        let meta = fs::metadata(&self.cache_root)
            .map_err(|e| MountError::resource(&self.cache_root, e.to_string()))?;
        if !meta.is_dir() {
            return Err(MountError::resource(&self.cache_root, "not a directory"));
        }

        let usage = usage(&self.cache_root)?;
        if usage.available_bytes < self.min_free_bytes {
            return Err(MountError::resource(
                &self.cache_root,
                format!(
                    "only {} MB free, need {} MB",
                    usage.available_bytes / (1024 * 1024),
                    self.min_free_bytes / (1024 * 1024)
                ),
            ));
        }

        fs::create_dir_all(cache_path).map_err(|e| MountError::resource(cache_path, e.to_string()))
    }

    /// Removes the overlay directory and its contents.
    ///
    /// Refuses, without deleting anything, when `cache_path` is not a direct
    /// child of the volatile root or is a symlink. A missing directory is
    /// already destroyed.
    pub fn destroy(&self, cache_path: &Path) -> Result<()> {
        self.check_confined(cache_path)?;

        let meta = match fs::symlink_metadata(cache_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MountError::io("stat cache directory", e)),
        };
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return Err(MountError::resource(
                cache_path,
                "refusing to destroy: not a plain directory",
            ));
        }

        fs::remove_dir_all(cache_path).map_err(|e| MountError::io("remove cache directory", e))
    }

    fn check_confined(&self, cache_path: &Path) -> Result<()> {
        if is_direct_child(&self.cache_root, cache_path) {
            Ok(())
        } else {
            Err(MountError::resource(
                cache_path,
                format!("outside cache root {}", self.cache_root.display()),
            ))
        }
    }
}

/// Mirrors the top-level entries of `read_only_path` as symlinks under
/// `merged_path`, and links the cache at [`WRITE_LINK`].
///
/// Returns the number of remote entries linked.
pub fn build_merged_view(read_only_path: &Path, cache_path: &Path, merged_path: &Path) -> Result<usize> {
    fs::create_dir_all(merged_path).map_err(|e| MountError::io("create merged directory", e))?;

    let mut linked = 0;
    let listing =
        fs::read_dir(read_only_path).map_err(|e| MountError::io("list read-only root", e))?;
    for entry in listing {
        let entry = entry.map_err(|e| MountError::io("list read-only root", e))?;
        let name = entry.file_name();
        if name == WRITE_LINK {
            tracing::warn!(
                path = %entry.path().display(),
                "Remote entry collides with the write link; skipping"
            );
            continue;
        }
        place_link(&entry.path(), &merged_path.join(&name), read_only_path, cache_path)?;
        linked += 1;
    }

    place_link(cache_path, &merged_path.join(WRITE_LINK), read_only_path, cache_path)?;
    Ok(linked)
}

/// Removes links that point into this session's paths, then the merged
/// directory itself if nothing else is left in it.
pub fn remove_merged_view(merged_path: &Path, read_only_path: &Path, cache_path: &Path) -> Result<()> {
    let listing = match fs::read_dir(merged_path) {
        Ok(listing) => listing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(MountError::io("list merged directory", e)),
    };

    for entry in listing {
        let entry = entry.map_err(|e| MountError::io("list merged directory", e))?;
        let path = entry.path();
        if is_own_link(&path, read_only_path, cache_path) {
            fs::remove_file(&path).map_err(|e| MountError::io("remove merged link", e))?;
        }
    }

    match fs::remove_dir(merged_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            tracing::info!(
                path = %merged_path.display(),
                "Merged directory kept; it holds files hubmount did not create"
            );
            Ok(())
        }
    }
}

/// Reports total and available bytes on the filesystem holding `path`.
pub fn usage(path: &Path) -> Result<CacheUsage> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| MountError::resource(path, "path contains a NUL byte"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return Err(MountError::resource(
                path,
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let fragment = stat.f_frsize as u64;
        Ok(CacheUsage {
            total_bytes: (stat.f_blocks as u64).saturating_mul(fragment),
            available_bytes: (stat.f_bavail as u64).saturating_mul(fragment),
        })
    }
    #[cfg(not(unix))]
    {
        Err(MountError::resource(path, "statvfs unsupported on this platform"))
    }
}

/// Creates `link -> target`, replacing a stale link of ours but never
/// clobbering anything else.
fn place_link(target: &Path, link: &Path, read_only_path: &Path, cache_path: &Path) -> Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        if !is_own_link(link, read_only_path, cache_path) {
            return Err(MountError::io(
                format!("merged entry {} already exists", link.display()),
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        fs::remove_file(link).map_err(|e| MountError::io("replace merged link", e))?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link).map_err(|e| {
            MountError::io(format!("create merged link {}", link.display()), e)
        })
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(MountError::io(
            "create merged link",
            std::io::Error::from(std::io::ErrorKind::Unsupported),
        ))
    }
}

fn is_own_link(path: &Path, read_only_path: &Path, cache_path: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.file_type().is_symlink() {
        return false;
    }
    match fs::read_link(path) {
        Ok(target) => target.starts_with(read_only_path) || target == cache_path,
        Err(_) => false,
    }
}
