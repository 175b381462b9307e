//! Storage configuration and path management for hubmount.
//!
//! All paths a session touches are derived here, from four roots:
//!
//! - **state root** (`~/.hubmount`): registry, registry lock, config, logs
//! - **mount root** (`/tmp`): read-only attach points, `.hubmount_<folder>_ro`
//! - **cache root** (`/dev/shm`): RAM-backed write caches, `hubmount_<folder>_cache`
//! - **merged root** (`$HOME`): user-facing merged views, `<folder>`
//!
//! ## Confinement
//!
//! Every derived path is checked to be a direct child of its root before it is
//! handed out. Folder names are already validated, so this is the second line:
//! a path that escapes its root is a [`MountError::Resource`] at derivation
//! time, long before anything is created or deleted.

use std::path::{Component, Path, PathBuf};

use crate::error::{MountError, Result};
use crate::validation::FolderName;

/// Central configuration for all hubmount storage paths.
///
/// Production code uses [`StorageConfig::from_home`]; tests use
/// [`StorageConfig::with_roots`] pointed at temp directories.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    state_root: PathBuf,
    mount_root: PathBuf,
    cache_root: PathBuf,
    merged_root: PathBuf,
}

impl StorageConfig {
    /// Standard layout rooted at the user's home directory.
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            MountError::resource("~", "Could not determine home directory".to_string())
        })?;
        Ok(Self {
            state_root: home.join(".hubmount"),
            mount_root: std::env::temp_dir(),
            cache_root: PathBuf::from("/dev/shm"),
            merged_root: home,
        })
    }

    /// Creates a StorageConfig with explicit roots.
    /// Used for testing with temp directories.
    pub fn with_roots(
        state_root: PathBuf,
        mount_root: PathBuf,
        cache_root: PathBuf,
        merged_root: PathBuf,
    ) -> Self {
        Self {
            state_root,
            mount_root,
            cache_root,
            merged_root,
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn merged_root(&self) -> &Path {
        &self.merged_root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Global Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to registry.json (active mount sessions).
    pub fn registry_file(&self) -> PathBuf {
        self.state_root.join("registry.json")
    }

    /// Path to registry.lock (advisory lock guarding registry.json).
    pub fn registry_lock_file(&self) -> PathBuf {
        self.state_root.join("registry.lock")
    }

    /// Path to config.json (tunables).
    pub fn config_file(&self) -> PathBuf {
        self.state_root.join("config.json")
    }

    /// Path to the logs/ directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_root.join("logs")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Per-Session Paths
    // ─────────────────────────────────────────────────────────────────────────────

    /// Read-only attach point. Example: /tmp/.hubmount_alpha_ro
    pub fn read_only_path(&self, folder: &FolderName) -> Result<PathBuf> {
        confined(&self.mount_root, &format!(".hubmount_{}_ro", folder))
    }

    /// RAM-backed write cache. Example: /dev/shm/hubmount_alpha_cache
    pub fn cache_path(&self, folder: &FolderName) -> Result<PathBuf> {
        confined(&self.cache_root, &format!("hubmount_{}_cache", folder))
    }

    /// User-facing merged view. Example: ~/alpha
    pub fn merged_path(&self, folder: &FolderName) -> Result<PathBuf> {
        confined(&self.merged_root, folder.as_str())
    }

    /// Returns true if `path` is a direct child of the cache root.
    pub fn is_in_cache_root(&self, path: &Path) -> bool {
        is_direct_child(&self.cache_root, path)
    }
}

/// Joins `name` onto `root` and checks the result is a direct child of `root`.
fn confined(root: &Path, name: &str) -> Result<PathBuf> {
    let path = root.join(name);
    if !is_direct_child(root, &path) {
        return Err(MountError::resource(
            &path,
            format!("derived path escapes {}", root.display()),
        ));
    }
    Ok(path)
}

/// Lexical check: exactly one normal component below `root`.
pub(crate) fn is_direct_child(root: &Path, path: &Path) -> bool {
    let Ok(rest) = path.strip_prefix(root) else {
        return false;
    };
    let mut components = rest.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
