//! Shared fixtures for controller integration tests.
//!
//! `FakeMounter` stands in for FUSE: "mounting" copies a small fixture tree
//! into the read-only directory and "unmounting" empties it again.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs_err as fs;
use hubmount_core::{
    FolderName, MountConfig, MountError, MountProvider, RemoteContentProvider, RepositoryId,
    Result, SessionController, StorageConfig, VirtualRoot,
};
use tempfile::TempDir;

/// Top-level entries every fake remote exposes.
pub const REMOTE_ENTRIES: [&str; 3] = ["README.md", "data", "config.json"];

/// A PID far above any real `pid_max`.
pub const DEAD_PID: u32 = 99_999_999;

pub struct FakeRemote {
    pub deny: Option<String>,
}

impl RemoteContentProvider for FakeRemote {
    fn attach_read_only(&self, repo: &RepositoryId) -> Result<VirtualRoot> {
        if let Some(details) = &self.deny {
            return Err(MountError::RemoteAccess {
                repo: repo.to_string(),
                details: details.clone(),
            });
        }
        Ok(VirtualRoot {
            repo: repo.clone(),
            uri: format!("fake://{repo}"),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeMounterState {
    pub mounted: HashSet<PathBuf>,
    /// Busy failures still to hand out before `unmount` succeeds.
    pub busy_remaining: u32,
    pub ready: bool,
    /// Every `unmount` of a mounted path fails with a non-busy error.
    pub fail_unmount: bool,
    pub unmount_calls: u32,
    pub force_calls: u32,
}

#[derive(Debug, Default)]
pub struct FakeMounter {
    pub state: Mutex<FakeMounterState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeMounterState {
                ready: true,
                ..Default::default()
            }),
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn busy_for(attempts: u32) -> Self {
        let mounter = Self::new();
        mounter.state.lock().unwrap().busy_remaining = attempts;
        mounter
    }

    pub fn failing_unmount() -> Self {
        let mounter = Self::new();
        mounter.state.lock().unwrap().fail_unmount = true;
        mounter
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().unwrap().ready = ready;
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().unwrap().mounted.contains(path)
    }

    pub fn unmount_calls(&self) -> u32 {
        self.state.lock().unwrap().unmount_calls
    }

    pub fn force_calls(&self) -> u32 {
        self.state.lock().unwrap().force_calls
    }

    fn clear(path: &Path) {
        for name in REMOTE_ENTRIES {
            let entry = path.join(name);
            if entry.is_dir() {
                let _ = fs::remove_dir_all(&entry);
            } else {
                let _ = fs::remove_file(&entry);
            }
        }
    }
}

impl MountProvider for FakeMounter {
    fn mount(&self, _root: &VirtualRoot, path: &Path) -> Result<()> {
        fs::write(path.join("README.md"), "# dataset\n").map_err(|e| MountError::io("fake", e))?;
        fs::create_dir_all(path.join("data")).map_err(|e| MountError::io("fake", e))?;
        fs::write(path.join("data/train.csv"), "a,b\n").map_err(|e| MountError::io("fake", e))?;
        fs::write(path.join("config.json"), "{}").map_err(|e| MountError::io("fake", e))?;
        self.state.lock().unwrap().mounted.insert(path.to_path_buf());
        Ok(())
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.unmount_calls += 1;
        if !state.mounted.contains(path) {
            return Ok(());
        }
        if state.fail_unmount {
            return Err(MountError::io(
                "fake unmount",
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ));
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Err(MountError::MountBusy {
                path: path.to_path_buf(),
            });
        }
        state.mounted.remove(path);
        Self::clear(path);
        Ok(())
    }

    fn force_unmount(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.force_calls += 1;
        state.mounted.remove(path);
        Self::clear(path);
        Ok(())
    }

    fn is_ready(&self, path: &Path) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.ready && state.mounted.contains(path))
    }
}

/// Temp roots for state, mounts, caches and merged views.
pub struct TestEnv {
    pub temp: TempDir,
    pub storage: StorageConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let roots = ["state", "mnt", "shm", "home"].map(|name| {
            let dir = temp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            dir
        });
        let [state, mnt, shm, home] = roots;
        let storage = StorageConfig::with_roots(state, mnt, shm, home);
        Self { temp, storage }
    }

    pub fn controller(&self, mounter: Arc<FakeMounter>) -> SessionController {
        self.controller_with(FakeRemote { deny: None }, mounter)
    }

    pub fn controller_with(&self, remote: FakeRemote, mounter: Arc<FakeMounter>) -> SessionController {
        SessionController::new(self.storage.clone(), fast_config(), Arc::new(remote), mounter)
    }

    pub fn controller_with_config(&self, config: MountConfig, mounter: Arc<FakeMounter>) -> SessionController {
        SessionController::new(
            self.storage.clone(),
            config,
            Arc::new(FakeRemote { deny: None }),
            mounter,
        )
    }
}

/// Millisecond-scale timings so failure paths finish quickly.
pub fn fast_config() -> MountConfig {
    MountConfig {
        sync_interval_secs: 1,
        readiness_attempts: 5,
        readiness_interval_ms: 1,
        detach_attempts: 3,
        detach_backoff_ms: 1,
        detach_backoff_max_ms: 2,
        health_interval_ms: 5,
        health_failures: 2,
        unmount_wait_secs: 0,
        min_cache_free_mb: 0,
        require_token: false,
        ..MountConfig::default()
    }
}

pub fn repo(value: &str) -> RepositoryId {
    RepositoryId::parse(value).unwrap()
}

pub fn folder(value: &str) -> FolderName {
    FolderName::parse(value).unwrap()
}
