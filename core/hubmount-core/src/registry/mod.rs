//! Lock Registry: the durable record of which folder is mounted by whom.
//!
//! # Architecture
//!
//! ```text
//! hubmount (pid A) ─┐                         ┌─ registry.lock  (flock, exclusion)
//! hubmount (pid B) ─┼─> LockRegistry ─────────┤
//! hubmount unmount ─┘   read-reconcile-write  └─ registry.json  (atomic replace)
//! ```
//!
//! Every mutation is one critical section under the exclusive lock. The lock is
//! held only for that section, never for the lifetime of a mount.
//!
//! # Stale Entries
//!
//! An entry whose owner is no longer alive (see [`crate::process`]) is stale.
//! A stale entry is only ever replaced by whoever claims its folder: a new
//! mount ([`LockRegistry::acquire`]) or a cleanup ([`LockRegistry::take_over`]).
//! The claimant cleans the leftovers while its own entry holds the folder, so
//! nobody else can mount it in between.
//!
//! # Module Structure
//!
//! - [`lock`]: `flock` guard
//! - [`store`]: JSON load/save with atomic replace
//! - [`types`]: persisted entry type

mod lock;
mod store;
mod types;

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{MountError, Result};
use crate::process::get_process_start_time;
use crate::storage::StorageConfig;
use crate::validation::{FolderName, RepositoryId};

use self::lock::RegistryLock;
pub use types::{Acquired, RegistryEntry};

/// Handle to the persisted registry. Cheap to clone; holds only paths.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    file: PathBuf,
    lock_file: PathBuf,
}

impl LockRegistry {
    pub fn new(file: PathBuf, lock_file: PathBuf) -> Self {
        Self { file, lock_file }
    }

    pub fn from_storage(storage: &StorageConfig) -> Self {
        Self::new(storage.registry_file(), storage.registry_lock_file())
    }

    pub fn file_path(&self) -> &Path {
        &self.file
    }

    /// Reads the registry without taking the lock.
    ///
    /// Fails with [`MountError::Corruption`] if the file cannot be parsed.
    pub fn load(&self) -> Result<Vec<RegistryEntry>> {
        store::read_entries(&self.file)
    }

    /// Snapshot of all entries, read under the lock.
    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        let _guard = RegistryLock::acquire(&self.lock_file)?;
        self.load()
    }

    /// Entry for `folder`, if any (live or stale).
    pub fn find(&self, folder: &FolderName) -> Result<Option<RegistryEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.folder == folder.as_str()))
    }

    /// Claims `folder` for `pid`.
    ///
    /// Rejects with [`MountError::Conflict`] if a live entry holds the folder.
    /// A stale entry for the folder is replaced and returned in
    /// [`Acquired::reclaimed`]; entries for other folders are left alone.
    pub fn acquire(
        &self,
        folder: &FolderName,
        repo: &RepositoryId,
        pid: u32,
        path: &Path,
    ) -> Result<Acquired> {
        let _guard = RegistryLock::acquire(&self.lock_file)?;
        let entries = self.load_for_update()?;
        let (held, mut kept): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.folder == folder.as_str());

        if let Some(holder) = held.iter().find(|e| !e.is_stale()) {
            tracing::info!(
                folder = %folder,
                holder_pid = holder.pid,
                holder_repo = %holder.repo,
                "Folder already mounted"
            );
            return Err(MountError::Conflict {
                folder: folder.to_string(),
                repo: holder.repo.clone(),
                pid: holder.pid,
            });
        }

        for stale in &held {
            tracing::info!(folder = %stale.folder, pid = stale.pid, "Reclaiming stale registry entry");
        }

        let entry = RegistryEntry {
            folder: folder.to_string(),
            repo: repo.to_string(),
            pid,
            path: path.to_string_lossy().into_owned(),
            created_at: Utc::now(),
            proc_started: get_process_start_time(pid),
        };
        kept.push(entry.clone());
        store::write_entries(&self.file, &kept)?;

        Ok(Acquired {
            entry,
            reclaimed: held,
        })
    }

    /// Removes the entry matching both `folder` and `pid`.
    ///
    /// Returns `Ok(false)` if no entry matched; unrelated entries are untouched.
    pub fn release(&self, folder: &FolderName, pid: u32) -> Result<bool> {
        let _guard = RegistryLock::acquire(&self.lock_file)?;
        let mut entries = self.load_for_update()?;
        let before = entries.len();
        entries.retain(|e| !(e.folder == folder.as_str() && e.pid == pid));

        if entries.len() == before {
            tracing::debug!(folder = %folder, pid, "Release matched no registry entry");
            return Ok(false);
        }

        store::write_entries(&self.file, &entries)?;
        Ok(true)
    }

    /// Moves a stale entry for `folder` over to `pid` and returns the old one.
    ///
    /// `Ok(None)` if the folder has no entry. A live entry is a
    /// [`MountError::Conflict`]. The caller cleans up, then [`release`]s.
    ///
    /// [`release`]: LockRegistry::release
    pub fn take_over(&self, folder: &FolderName, pid: u32) -> Result<Option<RegistryEntry>> {
        let _guard = RegistryLock::acquire(&self.lock_file)?;
        let mut entries = self.load_for_update()?;
        let Some(slot) = entries.iter_mut().find(|e| e.folder == folder.as_str()) else {
            return Ok(None);
        };
        if !slot.is_stale() {
            return Err(MountError::Conflict {
                folder: folder.to_string(),
                repo: slot.repo.clone(),
                pid: slot.pid,
            });
        }

        let claim = claim_of(slot, pid);
        let stale = std::mem::replace(slot, claim);
        store::write_entries(&self.file, &entries)?;
        tracing::info!(folder = %folder, stale_pid = stale.pid, "Took over stale registry entry");
        Ok(Some(stale))
    }

    /// [`take_over`] for every stale entry at once.
    ///
    /// [`take_over`]: LockRegistry::take_over
    pub fn take_over_stale(&self, pid: u32) -> Result<Vec<RegistryEntry>> {
        let _guard = RegistryLock::acquire(&self.lock_file)?;
        let mut entries = self.load_for_update()?;
        let mut stale = Vec::new();
        for slot in entries.iter_mut().filter(|e| e.is_stale()) {
            let claim = claim_of(slot, pid);
            stale.push(std::mem::replace(slot, claim));
        }

        if !stale.is_empty() {
            store::write_entries(&self.file, &entries)?;
        }
        Ok(stale)
    }

    /// Puts `original` back in place of the claim `pid` holds on its folder.
    ///
    /// Used when cleanup failed, so the leftovers stay on record.
    pub fn hand_back(&self, original: &RegistryEntry, pid: u32) -> Result<bool> {
        let _guard = RegistryLock::acquire(&self.lock_file)?;
        let mut entries = self.load_for_update()?;
        let Some(slot) = entries
            .iter_mut()
            .find(|e| e.folder == original.folder && e.pid == pid)
        else {
            return Ok(false);
        };

        *slot = original.clone();
        store::write_entries(&self.file, &entries)?;
        Ok(true)
    }

    /// Load for a read-modify-write. Must be called with the lock held.
    ///
    /// A corrupt registry is treated as empty, after moving the bad file aside
    /// and logging it.
    fn load_for_update(&self) -> Result<Vec<RegistryEntry>> {
        match self.load() {
            Ok(entries) => Ok(entries),
            Err(MountError::Corruption { path, details }) => {
                let backup = store::quarantine(&path)?;
                tracing::warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %details,
                    "Registry corrupt; treating as empty"
                );
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// The entry `pid` holds while cleaning up after `stale`.
fn claim_of(stale: &RegistryEntry, pid: u32) -> RegistryEntry {
    RegistryEntry {
        pid,
        created_at: Utc::now(),
        proc_started: get_process_start_time(pid),
        ..stale.clone()
    }
}
