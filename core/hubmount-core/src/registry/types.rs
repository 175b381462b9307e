//! Serialized registry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::is_pid_alive_verified;

/// One mount session as persisted in `registry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub folder: String,
    pub repo: String,
    pub pid: u32,
    /// User-facing merged path of the session.
    pub path: String,
    pub created_at: DateTime<Utc>,
    /// Owner process start time (Unix timestamp) for PID reuse detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_started: Option<u64>,
}

impl RegistryEntry {
    /// Returns true if the owning process is gone (or its PID was recycled).
    pub fn is_stale(&self) -> bool {
        !is_pid_alive_verified(self.pid, self.proc_started)
    }
}

/// Result of a successful [`super::LockRegistry::acquire`].
#[derive(Debug, Clone)]
pub struct Acquired {
    /// The entry now recorded for the folder.
    pub entry: RegistryEntry,
    /// Stale entry this claim replaced, if any. Its paths may still hold
    /// leftovers from a crashed session.
    pub reclaimed: Vec<RegistryEntry>,
}
