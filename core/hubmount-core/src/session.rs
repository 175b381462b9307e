//! Session state for one mounted repository.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::sync_loop::SyncLoop;
use crate::validation::{FolderName, RepositoryId};

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownTrigger {
    /// Requested by the caller (normal exit path).
    Explicit,
    /// Interrupt or termination signal set the teardown flag.
    Signal,
    /// The mount stopped answering readiness probes.
    HealthCheck,
}

impl fmt::Display for TeardownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownTrigger::Explicit => "explicit",
            TeardownTrigger::Signal => "signal",
            TeardownTrigger::HealthCheck => "health-check",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Clean,
    /// Detach needed the lazy fallback.
    Forced,
    /// Some step failed without escalation (e.g. the detach itself errored).
    /// Leftovers may remain; the report lists them.
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Active,
    Unmounting,
    Failed,
    Closed { outcome: TeardownOutcome },
}

/// Result of a teardown. Step errors are kept as messages so the report can be
/// stored and handed back on repeated calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub trigger: TeardownTrigger,
    pub outcome: TeardownOutcome,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.outcome == TeardownOutcome::Clean && self.errors.is_empty()
    }
}

/// Paths owned by one session. All derived and confined by `StorageConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub read_only: PathBuf,
    pub cache: PathBuf,
    pub merged: PathBuf,
}

/// A live mount session. Created by `SessionController::create` and consumed
/// by its `teardown`.
#[derive(Debug)]
pub struct MountSession {
    pub(crate) folder: FolderName,
    pub(crate) repo: RepositoryId,
    pub(crate) paths: SessionPaths,
    pub(crate) pid: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) status: SessionStatus,
    pub(crate) sync: Option<SyncLoop>,
    pub(crate) report: Option<TeardownReport>,
}

impl MountSession {
    pub fn folder(&self) -> &FolderName {
        &self.folder
    }

    pub fn repo(&self) -> &RepositoryId {
        &self.repo
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn read_only_path(&self) -> &Path {
        &self.paths.read_only
    }

    pub fn cache_path(&self) -> &Path {
        &self.paths.cache
    }

    pub fn merged_path(&self) -> &Path {
        &self.paths.merged
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_sync_running(&self) -> bool {
        self.sync.as_ref().is_some_and(SyncLoop::is_running)
    }

    /// The stored report, once teardown has run.
    pub fn teardown_report(&self) -> Option<&TeardownReport> {
        self.report.as_ref()
    }
}
