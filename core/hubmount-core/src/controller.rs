//! SessionController - brings mount sessions up and tears them down.
//!
//! ## Lifecycle
//!
//! ```text
//! create:    acquire slot → read-only dir → attach → ready? → cache → merged view → sync
//! teardown:  stop sync → detach (retry, then lazy) → read-only dir → merged view → cache → release
//! ```
//!
//! A failure anywhere in `create` unwinds the completed steps in reverse
//! order. Teardown never stops early: each step runs even if an earlier one
//! failed, and every failure lands in the [`TeardownReport`].
//!
//! The controller performs no signal handling of its own. Callers set a flag
//! from their handler and pass it to [`SessionController::run_until_shutdown`],
//! so teardown always runs on the caller's thread and a second signal cannot
//! re-enter it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs_err as fs;

use crate::config::MountConfig;
use crate::error::{MountError, Result};
use crate::overlay::{self, CacheOverlay};
use crate::process;
use crate::provider::{is_mount_point, MountProvider, RemoteContentProvider};
use crate::registry::{LockRegistry, RegistryEntry};
use crate::session::{
    MountSession, SessionPaths, SessionStatus, TeardownOutcome, TeardownReport, TeardownTrigger,
};
use crate::storage::StorageConfig;
use crate::sync_loop::{NoopSync, RetentionSweep, SyncLoop, SyncStrategy};
use crate::validation::{FolderName, RepositoryId};

const UNMOUNT_POLL: Duration = Duration::from_millis(100);

/// Result of asking another process's session to go away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// No registry entry for the folder.
    NotMounted,
    /// The owner was signalled and released its entry.
    Signalled { pid: u32 },
    /// The owner was already gone; its leftovers were cleaned here.
    Reclaimed { entry: RegistryEntry },
}

/// Completed `create` steps, in order. Rollback walks them backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    SlotAcquired,
    ReadOnlyDirCreated,
    Attached,
    CacheCreated,
    MergedViewStarted,
}

pub struct SessionController {
    storage: StorageConfig,
    config: MountConfig,
    registry: LockRegistry,
    overlay: CacheOverlay,
    remote: Arc<dyn RemoteContentProvider>,
    mounter: Arc<dyn MountProvider>,
    sync_strategy: Arc<dyn SyncStrategy>,
    /// Serializes attach/detach calls made through this controller.
    mount_ops: Mutex<()>,
}

impl SessionController {
    pub fn new(
        storage: StorageConfig,
        config: MountConfig,
        remote: Arc<dyn RemoteContentProvider>,
        mounter: Arc<dyn MountProvider>,
    ) -> Self {
        let registry = LockRegistry::from_storage(&storage);
        let overlay = CacheOverlay::new(storage.cache_root().to_path_buf(), config.min_cache_free_mb);
        let sync_strategy: Arc<dyn SyncStrategy> = match config.cache_retention() {
            Some(max_age) => Arc::new(RetentionSweep::new(max_age)),
            None => Arc::new(NoopSync),
        };

        Self {
            storage,
            config,
            registry,
            overlay,
            remote,
            mounter,
            sync_strategy,
            mount_ops: Mutex::new(()),
        }
    }

    /// Replaces the strategy picked from the config.
    pub fn with_sync_strategy(mut self, strategy: Arc<dyn SyncStrategy>) -> Self {
        self.sync_strategy = strategy;
        self
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn overlay(&self) -> &CacheOverlay {
        &self.overlay
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Create
    // ─────────────────────────────────────────────────────────────────────────────

    /// Mounts `repo` under `folder` and returns the active session.
    ///
    /// On error nothing created here is left behind (best effort) and the
    /// registry no longer holds an entry for this process.
    pub fn create(&self, repo: &RepositoryId, folder: &FolderName) -> Result<MountSession> {
        let paths = self.session_paths(folder)?;
        let mut session = MountSession {
            folder: folder.clone(),
            repo: repo.clone(),
            paths,
            pid: std::process::id(),
            created_at: Utc::now(),
            status: SessionStatus::Initializing,
            sync: None,
            report: None,
        };

        let mut done = Vec::new();
        match self.bring_up(&mut session, &mut done) {
            Ok(()) => {
                session.status = SessionStatus::Active;
                tracing::info!(
                    folder = %folder,
                    repo = %repo,
                    merged = %session.paths.merged.display(),
                    "Session active"
                );
                Ok(session)
            }
            Err(err) => {
                session.status = SessionStatus::Failed;
                tracing::error!(folder = %folder, repo = %repo, error = %err, "Session failed");
                if let Some(mut sync) = session.sync.take() {
                    sync.stop();
                }
                self.rollback(&session, &done);
                Err(err)
            }
        }
    }

    fn bring_up(&self, session: &mut MountSession, done: &mut Vec<Step>) -> Result<()> {
        let paths = session.paths.clone();

        let acquired =
            self.registry
                .acquire(&session.folder, &session.repo, session.pid, &paths.merged)?;
        done.push(Step::SlotAcquired);

        for stale in &acquired.reclaimed {
            if let Err(e) = self.clean_leftovers(stale) {
                tracing::warn!(folder = %stale.folder, error = %e, "Could not clean stale session leftovers");
            }
        }

        if is_mount_point(&paths.read_only) {
            tracing::info!(path = %paths.read_only.display(), "Detaching stale mount");
            if let Err(e) = self.detach(&paths.read_only) {
                if is_mount_point(&paths.read_only) {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Stale mount needed a lazy detach");
            }
        }
        fs::create_dir_all(&paths.read_only)
            .map_err(|e| MountError::io("create read-only directory", e))?;
        done.push(Step::ReadOnlyDirCreated);

        let root = self.remote.attach_read_only(&session.repo)?;
        {
            let _ops = self.lock_mount_ops();
            self.mounter.mount(&root, &paths.read_only)?;
        }
        done.push(Step::Attached);
        self.wait_until_ready(&paths.read_only)?;

        self.overlay.create(&paths.cache)?;
        done.push(Step::CacheCreated);

        // A half-built view is cleaned up the same way as a complete one.
        done.push(Step::MergedViewStarted);
        let linked = overlay::build_merged_view(&paths.read_only, &paths.cache, &paths.merged)?;
        tracing::debug!(folder = %session.folder, linked, "Merged view built");

        session.sync = Some(SyncLoop::start(
            Arc::clone(&self.sync_strategy),
            paths.cache.clone(),
            self.config.sync_interval(),
        )?);
        Ok(())
    }

    fn rollback(&self, session: &MountSession, done: &[Step]) {
        let paths = &session.paths;
        for step in done.iter().rev() {
            let result = match step {
                Step::MergedViewStarted => {
                    overlay::remove_merged_view(&paths.merged, &paths.read_only, &paths.cache)
                }
                Step::CacheCreated => self.overlay.destroy(&paths.cache),
                Step::Attached => self.detach(&paths.read_only),
                Step::ReadOnlyDirCreated => remove_empty_dir(&paths.read_only),
                Step::SlotAcquired => self.registry.release(&session.folder, session.pid).map(|_| ()),
            };
            if let Err(e) = result {
                tracing::warn!(folder = %session.folder, step = ?step, error = %e, "Rollback step failed");
            }
        }
    }

    /// Polls the mount provider until the attach is visible.
    fn wait_until_ready(&self, path: &Path) -> Result<()> {
        let attempts = self.config.readiness_attempts.max(1);
        let interval = self.config.readiness_interval();
        let timeout = self.config.readiness_timeout();
        let started = Instant::now();

        let mut tried = 0;
        while tried < attempts {
            tried += 1;
            if self.mounter.is_ready(path)? {
                tracing::debug!(path = %path.display(), attempts = tried, "Mount ready");
                return Ok(());
            }
            if tried == attempts || (!timeout.is_zero() && started.elapsed() >= timeout) {
                break;
            }
            thread::sleep(interval);
        }

        Err(MountError::MountTimeout {
            path: path.to_path_buf(),
            attempts: tried,
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Run / Teardown
    // ─────────────────────────────────────────────────────────────────────────────

    /// Blocks until `shutdown` is set or the mount stops answering.
    pub fn run_until_shutdown(&self, session: &MountSession, shutdown: &AtomicBool) -> TeardownTrigger {
        let limit = self.config.health_failures.max(1);
        let mut failures = 0;

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return TeardownTrigger::Signal;
            }
            thread::sleep(self.config.health_interval());
            if shutdown.load(Ordering::SeqCst) {
                return TeardownTrigger::Signal;
            }

            match self.mounter.is_ready(&session.paths.read_only) {
                Ok(true) => failures = 0,
                Ok(false) => {
                    failures += 1;
                    tracing::warn!(folder = %session.folder, failures, "Mount not answering");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(folder = %session.folder, failures, error = %e, "Mount health probe failed");
                }
            }
            if failures >= limit {
                return TeardownTrigger::HealthCheck;
            }
        }
    }

    /// Tears the session down. A second call returns the first report and
    /// touches nothing.
    pub fn teardown(&self, session: &mut MountSession, trigger: TeardownTrigger) -> TeardownReport {
        if let Some(report) = &session.report {
            tracing::debug!(folder = %session.folder, "Teardown already done");
            return report.clone();
        }

        session.status = SessionStatus::Unmounting;
        tracing::info!(folder = %session.folder, trigger = %trigger, "Tearing down session");

        let paths = session.paths.clone();
        let mut outcome = TeardownOutcome::Clean;
        let mut errors = Vec::new();

        if let Some(mut sync) = session.sync.take() {
            sync.stop();
        }

        match self.detach(&paths.read_only) {
            Ok(()) => {}
            Err(e @ MountError::ForcedDetachEscalation { .. }) => {
                outcome = TeardownOutcome::Forced;
                errors.push(e.to_string());
            }
            Err(e) => errors.push(format!("detach: {e}")),
        }

        let steps: [(&str, Result<()>); 3] = [
            ("remove read-only directory", remove_empty_dir(&paths.read_only)),
            (
                "remove merged view",
                overlay::remove_merged_view(&paths.merged, &paths.read_only, &paths.cache),
            ),
            ("destroy cache", self.overlay.destroy(&paths.cache)),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                errors.push(format!("{step}: {e}"));
            }
        }

        match self.registry.release(&session.folder, session.pid) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(folder = %session.folder, "Registry entry was already gone"),
            Err(e) => errors.push(format!("release registry slot: {e}")),
        }

        for error in &errors {
            tracing::warn!(folder = %session.folder, error = %error, "Teardown step failed");
        }
        if outcome == TeardownOutcome::Clean && !errors.is_empty() {
            outcome = TeardownOutcome::Partial;
        }

        let report = TeardownReport {
            trigger,
            outcome,
            errors,
        };
        session.status = SessionStatus::Closed { outcome };
        session.report = Some(report.clone());
        tracing::info!(folder = %session.folder, outcome = ?outcome, "Session closed");
        report
    }

    /// Detaches `path`, retrying busy failures with backoff, then lazily.
    ///
    /// Falling back to the lazy detach is reported as
    /// [`MountError::ForcedDetachEscalation`] whether or not it succeeded.
    fn detach(&self, path: &Path) -> Result<()> {
        let _ops = self.lock_mount_ops();
        let attempts = self.config.detach_attempts.max(1);
        let mut last_busy = None;

        for attempt in 1..=attempts {
            match self.mounter.unmount(path) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_busy() => {
                    tracing::warn!(path = %path.display(), attempt, "Mount busy; retrying detach");
                    last_busy = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.config.detach_backoff(attempt));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let busy = last_busy.map(|e| e.to_string()).unwrap_or_default();
        let details = match self.mounter.force_unmount(path) {
            Ok(()) => format!("{busy}; lazy detach succeeded"),
            Err(e) => format!("{busy}; lazy detach failed: {e}"),
        };
        tracing::warn!(path = %path.display(), details = %details, "Escalated to lazy detach");
        Err(MountError::ForcedDetachEscalation {
            path: path.to_path_buf(),
            attempts,
            details,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Cross-process operations
    // ─────────────────────────────────────────────────────────────────────────────

    /// Ends the session holding `folder`, which may belong to another process.
    ///
    /// A live owner is asked to tear down with `SIGTERM`; a dead owner's
    /// leftovers are cleaned here.
    pub fn request_unmount(&self, folder: &FolderName) -> Result<UnmountOutcome> {
        let Some(entry) = self.registry.find(folder)? else {
            return Ok(UnmountOutcome::NotMounted);
        };

        if !entry.is_stale() && process::send_terminate(entry.pid) {
            tracing::info!(folder = %folder, pid = entry.pid, "Asked session owner to unmount");
            let wait = Duration::from_secs(self.config.unmount_wait_secs);
            let deadline = Instant::now() + wait;
            while Instant::now() < deadline {
                thread::sleep(UNMOUNT_POLL);
                match self.registry.find(folder)? {
                    // Owner died without releasing; fall through to reclaim.
                    Some(current) if current.pid == entry.pid && current.is_stale() => break,
                    Some(current) if current.pid == entry.pid => {}
                    _ => return Ok(UnmountOutcome::Signalled { pid: entry.pid }),
                }
            }
            if !entry.is_stale() {
                return Err(MountError::OwnerUnresponsive {
                    folder: folder.to_string(),
                    pid: entry.pid,
                    waited_secs: wait.as_secs(),
                });
            }
        }

        // Cleanup runs under our own claim so nobody can mount the folder
        // while its old paths are being removed.
        let Some(stale) = self.registry.take_over(folder, std::process::id())? else {
            return Ok(UnmountOutcome::NotMounted);
        };
        self.clean_claimed(&stale)?;
        Ok(UnmountOutcome::Reclaimed { entry: stale })
    }

    /// Claims every stale registry entry, cleans what its session left
    /// behind, then releases the claim.
    ///
    /// An entry whose cleanup fails is put back as it was and stays listed.
    pub fn reclaim_stale(&self) -> Result<Vec<RegistryEntry>> {
        let stale = self.registry.take_over_stale(std::process::id())?;
        let mut reclaimed = Vec::with_capacity(stale.len());
        for entry in stale {
            match self.clean_claimed(&entry) {
                Ok(()) => {
                    tracing::info!(folder = %entry.folder, pid = entry.pid, "Reclaimed stale session");
                    reclaimed.push(entry);
                }
                Err(e) => tracing::warn!(folder = %entry.folder, error = %e, "Could not clean stale session leftovers"),
            }
        }
        Ok(reclaimed)
    }

    /// Cleans up after `stale` while this process holds its folder, then
    /// releases the folder. On failure the stale entry is restored.
    fn clean_claimed(&self, stale: &RegistryEntry) -> Result<()> {
        let pid = std::process::id();
        if let Err(e) = self.clean_leftovers(stale) {
            if let Err(restore) = self.registry.hand_back(stale, pid) {
                tracing::warn!(folder = %stale.folder, error = %restore, "Could not restore stale registry entry");
            }
            return Err(e);
        }
        let folder = FolderName::parse(&stale.folder)?;
        self.registry.release(&folder, pid)?;
        Ok(())
    }

    /// Removes the on-disk remains of a session whose owner is gone.
    ///
    /// Paths are re-derived from the folder name, never taken from the entry.
    /// All steps run; the first failure is returned.
    fn clean_leftovers(&self, entry: &RegistryEntry) -> Result<()> {
        let folder = FolderName::parse(&entry.folder)?;
        let paths = self.session_paths(&folder)?;
        let detached = if is_mount_point(&paths.read_only) {
            self.detach(&paths.read_only)
        } else {
            Ok(())
        };
        let steps = [
            detached,
            remove_empty_dir(&paths.read_only),
            overlay::remove_merged_view(&paths.merged, &paths.read_only, &paths.cache),
            self.overlay.destroy(&paths.cache),
        ];

        match steps.into_iter().find_map(|result| result.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn session_paths(&self, folder: &FolderName) -> Result<SessionPaths> {
        Ok(SessionPaths {
            read_only: self.storage.read_only_path(folder)?,
            cache: self.storage.cache_path(folder)?,
            merged: self.storage.merged_path(folder)?,
        })
    }

    fn lock_mount_ops(&self) -> MutexGuard<'_, ()> {
        self.mount_ops.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Non-recursive removal; a missing directory is fine.
fn remove_empty_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MountError::io("remove read-only directory", e)),
    }
}
