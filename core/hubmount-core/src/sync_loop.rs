//! Background periodic synchronization for an active session.
//!
//! The loop owns one named thread. It sleeps on a channel with `recv_timeout`,
//! so [`SyncLoop::stop`] wakes it immediately instead of waiting out the
//! interval, then joins it. A failing tick is logged and the loop keeps going.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use crate::error::{MountError, Result};

/// What a strategy gets to see on each tick.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub cache_path: PathBuf,
    /// 1-based tick counter.
    pub tick: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_examined: usize,
    pub files_removed: usize,
}

/// Pluggable body of the sync cycle.
pub trait SyncStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn tick(&self, ctx: &SyncContext) -> Result<SyncReport>;
}

/// Does nothing. The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSync;

impl SyncStrategy for NoopSync {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn tick(&self, _ctx: &SyncContext) -> Result<SyncReport> {
        Ok(SyncReport::default())
    }
}

/// Deletes regular files in the cache whose mtime is older than `max_age`.
///
/// Symlinks are never followed or removed. Directories are left in place.
#[derive(Debug, Clone, Copy)]
pub struct RetentionSweep {
    pub max_age: Duration,
}

impl RetentionSweep {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    fn is_expired(&self, path: &Path, now: SystemTime) -> bool {
        let Ok(meta) = fs_err::symlink_metadata(path) else {
            return false;
        };
        if !meta.file_type().is_file() {
            return false;
        }
        meta.modified()
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .is_some_and(|age| age > self.max_age)
    }
}

impl SyncStrategy for RetentionSweep {
    fn name(&self) -> &'static str {
        "retention"
    }

    fn tick(&self, ctx: &SyncContext) -> Result<SyncReport> {
        let now = SystemTime::now();
        let mut report = SyncReport::default();

        for entry in WalkDir::new(&ctx.cache_path)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            report.files_examined += 1;
            if self.is_expired(entry.path(), now) {
                fs_err::remove_file(entry.path())
                    .map_err(|e| MountError::io("remove expired cache file", e))?;
                report.files_removed += 1;
            }
        }

        Ok(report)
    }
}

/// Handle to a running sync thread.
pub struct SyncLoop {
    stop_flag: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncLoop {
    pub fn start(
        strategy: Arc<dyn SyncStrategy>,
        cache_path: PathBuf,
        interval: Duration,
    ) -> Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = mpsc::channel::<()>();
        let flag = Arc::clone(&stop_flag);

        let handle = thread::Builder::new()
            .name(format!("hubmount-sync-{}", strategy.name()))
            .spawn(move || {
                let mut ctx = SyncContext { cache_path, tick: 0 };
                loop {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match wake_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }

                    ctx.tick += 1;
                    match strategy.tick(&ctx) {
                        Ok(report) => tracing::debug!(
                            tick = ctx.tick,
                            examined = report.files_examined,
                            removed = report.files_removed,
                            "Sync tick"
                        ),
                        Err(e) => tracing::warn!(tick = ctx.tick, error = %e, "Sync tick failed"),
                    }
                }
            })
            .map_err(|e| MountError::io("spawn sync thread", e))?;

        Ok(Self {
            stop_flag,
            wake: Some(wake),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and joins it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(wake) = self.wake.take() {
            let _ = wake.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Sync thread panicked");
            }
        }
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SyncLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLoop")
            .field("running", &self.is_running())
            .finish()
    }
}
