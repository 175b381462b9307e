//! Tunables for the mount lifecycle.
//!
//! Loaded from `~/.hubmount/config.json`. Every field has a default, so a
//! missing file (or a file that only sets a couple of fields) is fine.

use std::path::Path;
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};

/// External helper that attaches a remote root at a mount point.
///
/// `{remote}` and `{mountpoint}` in `args` are substituted at spawn time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for HelperCommand {
    fn default() -> Self {
        Self {
            program: "rclone".to_string(),
            args: vec![
                "mount".to_string(),
                "--read-only".to_string(),
                "{remote}".to_string(),
                "{mountpoint}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Seconds between sync loop ticks.
    pub sync_interval_secs: u64,
    /// Readiness probes after attach before giving up.
    pub readiness_attempts: u32,
    /// Fixed delay between readiness probes.
    pub readiness_interval_ms: u64,
    /// Detach attempts on a busy mount before escalating to a lazy detach.
    pub detach_attempts: u32,
    /// Initial delay between detach attempts (doubles each retry).
    pub detach_backoff_ms: u64,
    pub detach_backoff_max_ms: u64,
    /// How often the foreground loop checks the teardown flag and mount health.
    pub health_interval_ms: u64,
    /// Consecutive failed health probes before an automatic teardown.
    pub health_failures: u32,
    /// How long `unmount` waits for a live owner to release its session.
    pub unmount_wait_secs: u64,
    /// Minimum free space on the cache root for a new session.
    pub min_cache_free_mb: u64,
    /// Remove cached files older than this on each sync tick. Off when unset.
    pub cache_retention_secs: Option<u64>,
    pub mount_helper: HelperCommand,
    pub unmount_program: String,
    /// Refuse to mount when no access token is available.
    pub require_token: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 120,
            readiness_attempts: 30,
            readiness_interval_ms: 100,
            detach_attempts: 5,
            detach_backoff_ms: 200,
            detach_backoff_max_ms: 2_000,
            health_interval_ms: 1_000,
            health_failures: 3,
            unmount_wait_secs: 15,
            min_cache_free_mb: 64,
            cache_retention_secs: None,
            mount_helper: HelperCommand::default(),
            unmount_program: "fusermount".to_string(),
            require_token: true,
        }
    }
}

impl MountConfig {
    /// Loads the config, returning defaults if the file doesn't exist or is malformed.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read config; using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Malformed config; using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    /// Overall deadline for readiness polling.
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_interval() * self.readiness_attempts.max(1)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(10))
    }

    /// Delay before detach attempt `attempt` (1-based): doubling, capped.
    pub fn detach_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.detach_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.detach_backoff_max_ms))
    }

    pub fn cache_retention(&self) -> Option<Duration> {
        self.cache_retention_secs.map(Duration::from_secs)
    }
}
