//! Error types for hubmount-core operations.
//!
//! Every failure the lifecycle core can produce is a variant here. The CLI maps
//! them onto process exit codes via [`MountError::exit_code`].

use std::path::PathBuf;

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for anything that is not one of the categories below.
pub const EXIT_INTERNAL: i32 = 1;
/// Exit code for malformed folder or repository identifiers.
pub const EXIT_VALIDATION: i32 = 2;
/// Exit code when the folder already has a live session.
pub const EXIT_CONFLICT: i32 = 3;
/// Exit code for mount-provider, remote, and cache storage failures.
pub const EXIT_MOUNT_FAILURE: i32 = 4;

/// All errors that can occur in hubmount-core operations.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    // ─────────────────────────────────────────────────────────────────────
    // Input Errors (rejected before any side effect)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid {kind}: {value:?}: {reason}")]
    Validation {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("Folder {folder} is already mounted by PID {pid} ({repo})")]
    Conflict {
        folder: String,
        repo: String,
        pid: u32,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Provider Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Remote access failed for {repo}: {details}")]
    RemoteAccess { repo: String, details: String },

    #[error("Mount at {path} not ready after {attempts} attempts ({waited_ms} ms)")]
    MountTimeout {
        path: PathBuf,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("Mount at {path} is busy")]
    MountBusy { path: PathBuf },

    #[error("Detach of {path} failed after {attempts} attempts: {details}")]
    ForcedDetachEscalation {
        path: PathBuf,
        attempts: u32,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Cache storage unavailable at {path}: {details}")]
    Resource { path: PathBuf, details: String },

    #[error("Registry file corrupt: {path}: {details}")]
    Corruption { path: PathBuf, details: String },

    #[error("Registry lock at {path} still held after {attempts} attempts")]
    RegistryBusy { path: PathBuf, attempts: u32 },

    #[error("Session owner PID {pid} did not release {folder} within {waited_secs}s")]
    OwnerUnresponsive {
        folder: String,
        pid: u32,
        waited_secs: u64,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MountError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MountError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn resource(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        MountError::Resource {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Process exit code for this error, as documented for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            MountError::Validation { .. } => EXIT_VALIDATION,
            MountError::Conflict { .. } => EXIT_CONFLICT,
            MountError::RemoteAccess { .. }
            | MountError::MountTimeout { .. }
            | MountError::MountBusy { .. }
            | MountError::ForcedDetachEscalation { .. }
            | MountError::Resource { .. } => EXIT_MOUNT_FAILURE,
            MountError::Corruption { .. }
            | MountError::RegistryBusy { .. }
            | MountError::OwnerUnresponsive { .. }
            | MountError::Io { .. }
            | MountError::Json { .. } => EXIT_INTERNAL,
        }
    }

    /// Transient detach failures worth retrying.
    pub fn is_busy(&self) -> bool {
        matches!(self, MountError::MountBusy { .. })
    }
}

/// Convenience type alias for Results using MountError.
pub type Result<T> = std::result::Result<T, MountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_categories() {
        let validation = MountError::Validation {
            kind: "folder",
            value: "../x".to_string(),
            reason: "traversal".to_string(),
        };
        let conflict = MountError::Conflict {
            folder: "alpha".to_string(),
            repo: "org/dataset".to_string(),
            pid: 1,
        };
        let remote = MountError::RemoteAccess {
            repo: "org/dataset".to_string(),
            details: "denied".to_string(),
        };
        assert_eq!(validation.exit_code(), EXIT_VALIDATION);
        assert_eq!(conflict.exit_code(), EXIT_CONFLICT);
        assert_eq!(remote.exit_code(), EXIT_MOUNT_FAILURE);
        assert_ne!(EXIT_OK, validation.exit_code());
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(MountError::MountBusy {
            path: PathBuf::from("/tmp/x")
        }
        .is_busy());
        assert!(!MountError::resource("/dev/shm", "full").is_busy());
    }
}
