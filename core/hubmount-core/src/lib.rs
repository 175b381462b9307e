//! # hubmount-core
//!
//! Lifecycle core for mounting remote repositories as local folders: a
//! read-only remote view, a writable RAM-backed cache, and a merged directory
//! that links the two together.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The only background work is one sync thread per session.
//! - **Explicit shared state**: The registry is a value backed by a locked file, not a global.
//! - **Fail closed**: Paths are derived from validated names and confined to their roots.
//! - **Typed errors**: Every failure is a [`MountError`] variant with an exit code.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hubmount_core::*;
//!
//! let storage = StorageConfig::from_home()?;
//! let config = MountConfig::load(&storage.config_file());
//! let controller = SessionController::new(
//!     storage,
//!     config.clone(),
//!     Arc::new(HubRemote::new(config.require_token)),
//!     Arc::new(CommandMountProvider::from_config(&config)),
//! );
//!
//! let repo = RepositoryId::parse("org/dataset")?;
//! let mut session = controller.create(&repo, &FolderName::default_for(&repo)?)?;
//! let trigger = controller.run_until_shutdown(&session, &shutdown_flag);
//! let report = controller.teardown(&mut session, trigger);
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod overlay;
pub mod process;
pub mod provider;
pub mod registry;
pub mod session;
pub mod storage;
pub mod sync_loop;
pub mod validation;

// Re-export commonly used items at crate root
pub use config::{HelperCommand, MountConfig};
pub use controller::{SessionController, UnmountOutcome};
pub use error::{
    MountError, Result, EXIT_CONFLICT, EXIT_INTERNAL, EXIT_MOUNT_FAILURE, EXIT_OK,
    EXIT_VALIDATION,
};
pub use overlay::{CacheOverlay, CacheUsage, WRITE_LINK};
pub use provider::{
    check_fuse_available, CommandMountProvider, HubRemote, MountProvider, RemoteContentProvider,
    VirtualRoot,
};
pub use registry::{Acquired, LockRegistry, RegistryEntry};
pub use session::{
    MountSession, SessionPaths, SessionStatus, TeardownOutcome, TeardownReport, TeardownTrigger,
};
pub use storage::StorageConfig;
pub use sync_loop::{NoopSync, RetentionSweep, SyncContext, SyncLoop, SyncReport, SyncStrategy};
pub use validation::{FolderName, RepositoryId};
