//! `hubmount mount`: create a session, hold it until a signal, tear it down.
//!
//! The signal handler only flips a flag. Teardown runs here on the main
//! thread, so repeated Ctrl+C presses during teardown have no effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hubmount_core::{
    check_fuse_available, FolderName, MountError, RepositoryId, Result, SessionController,
    TeardownOutcome, TeardownReport, EXIT_INTERNAL, EXIT_MOUNT_FAILURE, EXIT_OK,
};

pub fn run(controller: &SessionController, repo: &str, folder: Option<&str>) -> Result<i32> {
    let repo = RepositoryId::parse(repo)?;
    let folder = match folder {
        Some(folder) => FolderName::parse(folder)?,
        None => FolderName::default_for(&repo)?,
    };
    check_fuse_available()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).map_err(|e| {
        MountError::io(
            "install signal handler",
            std::io::Error::other(e.to_string()),
        )
    })?;

    let mut session = controller.create(&repo, &folder)?;
    println!("Mounted {} at {}", repo, session.merged_path().display());
    println!("  read-only: {}", session.read_only_path().display());
    println!("  writable:  {}", session.cache_path().display());
    println!("Press Ctrl+C to unmount.");

    let trigger = controller.run_until_shutdown(&session, &shutdown);
    println!("Unmounting {} ({})...", folder, trigger);
    let report = controller.teardown(&mut session, trigger);

    for error in &report.errors {
        eprintln!("  warning: {error}");
    }
    Ok(exit_code_for(&report))
}

fn exit_code_for(report: &TeardownReport) -> i32 {
    match report.outcome {
        TeardownOutcome::Forced => EXIT_MOUNT_FAILURE,
        TeardownOutcome::Partial => EXIT_INTERNAL,
        TeardownOutcome::Clean => EXIT_OK,
    }
}
