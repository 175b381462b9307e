//! `hubmount cleanup`: reclaim sessions left behind by crashed processes.

use hubmount_core::{Result, SessionController, EXIT_OK};

pub fn run(controller: &SessionController) -> Result<i32> {
    let reclaimed = controller.reclaim_stale()?;
    if reclaimed.is_empty() {
        println!("Nothing to clean up");
    }
    for entry in &reclaimed {
        println!("Reclaimed {} ({}, PID {})", entry.folder, entry.repo, entry.pid);
    }
    Ok(EXIT_OK)
}
