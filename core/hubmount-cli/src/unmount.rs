//! `hubmount unmount`: ask the owning process to tear its session down.

use hubmount_core::{FolderName, Result, SessionController, UnmountOutcome, EXIT_OK};

pub fn run(controller: &SessionController, folder: &str) -> Result<i32> {
    let folder = FolderName::parse(folder)?;
    match controller.request_unmount(&folder)? {
        UnmountOutcome::NotMounted => println!("{folder} is not mounted"),
        UnmountOutcome::Signalled { pid } => println!("Unmounted {folder} (owner PID {pid})"),
        UnmountOutcome::Reclaimed { entry } => {
            println!("Cleaned up {folder} (owner PID {} was gone)", entry.pid)
        }
    }
    Ok(EXIT_OK)
}
