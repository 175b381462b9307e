//! Process liveness checks for registry entries.
//!
//! Operating systems reuse PIDs. An entry with PID 12345 might refer to a
//! hubmount process that crashed, and an unrelated process might now have that
//! PID. Entries record the owner's start time when it can be read; a live PID
//! whose start time differs is treated as a different process.

use sysinfo::{Pid, ProcessRefreshKind, System};

/// Allowed skew between the recorded and observed start time, in seconds.
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// Returns true if a process with this PID exists.
///
/// EPERM means the process exists but we may not signal it, so it counts as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // SAFETY: kill with signal 0 performs only the existence/permission check.
        if unsafe { libc::kill(raw, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Get the start time of a process (Unix timestamp, seconds).
/// Returns None if the process doesn't exist or can't be queried.
pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

/// Verify that a PID is alive and, when a start time was recorded, that it
/// still belongs to the same process.
pub fn is_pid_alive_verified(pid: u32, expected_start: Option<u64>) -> bool {
    if !is_pid_alive(pid) {
        return false;
    }

    let Some(expected) = expected_start else {
        return true;
    };

    match get_process_start_time(pid) {
        Some(actual) => actual.abs_diff(expected) <= START_TIME_TOLERANCE_SECS,
        // Alive but not inspectable; trust the PID.
        None => true,
    }
}

/// Sends SIGTERM to `pid`. Returns false if the signal could not be delivered.
pub fn send_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // SAFETY: SIGTERM delivery to a PID read from the registry; ESRCH if already gone.
        unsafe { libc::kill(raw, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn test_nonexistent_pid_is_dead() {
        assert!(!is_pid_alive(99_999_999));
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(u32::MAX));
    }

    #[test]
    fn test_verified_rejects_recycled_start_time() {
        let pid = std::process::id();
        let started = get_process_start_time(pid).unwrap();
        assert!(is_pid_alive_verified(pid, Some(started)));
        assert!(is_pid_alive_verified(pid, None));
        assert!(!is_pid_alive_verified(pid, Some(started.saturating_sub(3_600))));
    }
}
