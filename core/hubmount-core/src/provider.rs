//! External collaborators: the remote content provider and the mount provider.
//!
//! The lifecycle core only talks to these traits. The concrete implementations
//! here drive an external FUSE helper process; tests substitute in-memory fakes.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fs_err as fs;

use crate::config::{HelperCommand, MountConfig};
use crate::error::{MountError, Result};
use crate::validation::RepositoryId;

/// Opaque handle to a remote tree, as produced by a [`RemoteContentProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualRoot {
    pub repo: RepositoryId,
    /// Address understood by the mount provider (e.g. `hf://org/dataset`).
    pub uri: String,
}

/// Exposes a named repository as a virtual root.
///
/// Network and auth failures surface as [`MountError::RemoteAccess`].
pub trait RemoteContentProvider: Send + Sync {
    fn attach_read_only(&self, repo: &RepositoryId) -> Result<VirtualRoot>;
}

/// Attaches and detaches virtual roots at local paths.
///
/// Implementors must make `mount` and `unmount` idempotent on already-unmounted
/// state, and return [`MountError::MountBusy`] for transient detach failures.
pub trait MountProvider: Send + Sync {
    /// Attach `root` read-only at `path`. May return before the mount is visible.
    fn mount(&self, root: &VirtualRoot, path: &Path) -> Result<()>;

    /// Detach whatever is mounted at `path`.
    fn unmount(&self, path: &Path) -> Result<()>;

    /// Lazy detach, used once regular detach retries are exhausted.
    fn force_unmount(&self, path: &Path) -> Result<()> {
        self.unmount(path)
    }

    /// True once the mount at `path` is visible and listable.
    fn is_ready(&self, path: &Path) -> Result<bool> {
        Ok(is_mount_point(path) && fs::read_dir(path).is_ok())
    }
}

/// Returns true if `path` sits on a different device than its parent.
///
/// A FUSE mount whose helper died still counts: stat on it fails with
/// `ENOTCONN` until someone detaches it.
pub fn is_mount_point(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let Some(parent) = path.parent() else {
            return true;
        };
        mounted_from(
            std::fs::metadata(path).map(|m| m.dev()),
            std::fs::metadata(parent).map(|m| m.dev()),
        )
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Decides mount state from the device ids of a path and its parent.
fn mounted_from(own: io::Result<u64>, parent: io::Result<u64>) -> bool {
    match (own, parent) {
        (Ok(own), Ok(parent)) => own != parent,
        (Err(e), _) => is_disconnected_mount(&e),
        (Ok(_), Err(_)) => false,
    }
}

/// True for the error a dead FUSE mount answers every request with.
pub fn is_disconnected_mount(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENOTCONN)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Reports a missing `/dev/fuse` as a resource error.
pub fn check_fuse_available() -> Result<()> {
    let device = Path::new("/dev/fuse");
    if device.exists() {
        Ok(())
    } else {
        Err(MountError::resource(
            device,
            "FUSE is not available (install fuse and add your user to the fuse group)",
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hub remote
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote provider for hub-hosted repositories.
///
/// Produces `hf://<owner>/<name>` roots. When a token is required, it must be in
/// `HF_TOKEN` or the token file; a missing token is a remote access error.
#[derive(Debug, Clone)]
pub struct HubRemote {
    scheme: String,
    token_file: Option<PathBuf>,
    require_token: bool,
}

impl HubRemote {
    pub fn new(require_token: bool) -> Self {
        Self {
            scheme: "hf://".to_string(),
            token_file: dirs::home_dir().map(|h| h.join(".cache/huggingface/token")),
            require_token,
        }
    }

    pub fn with_token_file(mut self, token_file: Option<PathBuf>) -> Self {
        self.token_file = token_file;
        self
    }

    fn has_token(&self) -> bool {
        if std::env::var("HF_TOKEN").is_ok_and(|t| !t.trim().is_empty()) {
            return true;
        }
        self.token_file
            .as_deref()
            .and_then(|p| fs::read_to_string(p).ok())
            .is_some_and(|t| !t.trim().is_empty())
    }
}

impl RemoteContentProvider for HubRemote {
    fn attach_read_only(&self, repo: &RepositoryId) -> Result<VirtualRoot> {
        if self.require_token && !self.has_token() {
            return Err(MountError::RemoteAccess {
                repo: repo.to_string(),
                details: "not logged in (set HF_TOKEN or run the hub login command)".to_string(),
            });
        }
        Ok(VirtualRoot {
            repo: repo.clone(),
            uri: format!("{}{}", self.scheme, repo),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helper-process mount provider
// ═══════════════════════════════════════════════════════════════════════════════

const HELPER_EXIT_WAIT: Duration = Duration::from_secs(2);
const HELPER_POLL: Duration = Duration::from_millis(50);
const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 20;
const STDERR_LINE_MAX: usize = 512;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A running mount helper.
struct Helper {
    child: Child,
    repo: RepositoryId,
    /// Last lines the helper wrote to stderr, kept for error reports.
    stderr_tail: StderrTail,
    drain: JoinHandle<()>,
}

impl Helper {
    /// Turns an early helper exit into the error reported to the caller.
    fn exit_error(self, status: ExitStatus) -> MountError {
        let deadline = Instant::now() + STDERR_DRAIN_WAIT;
        while !self.drain.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let tail = lock_tail(&self.stderr_tail)
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        MountError::RemoteAccess {
            repo: self.repo.to_string(),
            details: format!("mount helper exited ({status}): {tail}"),
        }
    }
}

/// Reads the helper's stderr until EOF so the helper never blocks on a full
/// pipe. Lines go to the log; the last few are kept in `tail`.
fn drain_stderr(pipe: ChildStderr, repo: String, tail: StderrTail) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hubmount-helper-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(pipe).split(b'\n') {
                let Ok(bytes) = line else {
                    break;
                };
                let text = String::from_utf8_lossy(&bytes);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                tracing::info!(repo = %repo, "helper: {text}");

                let mut kept = lock_tail(&tail);
                if kept.len() == STDERR_TAIL_LINES {
                    kept.pop_front();
                }
                kept.push_back(text.chars().take(STDERR_LINE_MAX).collect());
            }
        })
}

fn lock_tail(tail: &StderrTail) -> MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mount provider that runs a FUSE helper as a child process per mount and
/// detaches with `fusermount -u`.
pub struct CommandMountProvider {
    helper: HelperCommand,
    unmount_program: String,
    helpers: Mutex<HashMap<PathBuf, Helper>>,
}

impl CommandMountProvider {
    pub fn new(helper: HelperCommand, unmount_program: String) -> Self {
        Self {
            helper,
            unmount_program,
            helpers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &MountConfig) -> Self {
        Self::new(config.mount_helper.clone(), config.unmount_program.clone())
    }

    fn helper_args(&self, root: &VirtualRoot, path: &Path) -> Vec<String> {
        let mountpoint = path.to_string_lossy();
        self.helper
            .args
            .iter()
            .map(|arg| {
                arg.replace("{remote}", &root.uri)
                    .replace("{mountpoint}", &mountpoint)
            })
            .collect()
    }

    fn run_unmount(&self, path: &Path, flags: &str) -> Result<()> {
        let output = Command::new(&self.unmount_program)
            .arg(flags)
            .arg(path)
            .output()
            .map_err(|e| MountError::io(format!("run {}", self.unmount_program), e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("busy") {
            return Err(MountError::MountBusy {
                path: path.to_path_buf(),
            });
        }
        if stderr.contains("not mounted") || stderr.contains("not found in /etc/mtab") {
            return Ok(());
        }
        Err(MountError::io(
            format!("{} {} {}", self.unmount_program, flags, path.display()),
            std::io::Error::other(stderr.trim().to_string()),
        ))
    }

    /// Waits (bounded) for the helper of `path` to exit, then kills it.
    fn reap_helper(&self, path: &Path) {
        let Some(mut helper) = self.lock_helpers().remove(path) else {
            return;
        };
        let deadline = Instant::now() + HELPER_EXIT_WAIT;
        while Instant::now() < deadline {
            match helper.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(HELPER_POLL),
                Err(_) => break,
            }
        }
        tracing::warn!(path = %path.display(), "Mount helper still running after detach; killing");
        let _ = helper.child.kill();
        let _ = helper.child.wait();
    }

    fn lock_helpers(&self) -> MutexGuard<'_, HashMap<PathBuf, Helper>> {
        self.helpers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MountProvider for CommandMountProvider {
    fn mount(&self, root: &VirtualRoot, path: &Path) -> Result<()> {
        if is_mount_point(path) {
            return Ok(());
        }

        let args = self.helper_args(root, path);
        tracing::debug!(program = %self.helper.program, ?args, "Spawning mount helper");
        let mut child = Command::new(&self.helper.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MountError::RemoteAccess {
                repo: root.repo.to_string(),
                details: format!("failed to start {}: {}", self.helper.program, e),
            })?;

        let stderr_tail = StderrTail::default();
        let drain = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("helper stderr was not captured"))
            .and_then(|pipe| drain_stderr(pipe, root.repo.to_string(), Arc::clone(&stderr_tail)));
        let drain = match drain {
            Ok(drain) => drain,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MountError::io("read mount helper output", e));
            }
        };

        self.lock_helpers().insert(
            path.to_path_buf(),
            Helper {
                child,
                repo: root.repo.clone(),
                stderr_tail,
                drain,
            },
        );
        Ok(())
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        if is_mount_point(path) {
            self.run_unmount(path, "-u")?;
        }
        self.reap_helper(path);
        Ok(())
    }

    fn force_unmount(&self, path: &Path) -> Result<()> {
        if is_mount_point(path) {
            self.run_unmount(path, "-uz")?;
        }
        self.reap_helper(path);
        Ok(())
    }

    fn is_ready(&self, path: &Path) -> Result<bool> {
        let mut helpers = self.lock_helpers();
        let exited = helpers
            .get_mut(path)
            .and_then(|helper| helper.child.try_wait().ok().flatten());
        if let Some(status) = exited {
            if let Some(helper) = helpers.remove(path) {
                drop(helpers);
                return Err(helper.exit_error(status));
            }
        }
        drop(helpers);
        Ok(is_mount_point(path) && fs::read_dir(path).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo() -> RepositoryId {
        RepositoryId::parse("org/dataset").unwrap()
    }

    #[test]
    fn test_hub_remote_builds_uri_without_token_requirement() {
        let remote = HubRemote::new(false).with_token_file(None);
        let root = remote.attach_read_only(&repo()).unwrap();
        assert_eq!(root.uri, "hf://org/dataset");
        assert_eq!(root.repo, repo());
    }

    #[test]
    fn test_hub_remote_accepts_token_file() {
        let temp = tempdir().unwrap();
        let token = temp.path().join("token");
        fs::write(&token, "hf_abc\n").unwrap();
        let remote = HubRemote::new(true).with_token_file(Some(token));
        assert!(remote.attach_read_only(&repo()).is_ok());
    }

    #[test]
    fn test_hub_remote_rejects_empty_token_file() {
        if std::env::var("HF_TOKEN").is_ok() {
            return;
        }
        let temp = tempdir().unwrap();
        let token = temp.path().join("token");
        fs::write(&token, "  ").unwrap();
        let remote = HubRemote::new(true).with_token_file(Some(token));
        assert!(matches!(
            remote.attach_read_only(&repo()),
            Err(MountError::RemoteAccess { .. })
        ));
    }

    #[test]
    fn test_helper_args_substitute_placeholders() {
        let provider =
            CommandMountProvider::new(HelperCommand::default(), "fusermount".to_string());
        let root = VirtualRoot {
            repo: repo(),
            uri: "hf://org/dataset".to_string(),
        };
        let args = provider.helper_args(&root, Path::new("/tmp/.hubmount_alpha_ro"));
        assert_eq!(
            args,
            ["mount", "--read-only", "hf://org/dataset", "/tmp/.hubmount_alpha_ro"]
        );
    }

    #[test]
    fn test_plain_directory_is_not_a_mount_point() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("ro");
        fs::create_dir(&dir).unwrap();
        assert!(!is_mount_point(&dir));
        assert!(!is_mount_point(&temp.path().join("missing")));
    }

    #[test]
    fn test_unmount_of_unmounted_path_is_noop() {
        let temp = tempdir().unwrap();
        let provider = CommandMountProvider::new(
            HelperCommand::default(),
            "definitely-not-a-real-unmount-binary".to_string(),
        );
        // Not a mount point, so the unmount program is never invoked.
        provider.unmount(temp.path()).unwrap();
        provider.force_unmount(temp.path()).unwrap();
    }

    #[test]
    fn test_helper_that_exits_surfaces_remote_access_error() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("ro");
        fs::create_dir(&dir).unwrap();
        let provider = CommandMountProvider::new(
            HelperCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "echo denied >&2; exit 3".to_string()],
            },
            "fusermount".to_string(),
        );
        let root = VirtualRoot {
            repo: repo(),
            uri: "hf://org/dataset".to_string(),
        };
        provider.mount(&root, &dir).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match provider.is_ready(&dir) {
                Err(MountError::RemoteAccess { repo, details }) => {
                    assert_eq!(repo, "org/dataset");
                    assert!(details.contains("denied"));
                    break;
                }
                Ok(false) if Instant::now() < deadline => thread::sleep(HELPER_POLL),
                other => panic!("unexpected readiness result: {other:?}"),
            }
        }
    }

    #[test]
    fn test_chatty_helper_is_not_blocked_by_stderr() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("ro");
        fs::create_dir(&dir).unwrap();
        let marker = temp.path().join("past-logging");
        let script = format!(
            "yes 'read error: connection reset' | head -c 200000 >&2; touch '{}'; exec sleep 10",
            marker.display()
        );
        let provider = CommandMountProvider::new(
            HelperCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script],
            },
            "fusermount".to_string(),
        );
        let root = VirtualRoot {
            repo: repo(),
            uri: "hf://org/dataset".to_string(),
        };
        provider.mount(&root, &dir).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !marker.exists() && Instant::now() < deadline {
            thread::sleep(HELPER_POLL);
        }
        assert!(marker.exists(), "helper stalled writing to stderr");

        // Not a mount point, so this only reaps the helper.
        provider.unmount(&dir).unwrap();
        assert!(provider.lock_helpers().is_empty());
    }

    #[test]
    fn test_disconnected_mount_still_counts_as_mounted() {
        let dead = || io::Error::from_raw_os_error(libc::ENOTCONN);
        assert!(is_disconnected_mount(&dead()));
        assert!(mounted_from(Err(dead()), Ok(1)));
        assert!(mounted_from(Ok(2), Ok(1)));
        assert!(!mounted_from(Ok(1), Ok(1)));
        assert!(!mounted_from(
            Err(io::Error::from(io::ErrorKind::NotFound)),
            Ok(1)
        ));
        assert!(!is_disconnected_mount(&io::Error::from_raw_os_error(libc::ENOENT)));
    }
}
