//! Background re-execution: relaunch the current binary as a detached child
//! with the same arguments minus the background flag, stdio redirected into
//! the sync log directory.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable marking the relaunched child; the CLI switches to
/// file logging when it is set.
pub const CHILD_ENV: &str = "COMMSMAP_BACKGROUND";

/// What the parent returns immediately after spawning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundHandle {
    pub mode: &'static str,
    pub pid: u32,
    pub log_path: PathBuf,
}

/// Spawn the detached child. `args` are the original CLI arguments with the
/// background flag already stripped.
pub fn spawn(args: &[String], log_dir: &Path) -> Result<BackgroundHandle> {
    let exe = std::env::current_exe()
        .map_err(|error| SyncError::Background(format!("cannot locate executable: {error}")))?;

    std::fs::create_dir_all(log_dir)
        .map_err(|error| SyncError::Background(format!("cannot create log dir: {error}")))?;
    let log_path = log_dir.join("comms-sync.out");
    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|error| SyncError::Background(format!("cannot open log file: {error}")))?;
    let stderr = stdout
        .try_clone()
        .map_err(|error| SyncError::Background(format!("cannot clone log handle: {error}")))?;

    let child = std::process::Command::new(exe)
        .args(args)
        .env(CHILD_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|error| SyncError::Background(error.to_string()))?;

    Ok(BackgroundHandle {
        mode: "background",
        pid: child.id(),
        log_path,
    })
}

/// Whether this process is the relaunched background child.
pub fn is_background_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// kill(pid, 0) probes for liveness without signalling.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive_and_bogus_pid_is_not() {
        assert!(is_process_alive(std::process::id()));
        // PID max on Linux is bounded well below this.
        assert!(!is_process_alive(99_999_999));
    }

    #[test]
    fn spawn_returns_quickly_with_pid_and_log_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Relaunching the test binary with --help exits immediately and
        // proves the spawn path end to end.
        let handle =
            spawn(&["--help".to_string()], dir.path()).expect("spawn should succeed");
        assert_eq!(handle.mode, "background");
        assert!(handle.pid > 0);
        assert!(handle.log_path.exists());
    }
}
