//! Per-run staging lock.
//!
//! One controller owns a run's staging directory. A second instance for
//! the same run finds the lock and short-circuits while the holder is
//! alive; a lock left by a dead process is broken so a later invocation
//! can resume from the persisted index.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

const LOCK_FILE: &str = "staging.lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

#[derive(Debug)]
pub enum LockState {
    Acquired(StagingLock),
    /// Another live process holds the staging directory.
    HeldByLive { pid: u32 },
}

#[derive(Debug)]
pub struct StagingLock {
    path: PathBuf,
}

impl StagingLock {
    pub fn release(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn acquire(staging_dir: &Path) -> Result<LockState> {
    let path = staging_dir.join(LOCK_FILE);

    if let Ok(data) = std::fs::read(&path) {
        if let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) {
            if entry.pid != std::process::id() && pid_alive(entry.pid) {
                return Ok(LockState::HeldByLive { pid: entry.pid });
            }
            warn!(
                pid = entry.pid,
                host = %entry.hostname,
                "breaking stale staging lock"
            );
        }
        let _ = std::fs::remove_file(&path);
    }

    let entry = LockEntry {
        hostname: crate::platform::hostname(),
        pid: std::process::id(),
        time: Utc::now().to_rfc3339(),
    };
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
    std::fs::rename(&tmp, &path)?;
    info!(path = %path.display(), "staging lock acquired");
    Ok(LockState::Acquired(StagingLock { path }))
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
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
    fn acquire_then_reacquire_same_process() {
        let dir = tempfile::tempdir().unwrap();
        let state = acquire(dir.path()).unwrap();
        assert!(matches!(state, LockState::Acquired(_)));
        // Same pid takes its own lock back over.
        let again = acquire(dir.path()).unwrap();
        assert!(matches!(again, LockState::Acquired(_)));
    }

    #[test]
    fn dead_holder_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let entry = LockEntry {
            hostname: "elsewhere".into(),
            pid: u32::MAX - 1, // no such process
            time: Utc::now().to_rfc3339(),
        };
        std::fs::write(
            dir.path().join(LOCK_FILE),
            serde_json::to_vec(&entry).unwrap(),
        )
        .unwrap();
        let state = acquire(dir.path()).unwrap();
        assert!(matches!(state, LockState::Acquired(_)));
    }

    #[test]
    fn live_holder_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 is always alive (kill(1, 0) fails with EPERM, not ESRCH).
        let entry = LockEntry {
            hostname: "elsewhere".into(),
            pid: 1,
            time: Utc::now().to_rfc3339(),
        };
        std::fs::write(
            dir.path().join(LOCK_FILE),
            serde_json::to_vec(&entry).unwrap(),
        )
        .unwrap();
        let state = acquire(dir.path()).unwrap();
        assert!(matches!(state, LockState::HeldByLive { pid: 1 }));
    }

    #[test]
    fn garbage_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), b"not json").unwrap();
        let state = acquire(dir.path()).unwrap();
        assert!(matches!(state, LockState::Acquired(_)));
    }

    #[test]
    fn release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let LockState::Acquired(lock) = acquire(dir.path()).unwrap() else {
            panic!("expected acquisition");
        };
        assert!(dir.path().join(LOCK_FILE).exists());
        lock.release();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }
}
