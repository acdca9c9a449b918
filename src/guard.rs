//! Single-instance enforcement.
//!
//! The supervisor rewrites global firewall state; two concurrent runs would
//! fight over the NAT table and each other's snapshots. A PID file under the
//! run directory refuses the second start and is released on drop.

use anyhow::Result;
use std::path::{Path, PathBuf};

pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, returning `None` when a live supervisor already holds it.
    /// A PID file left behind by a dead process is treated as stale.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        let pid = std::process::id();

        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            if let Ok(old_pid) = contents.trim().parse::<u32>() {
                if old_pid != pid && process_exists(old_pid) {
                    return Ok(None);
                }
            }
            let _ = std::fs::remove_file(path);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, format!("{}\n", pid))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }

    pub fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release();
    }
}

// kill(pid, 0) sends nothing; it only checks existence/permissions.
#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(raw_pid, 0) };
    if rc == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::RunLock;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("torflock.pid");
        let lock = RunLock::acquire(&path).expect("acquire").expect("free lock");
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn own_pid_in_the_file_is_not_a_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("torflock.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).expect("seed pid file");
        let lock = RunLock::acquire(&path).expect("acquire");
        assert!(lock.is_some());
    }

    #[test]
    fn stale_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("torflock.pid");
        // PID values this large cannot exist on linux (pid_max caps lower).
        std::fs::write(&path, "4194999999\n").expect("seed stale pid");
        let lock = RunLock::acquire(&path).expect("acquire");
        assert!(lock.is_some(), "stale lock should be reclaimed");
    }
}
