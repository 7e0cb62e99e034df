//! Process-wide mutual exclusion via a PID-bearing lock file.
//!
//! At most one bootstrap runs on a host at a time. The lock file holds
//! the owner's ASCII PID; a file left behind by a dead process (or one
//! that is empty or unparseable) is reclaimed automatically.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// An exclusive, PID-stamped file lock.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Create a handle for the lock at `path`. Does not acquire.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Try to acquire the lock, returning whether we own it.
    ///
    /// The lock is acquirable when the file is absent, empty, contains
    /// garbage, contains our own PID, or names a PID that is no longer
    /// alive. A live foreign holder wins.
    pub fn lock(&self) -> Result<bool> {
        if let Some(pid) = self.holder()? {
            if pid != std::process::id() && pid_alive(pid) {
                debug!(pid, path = %self.path.display(), "lock held by live process");
                return Ok(false);
            }
            debug!(pid, "reclaiming stale lock");
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(&self.path, std::process::id().to_string())
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(true)
    }

    /// PID recorded in the lock file, if the file exists and parses.
    pub fn holder(&self) -> Result<Option<u32>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }

    /// Release the lock by removing the file.
    ///
    /// Failures other than the file already being gone are logged, not
    /// surfaced; release runs on exit paths that must not themselves fail.
    pub fn unlock(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
    }
}

/// Whether a process with this PID currently exists.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything. EPERM means
    // the process exists but belongs to someone else.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a portable probe, assume the holder is alive rather than
    // risk two concurrent bootstraps.
    true
}
