//! Single-instance enforcement through a PID file.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use log::{info, warn};

/// Default location of the lock record.
pub const DEFAULT_PID_FILE: &str = "/var/run/mbpfan.pid";

/// State of an existing lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// No record on disk.
    Free,
    /// Record names a process that no longer exists, or cannot be parsed.
    Stale,
    /// Record names a running process.
    Alive(i32),
}

/// Returns whether a process with `pid` currently exists.
///
/// A process owned by another user still counts as alive.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Inspects the record at `path`.
pub fn inspect(path: &Path) -> Result<LockOwner> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockOwner::Free),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read pid file {}", path.display()));
        }
    };

    Ok(match content.trim().parse::<i32>() {
        Ok(pid) if process_alive(pid) => LockOwner::Alive(pid),
        _ => LockOwner::Stale,
    })
}

/// Lock record held by this process.
///
/// Dropping the guard removes the record.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl PidFile {
    /// Takes the lock for the current process.
    ///
    /// Fails without touching the filesystem when a live process holds the
    /// lock. A stale record is removed first.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        Self::acquire_for(path, std::process::id())
    }

    fn acquire_for(path: impl Into<PathBuf>, pid: u32) -> Result<Self> {
        let path = path.into();

        match inspect(&path)? {
            LockOwner::Alive(owner) => {
                bail!(
                    "{} is held by running process {owner}, refusing to start",
                    path.display()
                );
            }
            LockOwner::Stale => {
                warn!("Removing stale pid file {}", path.display());
                fs::remove_file(&path).with_context(|| {
                    format!("Failed to remove stale pid file {}", path.display())
                })?;
            }
            LockOwner::Free => {}
        }

        info!("Writing pid {pid} to {}", path.display());
        create_record(&path, pid)?;

        Ok(Self {
            path,
            pid,
            released: false,
        })
    }

    /// Removes the record.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove pid file {}", self.path.display()))?;
        info!("Removed pid file {} (pid {})", self.path.display(), self.pid);
        Ok(())
    }
}

/// Writes `pid` to a new file at `path`. Fails if the file already exists.
fn create_record(path: &Path, pid: u32) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            bail!(
                "{} was created by another instance while starting, refusing to start",
                path.display()
            );
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Can not create pid file at {}", path.display()));
        }
    };
    file.write_all(pid.to_string().as_bytes())
        .with_context(|| format!("Can not write pid file at {}", path.display()))
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove pid file {}: {e}", self.path.display());
            }
        }
    }
}
