//! Host-local advisory locks backed by `flock(2)`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait until the lock becomes available.
    Blocking,
    /// Fail with `Error::HostLockContended` if another process holds the lock.
    NonBlocking,
}

#[derive(Debug, Default)]
struct LockState {
    file: Option<File>,
    depth: usize,
}

/// Re-entrant exclusive lock on a file, shared by all guards handed out by one `HostLock`.
///
/// Nested `acquire` calls only bump a counter; the OS lock is released when the last guard drops.
#[derive(Debug, Clone)]
pub struct HostLock {
    path: PathBuf,
    state: Arc<Mutex<LockState>>,
}

impl HostLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(LockState::default())),
        }
    }

    /// Number of live guards.
    pub fn depth(&self) -> usize {
        lock_state(&self.state).depth
    }

    pub fn acquire(&self, mode: LockMode) -> Result<HostLockGuard> {
        let mut state = lock_state(&self.state);
        if state.depth > 0 {
            state.depth += 1;
            tracing::trace!(path = %self.path.display(), depth = state.depth, "re-entered host lock");
            return Ok(self.guard());
        }

        let file = open_lock_file(&self.path)?;
        let flags = match mode {
            LockMode::Blocking => libc::LOCK_EX,
            LockMode::NonBlocking => libc::LOCK_EX | libc::LOCK_NB,
        };
        match flock(&file, flags) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(Error::HostLockContended {
                    path: self.path.clone(),
                });
            }
            Err(err) => {
                return Err(Error::io(
                    format!("Failed to lock {}", self.path.display()),
                    err,
                ));
            }
        }

        state.file = Some(file);
        state.depth = 1;
        tracing::debug!(path = %self.path.display(), "acquired host lock");
        Ok(self.guard())
    }

    fn guard(&self) -> HostLockGuard {
        HostLockGuard {
            path: self.path.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Releases one level of a `HostLock` when dropped.
#[derive(Debug)]
pub struct HostLockGuard {
    path: PathBuf,
    state: Arc<Mutex<LockState>>,
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            if let Some(file) = state.file.take() {
                let _ = flock(&file, libc::LOCK_UN);
                tracing::debug!(path = %self.path.display(), "released host lock");
            }
        }
    }
}

/// Non-reentrant host-local guard preventing two concurrent migrations of the same VM.
///
/// The kernel drops the lock if the holder dies, so a crashed migration never wedges the VM.
#[derive(Debug)]
pub struct MigrationLock {
    path: PathBuf,
    file: Option<File>,
}

impl MigrationLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Returns `true` if the lock is held after the call.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        let file = open_lock_file(&self.path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                self.file = Some(file);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(Error::io(
                format!("Failed to lock {}", self.path.display()),
                err,
            )),
        }
    }

    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = flock(&file, libc::LOCK_UN);
        }
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_state(state: &Mutex<LockState>) -> MutexGuard<'_, LockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            Error::io(
                format!("Failed to create lock directory {}", parent.display()),
                err,
            )
        })?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|err| Error::io(format!("Failed to open lock file {}", path.display()), err))
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        let res = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if res == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}
