//! Reentrant advisory file lock shared by threads and processes.
//!
//! The OS lock (`fs2::FileExt::lock_exclusive` on a dedicated `.lock` file)
//! serialises independent processes. Inside one process an owner/depth record
//! serialises threads and lets the owning thread re-acquire the lock it
//! already holds, so a critical section can call into store methods that take
//! the same lock themselves.

use crate::error::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
    file: Option<File>,
}

#[derive(Debug)]
struct LockInner {
    path: PathBuf,
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockInner {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cloneable handle to one named lock. Clones share the same lock.
#[derive(Debug, Clone)]
pub struct StoreLock {
    inner: Arc<LockInner>,
}

impl StoreLock {
    /// Create a handle for the lock file at `path`. The file is created on
    /// first acquisition.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                path: path.into(),
                state: Mutex::new(LockState::default()),
                released: Condvar::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// Re-acquiring from the thread that already holds it only bumps the depth.
    pub fn acquire(&self) -> Result<StoreLockGuard<'_>, StoreError> {
        let me = thread::current().id();
        let mut state = self.inner.state();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return Ok(self.guard());
                }
                None => break,
                Some(_) => {
                    state = self
                        .inner
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        // Claim in-process ownership first, then block on the OS lock without
        // holding the state mutex.
        state.owner = Some(me);
        state.depth = 1;
        drop(state);

        match self.lock_file() {
            Ok(file) => {
                self.inner.state().file = Some(file);
                Ok(self.guard())
            }
            Err(e) => {
                let mut state = self.inner.state();
                state.owner = None;
                state.depth = 0;
                drop(state);
                self.inner.released.notify_all();
                Err(e)
            }
        }
    }

    /// Whether the calling thread currently holds this lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.state().owner == Some(thread::current().id())
    }

    fn lock_file(&self) -> Result<File, StoreError> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::lock(path, e.to_string()))?;
        Ok(file)
    }

    fn guard(&self) -> StoreLockGuard<'_> {
        StoreLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn release(&self) {
        let mut state = self.inner.state();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }
        if let Some(file) = state.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!(path = %self.inner.path.display(), error = %e, "Failed to release file lock");
            }
        }
        state.owner = None;
        drop(state);
        self.inner.released.notify_all();
    }
}

/// RAII guard returned by [`StoreLock::acquire`]. Tied to the acquiring thread.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct StoreLockGuard<'a> {
    lock: &'a StoreLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for StoreLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
