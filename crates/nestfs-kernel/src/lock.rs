//! Reentrant read/write lock guarding one mount point.
//!
//! The thread holding the write lock may re-enter for reading or writing.
//! Readers may re-enter for reading. A reader asking for the write lock
//! would deadlock against itself, so the request fails with
//! [`FsError::Busy`] instead. While a writer waits, threads that hold no
//! read lock yet are held back so a stream of readers cannot starve it.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{FsError, FsResult};

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    writers_waiting: usize,
    readers: HashMap<ThreadId, usize>,
}

impl LockState {
    fn may_read(&self, me: ThreadId) -> bool {
        match self.writer {
            None => self.writers_waiting == 0 || self.readers.contains_key(&me),
            Some(owner) => owner == me,
        }
    }

    fn add_reader(&mut self, me: ThreadId) {
        *self.readers.entry(me).or_insert(0) += 1;
    }
}

/// Outcome of one attempt at the write lock.
enum WriteAttempt {
    Acquired,
    Upgrade,
    Blocked,
}

/// Reentrant read/write lock keyed by thread identity.
#[derive(Debug)]
pub struct MountLock {
    name: String,
    state: Mutex<LockState>,
    released: Condvar,
}

impl MountLock {
    /// Creates an unlocked lock; `name` appears in error messages.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Blocks until the calling thread holds a read lock.
    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.may_read(me) {
            self.released.wait(&mut state);
        }
        state.add_reader(me);
        ReadGuard { lock: self, owner: me }
    }

    /// Takes a read lock only if that does not block.
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if !state.may_read(me) {
            return None;
        }
        state.add_reader(me);
        Some(ReadGuard { lock: self, owner: me })
    }

    fn attempt_write(&self, state: &mut LockState, me: ThreadId) -> WriteAttempt {
        if state.writer == Some(me) {
            state.write_holds += 1;
            return WriteAttempt::Acquired;
        }
        if state.writer.is_none() && state.readers.contains_key(&me) {
            return WriteAttempt::Upgrade;
        }
        if state.writer.is_none() && state.readers.is_empty() {
            state.writer = Some(me);
            state.write_holds = 1;
            return WriteAttempt::Acquired;
        }
        WriteAttempt::Blocked
    }

    fn upgrade_error(&self) -> FsError {
        FsError::busy(&self.name, "read lock held by this thread cannot be upgraded")
    }

    /// Blocks until the calling thread holds the write lock.
    ///
    /// Fails without blocking if the calling thread holds only a read lock.
    pub fn write(&self) -> FsResult<WriteGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match self.attempt_write(&mut state, me) {
                WriteAttempt::Acquired => return Ok(WriteGuard { lock: self }),
                WriteAttempt::Upgrade => return Err(self.upgrade_error()),
                WriteAttempt::Blocked => {
                    trace!("mount_lock: {} waiting for write lock", self.name);
                    state.writers_waiting += 1;
                    self.released.wait(&mut state);
                    state.writers_waiting -= 1;
                }
            }
        }
    }

    /// Takes the write lock only if that does not block.
    pub fn try_write(&self) -> FsResult<Option<WriteGuard<'_>>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match self.attempt_write(&mut state, me) {
            WriteAttempt::Acquired => Ok(Some(WriteGuard { lock: self })),
            WriteAttempt::Upgrade => Err(self.upgrade_error()),
            WriteAttempt::Blocked => Ok(None),
        }
    }

    /// Returns true if the calling thread holds the write lock.
    pub fn is_write_held_by_current(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Number of threads blocked in [`MountLock::write`].
    pub fn writers_waiting(&self) -> usize {
        self.state.lock().writers_waiting
    }

    /// Number of read holds across all threads.
    pub fn read_holds(&self) -> usize {
        self.state.lock().readers.values().sum()
    }
}

/// Shared hold on a [`MountLock`].
pub struct ReadGuard<'a> {
    lock: &'a MountLock,
    owner: ThreadId,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        if let Some(count) = state.readers.get_mut(&self.owner) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&self.owner);
            }
        }
        self.lock.released.notify_all();
    }
}

/// Exclusive hold on a [`MountLock`].
pub struct WriteGuard<'a> {
    lock: &'a MountLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.write_holds = state.write_holds.saturating_sub(1);
        if state.write_holds == 0 {
            state.writer = None;
        }
        self.lock.released.notify_all();
    }
}
