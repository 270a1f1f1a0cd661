//! Serializes mutations of one mount point behind a reentrant lock.

use std::io::{self, Write};
use std::sync::Arc;

use crate::address::{MountPoint, NodeName};
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::FsResult;
use crate::exceptions::SyncExceptionBuilder;
use crate::lock::MountLock;
use crate::options::SyncOptions;
use crate::socket::{ReadStream, WriteStream};

/// Takes the read lock for lookups and reads, the write lock for everything
/// that changes state.
pub struct LockingController {
    inner: Arc<dyn Controller>,
    lock: Arc<MountLock>,
}

impl LockingController {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Controller>) -> Self {
        let lock = Arc::new(MountLock::new(inner.mount_point().to_string()));
        Self { inner, lock }
    }

    /// The lock guarding this mount point.
    pub fn lock(&self) -> &Arc<MountLock> {
        &self.lock
    }
}

/// Re-takes the write lock to commit.
struct LockedWriter {
    inner: Box<dyn WriteStream>,
    lock: Arc<MountLock>,
}

impl Write for LockedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteStream for LockedWriter {
    fn close(self: Box<Self>) -> FsResult<()> {
        let LockedWriter { inner, lock } = *self;
        let _guard = lock.write()?;
        inner.close()
    }
}

impl Controller for LockingController {
    fn mount_point(&self) -> &MountPoint {
        self.inner.mount_point()
    }

    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        let _guard = self.lock.read();
        self.inner.entry(name)
    }

    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
        let _guard = self.lock.read();
        self.inner.open_input(name)
    }

    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        let _guard = self.lock.write()?;
        let inner = self.inner.open_output(name, template)?;
        Ok(Box::new(LockedWriter {
            inner,
            lock: self.lock.clone(),
        }))
    }

    fn check_output(&self, name: &NodeName) -> FsResult<()> {
        self.inner.check_output(name)
    }

    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        let _guard = self.lock.write()?;
        self.inner.mknod(name, kind, template)
    }

    fn unlink(&self, name: &NodeName) -> FsResult<()> {
        let _guard = self.lock.write()?;
        self.inner.unlink(name)
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let _guard = self.lock.write()?;
        self.inner.sync(options, builder)
    }

    fn pending_resources(&self) -> usize {
        self.inner.pending_resources()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::MemoryController;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_write_commits_under_lock() {
        let leaf = Arc::new(MemoryController::new("file:/t/"));
        let locking = LockingController::new(leaf.clone());
        let name = NodeName::new("a.txt").unwrap();

        let mut out = locking.open_output(&name, None).unwrap();
        out.write_all(b"hello").unwrap();
        assert!(!locking.lock().is_write_held_by_current());
        out.close().unwrap();

        assert_eq!(leaf.content("a.txt").unwrap(), b"hello");
        assert_eq!(leaf.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mutation_while_reading_is_busy() {
        let leaf = Arc::new(MemoryController::new("file:/t/"));
        let locking = LockingController::new(leaf);
        let _read = locking.lock().read();
        let err = locking.unlink(&NodeName::new("a").unwrap()).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_lookups_proceed_while_another_thread_reads() {
        let leaf = Arc::new(MemoryController::new("file:/t/").with_file("a", b"x"));
        let locking = LockingController::new(leaf);
        let _held = locking.lock().read();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let name = NodeName::new("a").unwrap();
                    assert!(locking.entry(&name).unwrap().is_some());
                });
            }
        });
    }

    /// Leaf whose output streams pause inside `close` until released.
    struct GatedLeaf {
        inner: MemoryController,
        entered: Arc<Barrier>,
        resume: Arc<Barrier>,
    }

    struct GatedWriter {
        inner: Box<dyn WriteStream>,
        entered: Arc<Barrier>,
        resume: Arc<Barrier>,
    }

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl WriteStream for GatedWriter {
        fn close(self: Box<Self>) -> FsResult<()> {
            self.entered.wait();
            self.resume.wait();
            self.inner.close()
        }
    }

    impl Controller for GatedLeaf {
        fn mount_point(&self) -> &MountPoint {
            self.inner.mount_point()
        }

        fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
            self.inner.entry(name)
        }

        fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
            self.inner.open_input(name)
        }

        fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
            Ok(Box::new(GatedWriter {
                inner: self.inner.open_output(name, template)?,
                entered: self.entered.clone(),
                resume: self.resume.clone(),
            }))
        }

        fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
            self.inner.mknod(name, kind, template)
        }

        fn unlink(&self, name: &NodeName) -> FsResult<()> {
            self.inner.unlink(name)
        }

        fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
            self.inner.sync(options, builder)
        }
    }

    #[test]
    fn test_committing_output_excludes_foreign_mutations() {
        let entered = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        let leaf = Arc::new(GatedLeaf {
            inner: MemoryController::new("file:/t/"),
            entered: entered.clone(),
            resume: resume.clone(),
        });
        let locking = LockingController::new(leaf.clone());
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut out = locking.open_output(&NodeName::new("a").unwrap(), None).unwrap();
                out.write_all(b"first").unwrap();
                out.close().unwrap();
            });
            entered.wait();
            assert!(locking.lock().try_read().is_none());

            scope.spawn(|| {
                locking.mknod(&NodeName::new("b").unwrap(), EntryType::File, None).unwrap();
                done.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!done.load(Ordering::SeqCst));
            assert!(leaf.inner.content("b").is_none());
            resume.wait();
        });

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(leaf.inner.content("a").unwrap(), b"first");
        assert!(leaf.inner.content("b").is_some());
    }

    #[test]
    fn test_sync_reaches_leaf() {
        let leaf = Arc::new(MemoryController::new("file:/t/"));
        let locking = LockingController::new(leaf.clone());
        let mut builder = SyncExceptionBuilder::for_sync();
        locking.sync(SyncOptions::SYNC, &mut builder).unwrap();
        assert_eq!(leaf.syncs.load(Ordering::SeqCst), 1);
        assert!(builder.is_empty());
    }
}
