//! Tracks open streams per mount point so that sync can wait for them or
//! close them.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::address::{MountPoint, NodeName};
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::exceptions::{SyncExceptionBuilder, SyncIssue};
use crate::options::SyncOptions;
use crate::socket::{ReadStream, WriteStream};

trait ForceClose: Send + Sync {
    fn force_close(&self) -> FsResult<()>;
}

/// Shared slot for a stream that may be closed by another thread.
struct StreamCell<S: ?Sized> {
    stream: Mutex<Option<Box<S>>>,
}

impl<S: ?Sized> StreamCell<S> {
    fn new(stream: Box<S>) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(stream)),
        })
    }

    fn take(&self) -> Option<Box<S>> {
        self.stream.lock().take()
    }
}

impl ForceClose for StreamCell<dyn ReadStream> {
    fn force_close(&self) -> FsResult<()> {
        match self.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        }
    }
}

impl ForceClose for StreamCell<dyn WriteStream> {
    fn force_close(&self) -> FsResult<()> {
        match self.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        }
    }
}

struct Tracked {
    thread: ThreadId,
    closer: Arc<dyn ForceClose>,
}

#[derive(Default)]
struct Ledger {
    next_id: u64,
    streams: HashMap<u64, Tracked>,
}

/// Registry of the streams open on one mount point.
struct Accountant {
    ledger: Mutex<Ledger>,
    closed: Condvar,
}

impl Accountant {
    fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            closed: Condvar::new(),
        }
    }

    fn start(&self, closer: Arc<dyn ForceClose>) -> u64 {
        let mut ledger = self.ledger.lock();
        ledger.next_id += 1;
        let id = ledger.next_id;
        ledger.streams.insert(
            id,
            Tracked {
                thread: thread::current().id(),
                closer,
            },
        );
        id
    }

    fn stop(&self, id: u64) {
        let mut ledger = self.ledger.lock();
        if ledger.streams.remove(&id).is_some() {
            self.closed.notify_all();
        }
    }

    fn open_streams(&self) -> usize {
        self.ledger.lock().streams.len()
    }

    /// Blocks until no other thread has a stream open here.
    fn await_foreign(&self) {
        let me = thread::current().id();
        let mut ledger = self.ledger.lock();
        while ledger.streams.values().any(|t| t.thread != me) {
            self.closed.wait(&mut ledger);
        }
    }

    /// Closes every open stream, returning the errors of those that failed.
    fn close_all(&self) -> Vec<FsError> {
        let open: Vec<(u64, Arc<dyn ForceClose>)> = self
            .ledger
            .lock()
            .streams
            .iter()
            .map(|(id, t)| (*id, t.closer.clone()))
            .collect();
        let mut errors = Vec::new();
        for (id, closer) in open {
            if let Err(e) = closer.force_close() {
                errors.push(e);
            }
            self.stop(id);
        }
        errors
    }
}

fn closed_error(path: &str) -> io::Error {
    FsError::StreamClosed {
        path: path.to_string(),
    }
    .into()
}

struct AccountedReader {
    cell: Arc<StreamCell<dyn ReadStream>>,
    id: u64,
    accountant: Arc<Accountant>,
    path: String,
}

impl Read for AccountedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.cell.stream.lock().as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(closed_error(&self.path)),
        }
    }
}

impl ReadStream for AccountedReader {
    fn close(self: Box<Self>) -> FsResult<()> {
        let result = match self.cell.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        };
        self.accountant.stop(self.id);
        result
    }
}

impl Drop for AccountedReader {
    fn drop(&mut self) {
        drop(self.cell.take());
        self.accountant.stop(self.id);
    }
}

struct AccountedWriter {
    cell: Arc<StreamCell<dyn WriteStream>>,
    id: u64,
    accountant: Arc<Accountant>,
    path: String,
}

impl Write for AccountedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.cell.stream.lock().as_mut() {
            Some(stream) => stream.write(buf),
            None => Err(closed_error(&self.path)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.cell.stream.lock().as_mut() {
            Some(stream) => stream.flush(),
            None => Err(closed_error(&self.path)),
        }
    }
}

impl WriteStream for AccountedWriter {
    fn close(self: Box<Self>) -> FsResult<()> {
        let result = match self.cell.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        };
        self.accountant.stop(self.id);
        result
    }
}

impl Drop for AccountedWriter {
    fn drop(&mut self) {
        drop(self.cell.take());
        self.accountant.stop(self.id);
    }
}

/// Registers every stream it hands out and settles them on sync.
pub struct AccountingController {
    inner: Arc<dyn Controller>,
    accountant: Arc<Accountant>,
}

impl AccountingController {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Controller>) -> Self {
        Self {
            inner,
            accountant: Arc::new(Accountant::new()),
        }
    }

    /// Number of streams currently open through this controller.
    pub fn open_streams(&self) -> usize {
        self.accountant.open_streams()
    }

    fn path(&self, name: &NodeName) -> String {
        format!("{}{}", self.mount_point(), name)
    }
}

impl Controller for AccountingController {
    fn mount_point(&self) -> &MountPoint {
        self.inner.mount_point()
    }

    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        self.inner.entry(name)
    }

    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
        let stream = self.inner.open_input(name)?;
        let cell: Arc<StreamCell<dyn ReadStream>> = StreamCell::new(stream);
        let id = self.accountant.start(cell.clone());
        Ok(Box::new(AccountedReader {
            cell,
            id,
            accountant: self.accountant.clone(),
            path: self.path(name),
        }))
    }

    fn check_output(&self, name: &NodeName) -> FsResult<()> {
        self.inner.check_output(name)
    }

    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        let stream = self.inner.open_output(name, template)?;
        let cell: Arc<StreamCell<dyn WriteStream>> = StreamCell::new(stream);
        let id = self.accountant.start(cell.clone());
        Ok(Box::new(AccountedWriter {
            cell,
            id,
            accountant: self.accountant.clone(),
            path: self.path(name),
        }))
    }

    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.inner.mknod(name, kind, template)
    }

    fn unlink(&self, name: &NodeName) -> FsResult<()> {
        self.inner.unlink(name)
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        if options.contains(SyncOptions::WAIT_CLOSE_IO) {
            debug!("accounting: {} waiting for foreign streams", self.mount_point());
            self.accountant.await_foreign();
        }
        let open = self.accountant.open_streams();
        if open > 0 {
            if !options.contains(SyncOptions::FORCE_CLOSE_IO) {
                return Err(FsError::busy(
                    self.mount_point(),
                    format!("{} stream(s) still open", open),
                ));
            }
            warn!("accounting: {} force closing {} open stream(s)", self.mount_point(), open);
            let mp = self.mount_point().clone();
            builder.warn(SyncIssue::warning(
                mp.clone(),
                FsError::busy(&mp, format!("forced close of {} open stream(s)", open)),
            ));
            for e in self.accountant.close_all() {
                builder.warn(SyncIssue::warning(mp.clone(), e));
            }
        }
        self.inner.sync(options, builder)
    }

    fn pending_resources(&self) -> usize {
        self.accountant.open_streams() + self.inner.pending_resources()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::MemoryController;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryController>, Arc<AccountingController>) {
        let leaf = Arc::new(MemoryController::new("file:/t/").with_file("a", b"abc"));
        let accounting = Arc::new(AccountingController::new(leaf.clone()));
        (leaf, accounting)
    }

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    #[test]
    fn test_streams_are_counted() {
        let (_leaf, acc) = setup();
        let input = acc.open_input(&name("a")).unwrap();
        let output = acc.open_output(&name("b"), None).unwrap();
        assert_eq!(acc.open_streams(), 2);
        input.close().unwrap();
        drop(output);
        assert_eq!(acc.open_streams(), 0);
    }

    #[test]
    fn test_sync_with_open_stream_is_busy() {
        let (_leaf, acc) = setup();
        let _input = acc.open_input(&name("a")).unwrap();
        let mut builder = SyncExceptionBuilder::for_sync();
        let err = acc.sync(SyncOptions::empty(), &mut builder).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_force_close_commits_and_warns() {
        let (leaf, acc) = setup();
        let mut output = acc.open_output(&name("b"), None).unwrap();
        output.write_all(b"xyz").unwrap();

        let mut builder = SyncExceptionBuilder::for_sync();
        acc.sync(SyncOptions::FORCE_CLOSE_IO, &mut builder).unwrap();
        assert_eq!(builder.len(), 1);
        assert_eq!(leaf.content("b").unwrap(), b"xyz");

        let err = output.write(b"more").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        output.close().unwrap();
        assert_eq!(acc.open_streams(), 0);
    }

    #[test]
    fn test_wait_close_blocks_until_foreign_close() {
        let (_leaf, acc) = setup();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let acc = acc.clone();
            std::thread::spawn(move || {
                let mut input = acc.open_input(&name("a")).unwrap();
                tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                let mut buf = Vec::new();
                input.read_to_end(&mut buf).unwrap();
                input.close().unwrap();
                buf
            })
        };
        rx.recv().unwrap();
        let mut builder = SyncExceptionBuilder::for_sync();
        acc.sync(SyncOptions::WAIT_CLOSE_IO, &mut builder).unwrap();
        assert_eq!(acc.open_streams(), 0);
        assert!(builder.is_empty());
        assert_eq!(worker.join().unwrap(), b"abc");
    }
}
