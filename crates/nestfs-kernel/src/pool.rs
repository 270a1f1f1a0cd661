//! Pooled temporary storage for entry content.
//!
//! Buffers are written once and then read any number of times. Each
//! [`IoBuffer::input`] call returns an independent reader, so releasing a
//! buffer never invalidates readers that are already open. Temp-file readers
//! share the file with later rewrites; callers that replace content while
//! readers may exist write a fresh buffer instead.

use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::error::{FsError, FsResult};

/// Where pooled buffers keep their bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolBacking {
    /// Heap memory; suited to small content and tests.
    Memory,
    /// Anonymous temporary files.
    #[default]
    TempFile,
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PoolConfig {
    /// Backing storage for new buffers (default temp files).
    pub backing: PoolBacking,
    /// Directory for temp files; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    /// Maximum number of buffers allocated at once; unbounded when unset.
    pub max_buffers: Option<usize>,
}

impl PoolConfig {
    /// An unbounded in-memory pool.
    pub fn memory() -> Self {
        Self {
            backing: PoolBacking::Memory,
            ..Self::default()
        }
    }
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Buffers handed out.
    pub allocations: u64,
    /// Buffers handed back.
    pub releases: u64,
    /// Release calls rejected because the buffer was already released.
    pub double_releases: u64,
    /// Buffers currently owned by callers.
    pub outstanding: usize,
}

#[derive(Debug)]
enum Store {
    Memory(Arc<Vec<u8>>),
    TempFile(NamedTempFile),
}

#[derive(Debug)]
struct BufferInner {
    id: u64,
    released: AtomicBool,
    store: Mutex<Option<Store>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            warn!("buffer_pool: buffer id={} dropped without release", self.id);
        }
    }
}

/// One unit of pooled temporary storage.
///
/// Clones share the same storage. The owner must hand it back with
/// [`BufferPool::release`] exactly once.
#[derive(Debug, Clone)]
pub struct IoBuffer {
    inner: Arc<BufferInner>,
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl IoBuffer {
    /// Pool-unique identifier of this buffer.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns true once the buffer was handed back to its pool.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Current content length in bytes.
    pub fn len(&self) -> FsResult<u64> {
        let store = self.inner.store.lock();
        match store.as_ref() {
            None => Err(FsError::BufferReleased { id: self.id() }),
            Some(Store::Memory(data)) => Ok(data.len() as u64),
            Some(Store::TempFile(file)) => Ok(file.as_file().metadata()?.len()),
        }
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> FsResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Opens an independent reader positioned at the start of the content.
    pub fn input(&self) -> FsResult<Box<dyn Read + Send>> {
        let store = self.inner.store.lock();
        match store.as_ref() {
            None => Err(FsError::BufferReleased { id: self.id() }),
            Some(Store::Memory(data)) => Ok(Box::new(Cursor::new(SharedBytes(data.clone())))),
            Some(Store::TempFile(file)) => Ok(Box::new(file.reopen()?)),
        }
    }

    /// Opens a writer that replaces the content once finished.
    pub fn output(&self) -> FsResult<BufferWriter> {
        let store = self.inner.store.lock();
        let sink = match store.as_ref() {
            None => return Err(FsError::BufferReleased { id: self.id() }),
            Some(Store::Memory(_)) => Sink::Memory(Vec::new()),
            Some(Store::TempFile(file)) => {
                let handle = file.reopen()?;
                handle.set_len(0)?;
                Sink::File(handle)
            }
        };
        Ok(BufferWriter {
            target: self.clone(),
            sink,
            written: 0,
        })
    }

    /// Replaces the content with everything `source` yields.
    pub fn fill_from(&self, source: &mut dyn Read) -> FsResult<u64> {
        let mut writer = self.output()?;
        io::copy(source, &mut writer)?;
        writer.finish()
    }
}

enum Sink {
    Memory(Vec<u8>),
    File(std::fs::File),
}

/// Writes new content into an [`IoBuffer`].
pub struct BufferWriter {
    target: IoBuffer,
    sink: Sink,
    written: u64,
}

impl BufferWriter {
    /// Commits the written bytes and returns their count.
    pub fn finish(self) -> FsResult<u64> {
        match self.sink {
            Sink::Memory(bytes) => {
                let mut store = self.target.inner.store.lock();
                match store.as_mut() {
                    Some(Store::Memory(data)) => *data = Arc::new(bytes),
                    _ => return Err(FsError::BufferReleased { id: self.target.id() }),
                }
            }
            Sink::File(mut file) => file.flush()?,
        }
        Ok(self.written)
    }
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.sink {
            Sink::Memory(bytes) => {
                bytes.extend_from_slice(buf);
                buf.len()
            }
            Sink::File(file) => file.write(buf)?,
        };
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Memory(_) => Ok(()),
            Sink::File(file) => file.flush(),
        }
    }
}

/// Process-wide pool of temporary buffers.
///
/// Allocation and release only touch atomics and a sharded ownership table,
/// so unrelated mount points never serialize on one pool lock.
#[derive(Debug)]
pub struct BufferPool {
    config: PoolConfig,
    next_id: AtomicU64,
    in_use: AtomicUsize,
    owned: DashMap<u64, ()>,
    allocations: AtomicU64,
    releases: AtomicU64,
    double_releases: AtomicU64,
}

impl BufferPool {
    /// Creates a new pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        debug!(
            backing = ?config.backing,
            max_buffers = ?config.max_buffers,
            "created buffer pool"
        );
        Self {
            config,
            next_id: AtomicU64::new(1),
            in_use: AtomicUsize::new(0),
            owned: DashMap::new(),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn reserve(&self) -> FsResult<()> {
        let previous = self.in_use.fetch_add(1, Ordering::AcqRel);
        if let Some(max) = self.config.max_buffers {
            if previous >= max {
                self.in_use.fetch_sub(1, Ordering::AcqRel);
                return Err(FsError::PoolExhausted {
                    reason: format!("all {} buffers are in use", max),
                });
            }
        }
        Ok(())
    }

    fn create_store(&self) -> FsResult<Store> {
        match self.config.backing {
            PoolBacking::Memory => Ok(Store::Memory(Arc::new(Vec::new()))),
            PoolBacking::TempFile => {
                let file = match &self.config.temp_dir {
                    Some(dir) => NamedTempFile::new_in(dir),
                    None => NamedTempFile::new(),
                };
                file.map(Store::TempFile).map_err(|e| FsError::PoolExhausted {
                    reason: format!("cannot create temp file: {}", e),
                })
            }
        }
    }

    /// Hands out a buffer no one else owns.
    pub fn allocate(&self) -> FsResult<IoBuffer> {
        self.reserve()?;
        let store = match self.create_store() {
            Ok(store) => store,
            Err(e) => {
                self.in_use.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.owned.insert(id, ());
        self.allocations.fetch_add(1, Ordering::Relaxed);
        debug!("buffer_pool: allocated buffer id={}", id);
        Ok(IoBuffer {
            inner: Arc::new(BufferInner {
                id,
                released: AtomicBool::new(false),
                store: Mutex::new(Some(store)),
            }),
        })
    }

    /// Takes a buffer back and frees its storage.
    ///
    /// Releasing the same buffer twice returns [`FsError::DoubleRelease`].
    pub fn release(&self, buffer: &IoBuffer) -> FsResult<()> {
        let id = buffer.id();
        if buffer.inner.released.swap(true, Ordering::AcqRel) {
            self.double_releases.fetch_add(1, Ordering::Relaxed);
            error!("buffer_pool: buffer id={} released twice", id);
            return Err(FsError::DoubleRelease { id });
        }
        if self.owned.remove(&id).is_none() {
            warn!("buffer_pool: released buffer id={} not owned by this pool", id);
        }
        drop(buffer.inner.store.lock().take());
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.releases.fetch_add(1, Ordering::Relaxed);
        debug!("buffer_pool: released buffer id={}", id);
        Ok(())
    }

    /// Number of buffers currently owned by callers.
    pub fn outstanding(&self) -> usize {
        self.owned.len()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            double_releases: self.double_releases.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
