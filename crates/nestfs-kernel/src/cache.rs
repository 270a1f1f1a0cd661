//! Entry-level content cache.
//!
//! Each entry name maps to one [`CacheSlot`] holding at most one pooled
//! buffer. Readers are served from the buffer once it has been filled from
//! the backing input socket. Writers always fill a fresh buffer that replaces
//! the bound one on close, so readers opened earlier keep seeing the content
//! they started with.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::address::NodeName;
use crate::entry::Entry;
use crate::error::{FsError, FsResult};
use crate::pool::{BufferPool, BufferWriter, IoBuffer};
use crate::socket::{InputSocket, OutputSocket, ReadStream, ReaderStream, WriteStream};

/// When written content reaches the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// On close of every output stream.
    #[default]
    WriteThrough,
    /// On flush, usually during sync.
    WriteBack,
}

/// Cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Write strategy for archive mount points.
    pub strategy: CacheStrategy,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from an already filled buffer.
    pub hits: u64,
    /// Reads that had to fill a buffer from the backing store.
    pub misses: u64,
    /// Buffers copied to the backing store.
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    flushes: AtomicU64,
}

struct SlotState {
    input: InputSocket,
    output: OutputSocket,
    buffer: Option<IoBuffer>,
    dirty: bool,
    writing: bool,
    detached: bool,
}

/// Cache state of one entry name.
pub struct CacheSlot {
    name: NodeName,
    state: Mutex<SlotState>,
}

/// Handle on a configured [`CacheSlot`].
#[derive(Clone)]
pub struct CacheHandle {
    slot: Arc<CacheSlot>,
    pool: Arc<BufferPool>,
    strategy: CacheStrategy,
    counters: Arc<Counters>,
}

fn copy_to(output: &OutputSocket, buffer: &IoBuffer) -> FsResult<u64> {
    let mut sink = output.clone().stream()?;
    let mut source = buffer.input()?;
    let copied = io::copy(&mut source, &mut sink)?;
    sink.close()?;
    Ok(copied)
}

impl CacheHandle {
    /// The entry name this handle serves.
    pub fn name(&self) -> &NodeName {
        &self.slot.name
    }

    fn release_quietly(&self, buffer: &IoBuffer) {
        if let Err(e) = self.pool.release(buffer) {
            error!("entry_cache: failed to release buffer for {}: {}", self.slot.name, e);
        }
    }

    /// Opens a reader, filling the buffer from the backing store first if
    /// the slot holds none.
    pub fn open_input(&self) -> FsResult<Box<dyn ReadStream>> {
        let mut state = self.slot.state.lock();
        if let Some(buffer) = &state.buffer {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Box::new(ReaderStream::new(buffer.input()?)));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let buffer = self.pool.allocate()?;
        let filled = state.input.clone().stream().and_then(|mut source| {
            buffer.fill_from(&mut source)?;
            source.close()
        });
        if let Err(e) = filled {
            self.release_quietly(&buffer);
            return Err(e);
        }
        trace!("entry_cache: filled {} into buffer id={}", self.slot.name, buffer.id());
        let reader = buffer.input();
        if state.detached {
            self.release_quietly(&buffer);
        } else {
            state.buffer = Some(buffer);
            state.dirty = false;
        }
        Ok(Box::new(ReaderStream::new(reader?)))
    }

    /// Opens a writer into a fresh buffer. Only one writer per slot may be
    /// open at a time.
    pub fn open_output(&self, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        {
            let mut state = self.slot.state.lock();
            if state.writing {
                return Err(FsError::busy(&self.slot.name, "entry is already being written"));
            }
            state.writing = true;
        }
        let opened = self.pool.allocate().and_then(|buffer| match buffer.output() {
            Ok(writer) => Ok((buffer, writer)),
            Err(e) => {
                self.release_quietly(&buffer);
                Err(e)
            }
        });
        match opened {
            Ok((buffer, writer)) => Ok(Box::new(CacheWriter {
                handle: self.clone(),
                pending: Some((buffer, writer)),
                template: template.cloned(),
            })),
            Err(e) => {
                self.slot.state.lock().writing = false;
                Err(e)
            }
        }
    }

    fn abandon(&self, buffer: &IoBuffer) {
        self.slot.state.lock().writing = false;
        self.release_quietly(buffer);
    }

    fn commit(&self, buffer: IoBuffer, template: Option<Entry>) -> FsResult<()> {
        let mut state = self.slot.state.lock();
        state.writing = false;
        let output = state.output.clone().with_template(template);
        let write_now = self.strategy == CacheStrategy::WriteThrough || state.detached;
        if write_now {
            if let Err(e) = copy_to(&output, &buffer) {
                self.release_quietly(&buffer);
                return Err(e);
            }
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        }
        if state.detached {
            self.release_quietly(&buffer);
            return Ok(());
        }
        state.output = output;
        if let Some(old) = state.buffer.replace(buffer) {
            self.release_quietly(&old);
        }
        state.dirty = !write_now;
        debug!(
            "entry_cache: committed {} dirty={} strategy={:?}",
            self.slot.name, state.dirty, self.strategy
        );
        Ok(())
    }

    fn flush_locked(&self, state: &mut SlotState) -> FsResult<()> {
        if !state.dirty {
            return Ok(());
        }
        if let Some(buffer) = &state.buffer {
            copy_to(&state.output, buffer)?;
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        }
        state.dirty = false;
        Ok(())
    }

    fn clear_locked(&self, state: &mut SlotState) {
        if let Some(buffer) = state.buffer.take() {
            self.release_quietly(&buffer);
        }
        state.dirty = false;
    }

    /// Copies dirty content to the backing store.
    pub fn flush(&self) -> FsResult<()> {
        self.flush_locked(&mut self.slot.state.lock())
    }

    /// Drops the cached content, dirty or not.
    pub fn clear(&self) {
        self.clear_locked(&mut self.slot.state.lock());
    }

    /// Flushes, clears and detaches the slot. A detached slot never binds a
    /// buffer again.
    pub fn release(&self) -> FsResult<()> {
        let mut state = self.slot.state.lock();
        self.flush_locked(&mut state)?;
        self.clear_locked(&mut state);
        state.detached = true;
        Ok(())
    }

    /// The dirty entry as it will look once flushed.
    pub fn dirty_entry(&self) -> FsResult<Option<Entry>> {
        let state = self.slot.state.lock();
        match (&state.buffer, state.dirty) {
            (Some(buffer), true) => {
                let mut entry = state.output.target()?;
                let len = buffer.len()?;
                entry.data_size = Some(len);
                entry.storage_size = Some(len);
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }
}

/// Output stream of a cache slot.
struct CacheWriter {
    handle: CacheHandle,
    pending: Option<(IoBuffer, BufferWriter)>,
    template: Option<Entry>,
}

impl io::Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.pending {
            Some((_, writer)) => writer.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "cache writer closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.pending {
            Some((_, writer)) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl WriteStream for CacheWriter {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        let Some((buffer, writer)) = self.pending.take() else {
            return Ok(());
        };
        if let Err(e) = writer.finish() {
            self.handle.abandon(&buffer);
            return Err(e);
        }
        self.handle.commit(buffer, self.template.take())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let Some((buffer, _writer)) = self.pending.take() {
            trace!("entry_cache: discarding unclosed write to {}", self.handle.name());
            self.handle.abandon(&buffer);
        }
    }
}

/// Cache of entry content for one mount point.
pub struct EntryCache {
    pool: Arc<BufferPool>,
    strategy: CacheStrategy,
    slots: DashMap<NodeName, Arc<CacheSlot>>,
    counters: Arc<Counters>,
}

impl EntryCache {
    /// Creates an empty cache.
    pub fn new(pool: Arc<BufferPool>, strategy: CacheStrategy) -> Self {
        Self {
            pool,
            strategy,
            slots: DashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    fn handle(&self, slot: Arc<CacheSlot>) -> CacheHandle {
        CacheHandle {
            slot,
            pool: self.pool.clone(),
            strategy: self.strategy,
            counters: self.counters.clone(),
        }
    }

    /// Binds the slot for `input`'s name to the given sockets, creating it
    /// if needed. An existing slot keeps its buffer, and keeps its template
    /// unless `output` brings a new one.
    pub fn configure(&self, input: InputSocket, output: OutputSocket) -> CacheHandle {
        let name = input.name().clone();
        let slot = match self.slots.entry(name.clone()) {
            MapEntry::Occupied(occupied) => {
                let slot = occupied.get().clone();
                drop(occupied);
                let mut state = slot.state.lock();
                state.input = input;
                state.output = match output.template() {
                    Some(_) => output,
                    None => {
                        let kept = state.output.template().cloned();
                        output.with_template(kept)
                    }
                };
                drop(state);
                slot
            }
            MapEntry::Vacant(vacant) => vacant
                .insert(Arc::new(CacheSlot {
                    name,
                    state: Mutex::new(SlotState {
                        input,
                        output,
                        buffer: None,
                        dirty: false,
                        writing: false,
                        detached: false,
                    }),
                }))
                .clone(),
        };
        self.handle(slot)
    }

    /// The handle for `name`, if a slot exists.
    pub fn get(&self, name: &NodeName) -> Option<CacheHandle> {
        self.slots.get(name).map(|slot| self.handle(slot.clone()))
    }

    fn handles(&self) -> Vec<CacheHandle> {
        self.slots.iter().map(|slot| self.handle(slot.value().clone())).collect()
    }

    /// Flushes every dirty slot, returning the errors of those that failed.
    pub fn flush(&self) -> Vec<FsError> {
        self.handles().iter().filter_map(|h| h.flush().err()).collect()
    }

    /// Drops all cached content without writing it.
    pub fn clear(&self) {
        for handle in self.handles() {
            handle.clear();
        }
    }

    /// Flushes and releases every slot. Slots that fail to flush are kept.
    pub fn release(&self) -> Vec<FsError> {
        let mut errors = Vec::new();
        for handle in self.handles() {
            match handle.release() {
                Ok(()) => {
                    self.slots.remove(handle.name());
                }
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Flushes and releases the slot for `name`, if any.
    pub fn release_name(&self, name: &NodeName) -> FsResult<()> {
        if let Some(handle) = self.get(name) {
            handle.release()?;
            self.slots.remove(name);
        }
        Ok(())
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no slot exists.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots holding unflushed content.
    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.lock().dirty).count()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EntryCache {
    fn drop(&mut self) {
        // Buffers must go back to the pool even when nobody synced.
        for handle in self.handles() {
            handle.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::MemoryController;
    use crate::controller::Controller;
    use crate::entry::Access;
    use crate::pool::PoolConfig;
    use std::io::{Read, Write};
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::{Duration, SystemTime};

    fn setup(strategy: CacheStrategy) -> (Arc<MemoryController>, Arc<BufferPool>, EntryCache) {
        let leaf = Arc::new(MemoryController::new("file:/t/").with_file("a", b"original"));
        let pool = Arc::new(BufferPool::new(PoolConfig::memory()));
        let cache = EntryCache::new(pool.clone(), strategy);
        (leaf, pool, cache)
    }

    fn sockets(leaf: &Arc<MemoryController>, name: &str) -> (InputSocket, OutputSocket) {
        let controller: Arc<dyn Controller> = leaf.clone();
        let name = NodeName::new(name).unwrap();
        (
            InputSocket::new(controller.clone(), name.clone()),
            OutputSocket::new(controller, name, None),
        )
    }

    fn read(handle: &CacheHandle) -> Vec<u8> {
        let mut stream = handle.open_input().unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).unwrap();
        stream.close().unwrap();
        data
    }

    fn write(handle: &CacheHandle, data: &[u8]) {
        let mut stream = handle.open_output(None).unwrap();
        stream.write_all(data).unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn test_second_read_is_a_hit() {
        let (leaf, _pool, cache) = setup(CacheStrategy::WriteThrough);
        let (i, o) = sockets(&leaf, "a");
        let handle = cache.configure(i, o);
        assert_eq!(read(&handle), b"original");
        assert_eq!(read(&handle), b"original");
        assert_eq!(leaf.reads.load(AtomicOrdering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_configure_reuses_slot() {
        let (leaf, pool, cache) = setup(CacheStrategy::WriteThrough);
        let (i, o) = sockets(&leaf, "a");
        read(&cache.configure(i, o));
        let (i, o) = sockets(&leaf, "a");
        read(&cache.configure(i, o));
        assert_eq!(cache.len(), 1);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_write_through_reaches_backing_on_close() {
        let (leaf, pool, cache) = setup(CacheStrategy::WriteThrough);
        let (i, o) = sockets(&leaf, "a");
        let handle = cache.configure(i, o);
        read(&handle);
        write(&handle, b"updated");
        assert_eq!(leaf.content("a").unwrap(), b"updated");
        assert_eq!(read(&handle), b"updated");
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_reader_keeps_old_content_across_write() {
        let (leaf, _pool, cache) = setup(CacheStrategy::WriteThrough);
        let (i, o) = sockets(&leaf, "a");
        let handle = cache.configure(i, o);
        let mut early = handle.open_input().unwrap();
        write(&handle, b"replacement");
        let mut data = Vec::new();
        early.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"original");
    }

    #[test]
    fn test_write_back_defers_until_flush() {
        let (leaf, _pool, cache) = setup(CacheStrategy::WriteBack);
        let (i, o) = sockets(&leaf, "b");
        let handle = cache.configure(i, o);
        write(&handle, b"deferred");
        assert!(leaf.content("b").is_none());
        assert_eq!(handle.dirty_entry().unwrap().unwrap().data_size, Some(8));
        assert_eq!(read(&handle), b"deferred");

        assert!(cache.flush().is_empty());
        assert_eq!(leaf.content("b").unwrap(), b"deferred");
        assert!(handle.dirty_entry().unwrap().is_none());
    }

    #[test]
    fn test_reconfigure_for_reading_keeps_pending_template() {
        let (leaf, _pool, cache) = setup(CacheStrategy::WriteBack);
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut template = Entry::file("b");
        template.set_time(Access::Write, stamp);

        let (i, o) = sockets(&leaf, "b");
        let handle = cache.configure(i, o.with_template(Some(template.clone())));
        let mut stream = handle.open_output(Some(&template)).unwrap();
        stream.write_all(b"stamped").unwrap();
        stream.close().unwrap();

        let (i, o) = sockets(&leaf, "b");
        assert_eq!(read(&cache.configure(i, o)), b"stamped");
        let pending = handle.dirty_entry().unwrap().unwrap();
        assert_eq!(pending.time(Access::Write), Some(stamp));
    }

    #[test]
    fn test_clear_discards_dirty_content() {
        let (leaf, pool, cache) = setup(CacheStrategy::WriteBack);
        let (i, o) = sockets(&leaf, "a");
        let handle = cache.configure(i, o);
        write(&handle, b"lost");
        cache.clear();
        assert_eq!(leaf.content("a").unwrap(), b"original");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_release_flushes_and_empties() {
        let (leaf, pool, cache) = setup(CacheStrategy::WriteBack);
        let (i, o) = sockets(&leaf, "a");
        write(&cache.configure(i, o), b"kept");
        assert!(cache.release().is_empty());
        assert!(cache.is_empty());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(leaf.content("a").unwrap(), b"kept");
    }

    #[test]
    fn test_second_writer_is_busy() {
        let (leaf, _pool, cache) = setup(CacheStrategy::WriteThrough);
        let (i, o) = sockets(&leaf, "a");
        let handle = cache.configure(i, o);
        let first = handle.open_output(None).unwrap();
        let err = handle.open_output(None).err().unwrap();
        assert!(err.is_transient());
        drop(first);
        assert!(handle.open_output(None).is_ok());
    }

    #[test]
    fn test_dropped_writer_discards() {
        let (leaf, pool, cache) = setup(CacheStrategy::WriteThrough);
        let (i, o) = sockets(&leaf, "a");
        let handle = cache.configure(i, o);
        {
            let mut w = handle.open_output(None).unwrap();
            w.write_all(b"never").unwrap();
        }
        assert_eq!(leaf.content("a").unwrap(), b"original");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_readers_share_one_buffer() {
        let (leaf, pool, cache) = setup(CacheStrategy::WriteThrough);
        let cache = Arc::new(cache);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let leaf = leaf.clone();
                std::thread::spawn(move || {
                    let (i, o) = sockets(&leaf, "a");
                    read(&cache.configure(i, o))
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), b"original");
        }
        assert_eq!(pool.stats().allocations, 1);
        assert_eq!(leaf.reads.load(AtomicOrdering::SeqCst), 1);
    }
}
