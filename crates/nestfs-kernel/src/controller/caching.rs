//! Puts an [`EntryCache`] in front of a leaf controller.

use std::sync::Arc;

use tracing::debug;

use crate::address::{MountPoint, NodeName};
use crate::cache::{CacheHandle, CacheStats, CacheStrategy, EntryCache};
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::FsResult;
use crate::exceptions::{SyncExceptionBuilder, SyncIssue};
use crate::options::SyncOptions;
use crate::pool::BufferPool;
use crate::socket::{InputSocket, OutputSocket, ReadStream, WriteStream};

/// Serves entry content from pooled buffers and writes it back according to
/// the cache strategy.
pub struct CachingController {
    inner: Arc<dyn Controller>,
    cache: EntryCache,
}

impl CachingController {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Controller>, pool: Arc<BufferPool>, strategy: CacheStrategy) -> Self {
        Self {
            inner,
            cache: EntryCache::new(pool, strategy),
        }
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn configure(&self, name: &NodeName, template: Option<&Entry>) -> CacheHandle {
        self.cache.configure(
            InputSocket::new(self.inner.clone(), name.clone()),
            OutputSocket::new(self.inner.clone(), name.clone(), template.cloned()),
        )
    }
}

impl Controller for CachingController {
    fn mount_point(&self) -> &MountPoint {
        self.inner.mount_point()
    }

    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        if let Some(handle) = self.cache.get(name) {
            if let Some(entry) = handle.dirty_entry()? {
                return Ok(Some(entry));
            }
        }
        self.inner.entry(name)
    }

    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
        self.configure(name, None).open_input()
    }

    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        // Buffered writes reach the leaf late; reject them up front.
        self.inner.check_output(name)?;
        self.configure(name, template).open_output(template)
    }

    fn check_output(&self, name: &NodeName) -> FsResult<()> {
        self.inner.check_output(name)
    }

    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.cache.release_name(name)?;
        self.inner.mknod(name, kind, template)
    }

    fn unlink(&self, name: &NodeName) -> FsResult<()> {
        self.cache.release_name(name)?;
        self.inner.unlink(name)
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let mp = self.mount_point().clone();
        if options.contains(SyncOptions::ABORT_CHANGES) {
            debug!("caching: {} discarding {} dirty entries", mp, self.cache.dirty_count());
            self.cache.clear();
        } else {
            for e in self.cache.flush() {
                builder.fail(SyncIssue::failure(mp.clone(), e));
            }
        }
        self.inner.sync(options, builder)?;
        if options.contains(SyncOptions::CLEAR_CACHE) {
            for e in self.cache.release() {
                builder.fail(SyncIssue::failure(mp.clone(), e));
            }
        }
        Ok(())
    }

    fn pending_resources(&self) -> usize {
        self.cache.len() + self.inner.pending_resources()
    }
}
