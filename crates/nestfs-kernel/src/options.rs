//! Flags attached to one sync invocation.

use bitflags::bitflags;

bitflags! {
    /// Independent flags controlling one sync invocation. Never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SyncOptions: u8 {
        /// Forcibly close streams that are still open, reporting a warning.
        const FORCE_CLOSE_IO = 0b0001;
        /// Block until streams opened by other threads are closed.
        const WAIT_CLOSE_IO = 0b0010;
        /// Release cached buffers and unmount the controller chain.
        const CLEAR_CACHE = 0b0100;
        /// Discard pending changes instead of committing them.
        const ABORT_CHANGES = 0b1000;
    }
}

impl SyncOptions {
    /// Commit everything and unmount, closing whatever is still open.
    pub const UMOUNT: SyncOptions = SyncOptions::FORCE_CLOSE_IO.union(SyncOptions::CLEAR_CACHE);

    /// Commit everything, waiting for other threads to finish their I/O.
    pub const SYNC: SyncOptions = SyncOptions::WAIT_CLOSE_IO;

    /// Throw away pending changes and unmount.
    pub const RESET: SyncOptions = SyncOptions::ABORT_CHANGES
        .union(SyncOptions::FORCE_CLOSE_IO)
        .union(SyncOptions::CLEAR_CACHE);

    /// Options suitable for syncing an ancestor on behalf of a descendant.
    ///
    /// Only `WAIT_CLOSE_IO` survives: ancestors keep their caches, never
    /// abort, and never lose unrelated streams because a nested archive was
    /// committed.
    pub fn for_ancestor(self) -> SyncOptions {
        self & SyncOptions::WAIT_CLOSE_IO
    }
}
