//! Coordinates sync between a mount point, its mounted descendants and its
//! ancestors.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::address::{MountPoint, NodeName, NodePath};
use crate::controller::Controller;
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::exceptions::{SyncExceptionBuilder, SyncIssue};
use crate::options::SyncOptions;
use crate::socket::{ReadStream, WriteStream};

/// The registry of controller chains as seen from inside a chain.
pub trait Federation: Send + Sync {
    /// The core controller of `mount_point`, creating its chain if needed.
    fn core_of(&self, mount_point: &MountPoint) -> FsResult<Arc<dyn Controller>>;

    /// The mount point whose parent entry is `path`, if one is registered.
    fn mounted_child(&self, path: &NodePath) -> Option<MountPoint>;

    /// Syncs every registered mount point at or below `root`, deepest
    /// first, recording failures in `builder`.
    fn sync_subtree(&self, root: &MountPoint, options: SyncOptions, builder: &mut SyncExceptionBuilder);
}

/// Outermost decorator of a chain.
///
/// Before an entry that backs a mounted archive is read, replaced or
/// removed, the archive is synced so the parent sees its latest content.
pub struct FederatingController {
    inner: Arc<dyn Controller>,
    federation: Weak<dyn Federation>,
}

impl FederatingController {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Controller>, federation: Weak<dyn Federation>) -> Self {
        Self { inner, federation }
    }

    fn federation(&self) -> FsResult<Arc<dyn Federation>> {
        self.federation.upgrade().ok_or_else(|| FsError::Detached {
            mount_point: self.mount_point().to_string(),
        })
    }

    /// Syncs the archive mounted on `name`, if any.
    fn settle_child(&self, name: &NodeName, options: SyncOptions) -> FsResult<()> {
        let federation = self.federation()?;
        let path = self.mount_point().resolve(name)?;
        if let Some(child) = federation.mounted_child(&path) {
            debug!("federating: settling {} before access to {} with {:?}", child, path, options);
            let mut builder = SyncExceptionBuilder::for_sync();
            federation.sync_subtree(&child, options, &mut builder);
            builder.check()?;
        }
        Ok(())
    }
}

impl Controller for FederatingController {
    fn mount_point(&self) -> &MountPoint {
        self.inner.mount_point()
    }

    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        self.inner.entry(name)
    }

    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
        self.settle_child(name, SyncOptions::empty())?;
        self.inner.open_input(name)
    }

    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        self.settle_child(name, SyncOptions::RESET)?;
        self.inner.open_output(name, template)
    }

    fn check_output(&self, name: &NodeName) -> FsResult<()> {
        self.inner.check_output(name)
    }

    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.inner.mknod(name, kind, template)
    }

    fn unlink(&self, name: &NodeName) -> FsResult<()> {
        self.settle_child(name, SyncOptions::RESET)?;
        self.inner.unlink(name)
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let federation = self.federation()?;
        federation.sync_subtree(self.mount_point(), options, builder);

        let ancestor_options = options.for_ancestor();
        let mut next = self.mount_point().parent_mount_point().cloned();
        while let Some(ancestor) = next {
            let synced = federation
                .core_of(&ancestor)
                .and_then(|core| core.sync(ancestor_options, builder));
            if let Err(e) = synced {
                warn!("federating: ancestor {} failed to sync: {}", ancestor, e);
                builder.fail(SyncIssue::failure(ancestor.clone(), e));
            }
            next = ancestor.parent_mount_point().cloned();
        }
        Ok(())
    }

    fn pending_resources(&self) -> usize {
        self.inner.pending_resources()
    }
}
