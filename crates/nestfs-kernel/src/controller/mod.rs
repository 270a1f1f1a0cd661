//! Per-mount-point controllers and the chains they are stacked into.
//!
//! A chain is built bottom-up: a driver supplies the leaf controller and the
//! decorators listed in its [`ChainLayout`] are wrapped around it in order.
//! Operations always enter at the top of the chain. The part below the
//! federating decorator is the *core*; child mount points reach their parent
//! through the core so that a child never re-enters sync coordination.

mod accounting;
mod caching;
mod federating;
mod locking;

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::address::{MountPoint, NodeName};
use crate::cache::CacheStrategy;
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::exceptions::{SyncError, SyncExceptionBuilder, SyncIssue};
use crate::options::SyncOptions;
use crate::pool::BufferPool;
use crate::socket::{InputSocket, OutputSocket, ReadStream, WriteStream};

pub use accounting::AccountingController;
pub use caching::CachingController;
pub use federating::{Federation, FederatingController};
pub use locking::LockingController;

/// Operations of one file system level.
///
/// Every method takes a name relative to [`Controller::mount_point`].
pub trait Controller: Send + Sync {
    /// The mount point this controller serves.
    fn mount_point(&self) -> &MountPoint;

    /// Looks up an entry; `Ok(None)` if it does not exist.
    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>>;

    /// Opens the content of a file entry for reading.
    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>>;

    /// Opens a stream replacing the content of a file entry, creating it if
    /// needed. Timestamps set in `template` are carried over.
    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>>;

    /// Fails if [`Controller::open_output`] for `name` would be rejected.
    ///
    /// Decorators that accept writes before reaching this level call it so
    /// that a rejected write fails when it is opened.
    fn check_output(&self, _name: &NodeName) -> FsResult<()> {
        Ok(())
    }

    /// Creates an entry of the given type.
    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()>;

    /// Removes an entry. Directories must be empty.
    fn unlink(&self, name: &NodeName) -> FsResult<()>;

    /// Commits or discards pending state according to `options`.
    ///
    /// Recoverable problems are recorded in `builder`. An `Err` means the
    /// mount point could not be synced at all.
    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()>;

    /// Streams, buffers and other resources that keep this level busy.
    ///
    /// A chain is only evicted from its manager while this returns zero.
    fn pending_resources(&self) -> usize {
        0
    }
}

/// A decorator that can be stacked onto a leaf controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Entry-level content cache.
    Caching,
    /// Reentrant read/write lock per mount point.
    Locking,
    /// Open stream tracking for sync.
    Accounting,
    /// Sync coordination with parent and child mount points.
    Federating,
}

/// The decorators of a chain, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLayout {
    roles: Vec<Role>,
}

impl ChainLayout {
    /// Full stack used by archive drivers.
    pub fn archive() -> Self {
        Self {
            roles: vec![Role::Caching, Role::Locking, Role::Accounting, Role::Federating],
        }
    }

    /// Stack for drivers that write straight through to their backing store.
    pub fn direct() -> Self {
        Self {
            roles: vec![Role::Locking, Role::Accounting, Role::Federating],
        }
    }

    /// A custom layout. Each role may appear once and federation, if
    /// present, must come last.
    pub fn new(roles: Vec<Role>) -> FsResult<Self> {
        for (i, role) in roles.iter().enumerate() {
            if roles[..i].contains(role) {
                return Err(FsError::Config(format!("role {:?} appears twice in chain layout", role)));
            }
            if *role == Role::Federating && i + 1 != roles.len() {
                return Err(FsError::Config("federating role must be outermost".to_string()));
            }
        }
        Ok(Self { roles })
    }

    /// Roles, innermost first.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}

/// Shared inputs for building a chain.
#[derive(Clone)]
pub struct ChainContext {
    /// Pool the caching decorator allocates from.
    pub pool: Arc<BufferPool>,
    /// Write strategy of the caching decorator.
    pub strategy: CacheStrategy,
    /// Registry the federating decorator coordinates with.
    pub federation: Weak<dyn Federation>,
}

/// Wraps a leaf controller in the decorators of a layout.
pub struct ChainBuilder {
    leaf: Arc<dyn Controller>,
    layout: ChainLayout,
}

impl ChainBuilder {
    /// Starts a chain at `leaf`.
    pub fn new(leaf: Arc<dyn Controller>, layout: ChainLayout) -> Self {
        Self { leaf, layout }
    }

    /// Builds the chain bottom-up.
    pub fn build(self, context: &ChainContext) -> ControllerChain {
        let mount_point = self.leaf.mount_point().clone();
        let mut top = self.leaf;
        let mut core = None;
        for role in self.layout.roles() {
            top = match role {
                Role::Caching => Arc::new(CachingController::new(top, context.pool.clone(), context.strategy)),
                Role::Locking => Arc::new(LockingController::new(top)),
                Role::Accounting => Arc::new(AccountingController::new(top)),
                Role::Federating => {
                    core = Some(top.clone());
                    Arc::new(FederatingController::new(top, context.federation.clone()))
                }
            };
        }
        debug!("chain: built {} with {:?}", mount_point, self.layout.roles());
        let core = core.unwrap_or_else(|| top.clone());
        ControllerChain {
            mount_point,
            top,
            core,
            layout: self.layout,
        }
    }
}

/// Handle to the controller chain of one mount point.
///
/// Clones share the same chain. A chain held by a caller is never evicted by
/// its manager.
#[derive(Clone)]
pub struct ControllerChain {
    mount_point: MountPoint,
    top: Arc<dyn Controller>,
    core: Arc<dyn Controller>,
    layout: ChainLayout,
}

impl ControllerChain {
    /// The mount point.
    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    /// Outermost controller; every user operation enters here.
    pub fn top(&self) -> &Arc<dyn Controller> {
        &self.top
    }

    /// The chain below the federating decorator.
    pub fn core(&self) -> &Arc<dyn Controller> {
        &self.core
    }

    /// The layout the chain was built from.
    pub fn layout(&self) -> &ChainLayout {
        &self.layout
    }

    /// True if anyone besides the owning manager holds this chain.
    pub(crate) fn is_shared(&self) -> bool {
        let own = if Arc::ptr_eq(&self.top, &self.core) { 2 } else { 1 };
        Arc::strong_count(&self.top) > own
    }

    /// Looks up an entry.
    pub fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        self.top.entry(name)
    }

    /// Binds an input socket to `name`.
    pub fn input(&self, name: NodeName) -> InputSocket {
        InputSocket::new(self.top.clone(), name)
    }

    /// Binds an output socket to `name`.
    pub fn output(&self, name: NodeName, template: Option<Entry>) -> OutputSocket {
        OutputSocket::new(self.top.clone(), name, template)
    }

    /// Creates an entry.
    pub fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.top.mknod(name, kind, template)
    }

    /// Removes an entry.
    pub fn unlink(&self, name: &NodeName) -> FsResult<()> {
        self.top.unlink(name)
    }

    /// Syncs this mount point, its mounted descendants and its ancestors.
    pub fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let mut builder = SyncExceptionBuilder::for_sync();
        if let Err(e) = self.top.sync(options, &mut builder) {
            builder.fail(SyncIssue::failure(self.mount_point.clone(), e));
        }
        builder.check()
    }
}

impl fmt::Debug for ControllerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerChain")
            .field("mount_point", &self.mount_point)
            .field("layout", &self.layout)
            .finish()
    }
}
