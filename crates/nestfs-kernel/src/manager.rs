//! Registry of controller chains and the sync sweep over them.
//!
//! Chains are created lazily, parent first, and kept in a map keyed by mount
//! point. Parent and child chains refer to each other only through this map
//! and mount point addresses, never by owning handles, so evicting a chain
//! never leaves a dangling reference behind.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::address::{MountPoint, NodePath};
use crate::cache::CacheConfig;
use crate::controller::{ChainBuilder, ChainContext, Controller, ControllerChain, Federation};
use crate::driver::{DriverRegistry, MountContext, ParentLink};
use crate::error::FsResult;
use crate::exceptions::{SyncError, SyncExceptionBuilder, SyncIssue};
use crate::options::SyncOptions;
use crate::pool::BufferPool;

struct ManagerShared {
    me: Weak<ManagerShared>,
    drivers: DriverRegistry,
    pool: Arc<BufferPool>,
    cache: CacheConfig,
    chains: RwLock<HashMap<MountPoint, ControllerChain>>,
}

impl ManagerShared {
    fn federation(&self) -> Weak<dyn Federation> {
        let me: Weak<dyn Federation> = self.me.clone();
        me
    }

    fn controller(&self, mount_point: &MountPoint) -> FsResult<ControllerChain> {
        if let Some(chain) = self.chains.read().get(mount_point) {
            return Ok(chain.clone());
        }

        // The parent chain must exist before the child is built.
        let parent = match mount_point.parent() {
            Some(path) => {
                self.controller(path.mount_point())?;
                Some(ParentLink::new(path.clone(), self.federation()))
            }
            None => None,
        };
        let binding = self.drivers.binding(mount_point.scheme())?;

        let mut chains = self.chains.write();
        if let Some(chain) = chains.get(mount_point) {
            return Ok(chain.clone());
        }
        let leaf = binding.driver.new_controller(MountContext {
            mount_point: mount_point.clone(),
            parent,
            pool: self.pool.clone(),
            read_only: binding.read_only,
        })?;
        let chain = ChainBuilder::new(leaf, binding.driver.layout()).build(&ChainContext {
            pool: self.pool.clone(),
            strategy: self.cache.strategy,
            federation: self.federation(),
        });
        info!("manager: mounted {}", mount_point);
        chains.insert(mount_point.clone(), chain.clone());
        Ok(chain)
    }

    /// Mount points ordered for a sweep: deepest first, then by address.
    fn ordered(&self, filter: impl Fn(&MountPoint) -> bool) -> Vec<MountPoint> {
        let mut targets: Vec<MountPoint> = self.chains.read().keys().filter(|mp| filter(mp)).cloned().collect();
        targets.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.cmp(b)));
        targets
    }

    fn sweep(&self, targets: Vec<MountPoint>, options: SyncOptions, builder: &mut SyncExceptionBuilder) {
        for mount_point in targets {
            let chain = self.chains.read().get(&mount_point).cloned();
            let Some(chain) = chain else {
                continue;
            };
            let result = chain.core().sync(options, builder);
            drop(chain);
            match result {
                Ok(()) => {
                    if options.contains(SyncOptions::CLEAR_CACHE) {
                        self.evict_if_idle(&mount_point);
                    }
                }
                Err(e) => {
                    warn!("manager: sync of {} failed: {}", mount_point, e);
                    builder.fail(SyncIssue::failure(mount_point, e));
                }
            }
        }
    }

    fn evict_if_idle(&self, mount_point: &MountPoint) {
        let mut chains = self.chains.write();
        let Some(chain) = chains.get(mount_point) else {
            return;
        };
        if chains.keys().any(|other| other.parent_mount_point() == Some(mount_point)) {
            debug!("manager: keeping {}: nested mount points remain", mount_point);
            return;
        }
        if chain.is_shared() {
            debug!("manager: keeping {}: chain still referenced", mount_point);
            return;
        }
        let pending = chain.top().pending_resources();
        if pending > 0 {
            debug!("manager: keeping {}: {} resources pending", mount_point, pending);
            return;
        }
        chains.remove(mount_point);
        info!("manager: unmounted {}", mount_point);
    }
}

impl Federation for ManagerShared {
    fn core_of(&self, mount_point: &MountPoint) -> FsResult<Arc<dyn Controller>> {
        Ok(self.controller(mount_point)?.core().clone())
    }

    fn mounted_child(&self, path: &NodePath) -> Option<MountPoint> {
        self.chains
            .read()
            .keys()
            .find(|mp| mp.parent() == Some(path))
            .cloned()
    }

    fn sync_subtree(&self, root: &MountPoint, options: SyncOptions, builder: &mut SyncExceptionBuilder) {
        let targets = self.ordered(|mp| mp == root || mp.is_descendant_of(root));
        self.sweep(targets, options, builder);
    }
}

/// Owns every controller chain of one kernel.
pub struct Manager {
    shared: Arc<ManagerShared>,
}

impl Manager {
    /// Creates a manager with no mounted chains.
    pub fn new(drivers: DriverRegistry, pool: Arc<BufferPool>, cache: CacheConfig) -> Self {
        let shared = Arc::new_cyclic(|me| ManagerShared {
            me: me.clone(),
            drivers,
            pool,
            cache,
            chains: RwLock::new(HashMap::new()),
        });
        Self { shared }
    }

    /// The chain for `mount_point`, creating it and its ancestors as needed.
    pub fn controller(&self, mount_point: &MountPoint) -> FsResult<ControllerChain> {
        self.shared.controller(mount_point)
    }

    /// Currently mounted mount points, sorted by address.
    pub fn mount_points(&self) -> Vec<MountPoint> {
        let mut mps: Vec<MountPoint> = self.shared.chains.read().keys().cloned().collect();
        mps.sort();
        mps
    }

    /// Returns true if `mount_point` has a chain.
    pub fn is_mounted(&self, mount_point: &MountPoint) -> bool {
        self.shared.chains.read().contains_key(mount_point)
    }

    /// Number of mounted chains.
    pub fn len(&self) -> usize {
        self.shared.chains.read().len()
    }

    /// Returns true if nothing is mounted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The driver registry.
    pub fn drivers(&self) -> &DriverRegistry {
        &self.shared.drivers
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    /// Syncs every mounted chain, deepest first.
    ///
    /// A failing mount point never stops the sweep; all issues are reported
    /// together once every mount point was visited.
    pub fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        self.sync_where(options, |_| true)
    }

    /// Syncs the mounted chains accepted by `filter`, deepest first.
    pub fn sync_where(&self, options: SyncOptions, filter: impl Fn(&MountPoint) -> bool) -> Result<(), SyncError> {
        let targets = self.shared.ordered(filter);
        let count = targets.len();
        let mut builder = SyncExceptionBuilder::for_sync();
        self.shared.sweep(targets, options, &mut builder);
        info!(
            "manager: synced {} mount point(s) with {:?}, {} issue(s)",
            count,
            options,
            builder.len()
        );
        builder.check()
    }
}
