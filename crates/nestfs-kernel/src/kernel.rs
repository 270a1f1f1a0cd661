//! The kernel context: one manager, one pool, one driver registry.
//!
//! Nothing here is global. Every kernel owns its own state, so independent
//! kernels can coexist in one process and tests never share mounts.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::address::{ArchiveDetector, NodePath};
use crate::config::KernelConfig;
use crate::controller::ControllerChain;
use crate::driver::DriverRegistry;
use crate::entry::{Entry, EntryType};
use crate::error::FsResult;
use crate::exceptions::SyncError;
use crate::manager::Manager;
use crate::options::SyncOptions;
use crate::pool::BufferPool;
use crate::socket::{InputSocket, OutputSocket};

/// Entry point for federated file system access.
pub struct Kernel {
    manager: Manager,
    detector: ArchiveDetector,
    sync_on_drop: bool,
}

impl Kernel {
    /// Builds a kernel from `config` serving the schemes in `drivers`.
    pub fn new(config: &KernelConfig, drivers: DriverRegistry) -> Self {
        let pool = Arc::new(BufferPool::new(config.pool.clone()));
        let detector = drivers.detector();
        info!("kernel: started with schemes {:?}", drivers.schemes());
        Self {
            manager: Manager::new(drivers, pool, config.cache.clone()),
            detector,
            sync_on_drop: config.sync_on_drop,
        }
    }

    /// The chain manager.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        self.manager.pool()
    }

    /// Maps an absolute host path onto a federated address, opening a level
    /// at every component with a registered archive extension.
    pub fn resolve(&self, host_path: impl AsRef<Path>) -> FsResult<NodePath> {
        self.detector.resolve(host_path.as_ref())
    }

    /// The controller chain serving `path`.
    pub fn controller(&self, path: &NodePath) -> FsResult<ControllerChain> {
        self.manager.controller(path.mount_point())
    }

    /// Looks up an entry.
    ///
    /// An archive whose file does not exist is not mounted by a lookup.
    pub fn entry(&self, path: &NodePath) -> FsResult<Option<Entry>> {
        let mount_point = path.mount_point();
        if !self.manager.is_mounted(mount_point) {
            if let Some(parent) = mount_point.parent() {
                if self.entry(parent)?.is_none() {
                    return Ok(None);
                }
            }
        }
        self.controller(path)?.entry(path.name())
    }

    /// Binds an input socket.
    pub fn input(&self, path: &NodePath) -> FsResult<InputSocket> {
        Ok(self.controller(path)?.input(path.name().clone()))
    }

    /// Binds an output socket.
    pub fn output(&self, path: &NodePath, template: Option<Entry>) -> FsResult<OutputSocket> {
        Ok(self.controller(path)?.output(path.name().clone(), template))
    }

    /// Creates an entry.
    pub fn mknod(&self, path: &NodePath, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.controller(path)?.mknod(path.name(), kind, template)
    }

    /// Removes an entry.
    pub fn unlink(&self, path: &NodePath) -> FsResult<()> {
        self.controller(path)?.unlink(path.name())
    }

    /// Reads a whole entry.
    pub fn read(&self, path: &NodePath) -> FsResult<Vec<u8>> {
        let mut stream = self.input(path)?.stream()?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        stream.close()?;
        Ok(data)
    }

    /// Replaces the content of an entry.
    pub fn write(&self, path: &NodePath, data: &[u8]) -> FsResult<()> {
        self.output(path, None)?.write_all(data)
    }

    /// Syncs every mounted level, deepest first.
    pub fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        self.manager.sync(options)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if !self.sync_on_drop || self.manager.is_empty() {
            return;
        }
        if let Err(e) = self.manager.sync(SyncOptions::UMOUNT) {
            warn!("kernel: sync on drop reported issues: {}", e);
        }
    }
}
