//! Driver SPI and the scheme registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{ArchiveDetector, MountPoint, NodePath};
use crate::controller::{ChainLayout, Controller, Federation};
use crate::entry::Entry;
use crate::error::{FsError, FsResult};
use crate::pool::BufferPool;
use crate::socket::{InputSocket, OutputSocket};

/// A file system implementation for one or more schemes.
pub trait Driver: Send + Sync {
    /// Creates the leaf controller for a mount point.
    fn new_controller(&self, context: MountContext) -> FsResult<Arc<dyn Controller>>;

    /// Decorators to stack onto the leaf.
    fn layout(&self) -> ChainLayout {
        ChainLayout::archive()
    }
}

/// Access to the parent entry of a nested mount point.
///
/// The parent's core chain is looked up on every call, so a parent chain
/// evicted in the meantime is transparently rebuilt.
#[derive(Clone)]
pub struct ParentLink {
    path: NodePath,
    federation: Weak<dyn Federation>,
}

impl ParentLink {
    /// Links to the entry at `path`.
    pub fn new(path: NodePath, federation: Weak<dyn Federation>) -> Self {
        Self { path, federation }
    }

    /// Address of the parent entry.
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    fn core(&self) -> FsResult<Arc<dyn Controller>> {
        let federation = self.federation.upgrade().ok_or_else(|| FsError::Detached {
            mount_point: self.path.mount_point().to_string(),
        })?;
        federation.core_of(self.path.mount_point())
    }

    /// The parent entry, if it exists.
    pub fn entry(&self) -> FsResult<Option<Entry>> {
        self.core()?.entry(self.path.name())
    }

    /// Socket reading the parent entry.
    pub fn input(&self) -> FsResult<InputSocket> {
        Ok(InputSocket::new(self.core()?, self.path.name().clone()))
    }

    /// Socket replacing the parent entry.
    pub fn output(&self, template: Option<Entry>) -> FsResult<OutputSocket> {
        Ok(OutputSocket::new(self.core()?, self.path.name().clone(), template))
    }
}

impl fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentLink").field("path", &self.path).finish()
    }
}

/// Everything a driver needs to create a leaf controller.
#[derive(Debug, Clone)]
pub struct MountContext {
    /// The mount point to serve.
    pub mount_point: MountPoint,
    /// The parent entry, for nested mount points.
    pub parent: Option<ParentLink>,
    /// Pool for temporary storage.
    pub pool: Arc<BufferPool>,
    /// Whether mutations must be rejected.
    pub read_only: bool,
}

impl MountContext {
    /// The parent link, or an error for drivers that only mount nested.
    pub fn require_parent(&self) -> FsResult<ParentLink> {
        self.parent.clone().ok_or_else(|| FsError::InvalidAddress {
            address: self.mount_point.to_string(),
            reason: format!("scheme {:?} needs a parent file system", self.mount_point.scheme()),
        })
    }
}

/// Configuration of one registered scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Scheme the driver serves.
    pub scheme: String,
    /// Name of the driver implementation.
    pub format: String,
    /// Reject mutations.
    #[serde(default)]
    pub read_only: bool,
    /// File name extensions detected as this scheme.
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// A driver bound to a scheme.
#[derive(Clone)]
pub struct DriverBinding {
    /// The driver.
    pub driver: Arc<dyn Driver>,
    /// Reject mutations.
    pub read_only: bool,
    /// File name extensions detected as this scheme.
    pub extensions: Vec<String>,
}

impl DriverBinding {
    /// A writable binding without extensions.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            read_only: false,
            extensions: Vec::new(),
        }
    }

    /// Marks the binding read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Adds a detected file name extension.
    pub fn extension(mut self, extension: &str) -> Self {
        self.extensions.push(extension.to_ascii_lowercase());
        self
    }
}

impl fmt::Debug for DriverBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverBinding")
            .field("read_only", &self.read_only)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// Builds a driver by format name.
pub type DriverConstructor = fn() -> Arc<dyn Driver>;

/// Scheme to driver mapping.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    bindings: HashMap<String, DriverBinding>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `scheme`, replacing any previous binding.
    pub fn register(&mut self, scheme: &str, binding: DriverBinding) {
        debug!("driver_registry: bound scheme {:?}", scheme);
        self.bindings.insert(scheme.to_string(), binding);
    }

    /// Builder form of [`DriverRegistry::register`].
    pub fn with(mut self, scheme: &str, binding: DriverBinding) -> Self {
        self.register(scheme, binding);
        self
    }

    /// Builds a registry from configuration, resolving formats through
    /// `constructors`.
    pub fn from_config(
        configs: &[DriverConfig],
        constructors: &HashMap<&'static str, DriverConstructor>,
    ) -> FsResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            let construct = constructors.get(config.format.as_str()).ok_or_else(|| {
                FsError::Config(format!(
                    "unknown driver format {:?} for scheme {:?}",
                    config.format, config.scheme
                ))
            })?;
            if registry.bindings.contains_key(&config.scheme) {
                return Err(FsError::Config(format!("scheme {:?} configured twice", config.scheme)));
            }
            let mut binding = DriverBinding::new(construct()).read_only(config.read_only);
            for extension in &config.extensions {
                binding = binding.extension(extension);
            }
            registry.register(&config.scheme, binding);
        }
        Ok(registry)
    }

    /// The binding for `scheme`.
    pub fn binding(&self, scheme: &str) -> FsResult<&DriverBinding> {
        self.bindings.get(scheme).ok_or_else(|| FsError::UnknownScheme {
            scheme: scheme.to_string(),
        })
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Detector recognizing every registered extension.
    pub fn detector(&self) -> ArchiveDetector {
        let mut detector = ArchiveDetector::new();
        for scheme in self.schemes() {
            if let Some(binding) = self.bindings.get(scheme) {
                for extension in &binding.extensions {
                    detector = detector.with_extension(extension, scheme);
                }
            }
        }
        detector
    }
}
