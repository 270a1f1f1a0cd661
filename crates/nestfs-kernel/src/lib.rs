#![warn(missing_docs)]

//! NestFS kernel: federated virtual file system over nested archives
//!
//! Every archive file, at any depth, is exposed as a directory. Each level is
//! served by a chain of controllers stacked on a driver-supplied leaf, and
//! one sync operation commits or discards the changes of every level,
//! deepest first, collecting failures instead of stopping at the first one.

pub mod address;
pub mod archive;
pub mod cache;
pub mod config;
pub mod controller;
pub mod driver;
pub mod entry;
pub mod error;
pub mod exceptions;
pub mod kernel;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod options;
pub mod pool;
pub mod socket;

pub use address::{ArchiveDetector, MountPoint, NodeName, NodePath, ARCHIVE_SEPARATOR};
pub use archive::{ArchiveCodec, ArchiveController, ArchiveDriver, ArchiveMember};
pub use cache::{CacheConfig, CacheHandle, CacheStats, CacheStrategy, EntryCache};
pub use config::KernelConfig;
pub use controller::{ChainBuilder, ChainContext, ChainLayout, Controller, ControllerChain, Federation, Role};
pub use driver::{Driver, DriverBinding, DriverConfig, DriverConstructor, DriverRegistry, MountContext, ParentLink};
pub use entry::{Access, Entry, EntryType, Size};
pub use error::{FsError, FsResult};
pub use exceptions::{Composite, ExceptionBuilder, Severity, SyncError, SyncExceptionBuilder, SyncIssue};
pub use kernel::Kernel;
pub use lock::MountLock;
pub use manager::Manager;
pub use options::SyncOptions;
pub use pool::{BufferPool, IoBuffer, PoolBacking, PoolConfig, PoolStats};
pub use socket::{InputSocket, OutputSocket, ReadStream, ReaderStream, WriteStream};
