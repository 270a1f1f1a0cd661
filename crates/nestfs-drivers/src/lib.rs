#![warn(missing_docs)]

//! NestFS drivers: the host directory file system and the pack archive format
//!
//! [`constructors`] maps the format names accepted in a
//! [`KernelConfig`](nestfs_kernel::KernelConfig) onto driver implementations;
//! [`kernel`] builds a ready kernel from such a configuration.

pub mod file;
pub mod pack;

use std::collections::HashMap;
use std::sync::Arc;

use nestfs_kernel::{Driver, DriverConfig, DriverConstructor, DriverRegistry, FsResult, Kernel, KernelConfig};

pub use file::{FileController, FileDriver};
pub use pack::{PackCodec, PackDriver, PackError, PACK_MAGIC, PACK_VERSION};

fn file_driver() -> Arc<dyn Driver> {
    Arc::new(FileDriver)
}

fn pack_driver() -> Arc<dyn Driver> {
    Arc::new(PackDriver::default())
}

/// Driver implementations by format name.
pub fn constructors() -> HashMap<&'static str, DriverConstructor> {
    let mut table: HashMap<&'static str, DriverConstructor> = HashMap::new();
    table.insert("file", file_driver);
    table.insert("pack", pack_driver);
    table
}

/// The `file` scheme plus a writable `pack` scheme detected by the `.pack`
/// and `.npk` extensions.
pub fn default_drivers() -> Vec<DriverConfig> {
    vec![
        DriverConfig {
            scheme: "file".to_string(),
            format: "file".to_string(),
            read_only: false,
            extensions: Vec::new(),
        },
        DriverConfig {
            scheme: "pack".to_string(),
            format: "pack".to_string(),
            read_only: false,
            extensions: vec!["pack".to_string(), "npk".to_string()],
        },
    ]
}

/// Builds the driver registry described by `config`, or the defaults if it
/// names no drivers.
pub fn registry(config: &KernelConfig) -> FsResult<DriverRegistry> {
    if config.drivers.is_empty() {
        DriverRegistry::from_config(&default_drivers(), &constructors())
    } else {
        DriverRegistry::from_config(&config.drivers, &constructors())
    }
}

/// Builds a kernel serving the drivers of `config`.
pub fn kernel(config: &KernelConfig) -> FsResult<Kernel> {
    Ok(Kernel::new(config, registry(config)?))
}
