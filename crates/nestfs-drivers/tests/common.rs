//! Common fixtures for driver integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use nestfs_drivers::{constructors, default_drivers, PackCodec};
use nestfs_kernel::{
    ArchiveCodec, ArchiveDriver, ArchiveMember, BufferPool, CacheStrategy, DriverBinding, DriverRegistry, Entry,
    FsError, FsResult, Kernel, KernelConfig, NodePath, PoolConfig,
};
use tempfile::TempDir;

/// A kernel over a fresh temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub kernel: Kernel,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kernel = nestfs_drivers::kernel(&config).unwrap();
        Self { dir, kernel }
    }

    /// Like [`Fixture::new`], plus a `bad` scheme whose archives never commit.
    pub fn with_failing_scheme() -> Self {
        let config = test_config();
        let mut registry = DriverRegistry::from_config(&default_drivers(), &constructors()).unwrap();
        registry.register(
            "bad",
            DriverBinding::new(Arc::new(ArchiveDriver::new(FailingCodec))).extension("bad"),
        );
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::new(&config, registry);
        Self { dir, kernel }
    }

    /// Federated address of a path relative to the fixture directory.
    pub fn path(&self, relative: &str) -> NodePath {
        self.kernel.resolve(self.dir.path().join(relative)).unwrap()
    }

    pub fn host(&self, relative: &str) -> std::path::PathBuf {
        self.dir.path().join(relative)
    }

    pub fn read(&self, relative: &str) -> Vec<u8> {
        self.kernel.read(&self.path(relative)).unwrap()
    }

    pub fn write(&self, relative: &str, data: &[u8]) {
        self.kernel.write(&self.path(relative), data).unwrap();
    }
}

pub fn test_config() -> KernelConfig {
    KernelConfig {
        pool: PoolConfig::memory(),
        ..KernelConfig::default()
    }
}

pub fn write_back_config() -> KernelConfig {
    let mut config = test_config();
    config.cache.strategy = CacheStrategy::WriteBack;
    config
}

/// Encodes a pack archive holding the given files.
pub fn pack_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let pool = BufferPool::new(PoolConfig::memory());
    let members: Vec<ArchiveMember> = files
        .iter()
        .map(|(name, data)| {
            let buffer = pool.allocate().unwrap();
            buffer.fill_from(&mut &data[..]).unwrap();
            ArchiveMember {
                entry: Entry::file(*name),
                content: Some(buffer),
            }
        })
        .collect();
    let mut bytes = Vec::new();
    PackCodec.encode(&members, &mut bytes).unwrap();
    for member in &members {
        if let Some(buffer) = &member.content {
            pool.release(buffer).unwrap();
        }
    }
    bytes
}

/// Writes a pack archive to the host.
pub fn write_pack(path: &Path, files: &[(&str, &[u8])]) {
    std::fs::write(path, pack_bytes(files)).unwrap();
}

/// Decodes pack bytes into (name, content) pairs.
pub fn unpack(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    PackCodec
        .decode(&mut &bytes[..], &mut |entry: Entry, content: &mut dyn Read| {
            let mut data = Vec::new();
            content.read_to_end(&mut data)?;
            out.push((entry.name, data));
            Ok(())
        })
        .unwrap();
    out
}

/// Content of one member of a host pack file, if present.
pub fn member_of(path: &Path, name: &str) -> Option<Vec<u8>> {
    let bytes = std::fs::read(path).ok()?;
    unpack(&bytes).into_iter().find(|(n, _)| n == name).map(|(_, d)| d)
}

/// Codec that mounts as an empty archive and refuses to encode.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingCodec;

impl ArchiveCodec for FailingCodec {
    fn decode(
        &self,
        _source: &mut dyn Read,
        _visit: &mut dyn FnMut(Entry, &mut dyn Read) -> FsResult<()>,
    ) -> FsResult<()> {
        Ok(())
    }

    fn encode(&self, _members: &[ArchiveMember], sink: &mut dyn Write) -> FsResult<()> {
        sink.write_all(b"partial")?;
        Err(FsError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }
}
