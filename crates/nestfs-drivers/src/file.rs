//! Host directory driver.
//!
//! Each hierarchical mount point maps onto one host directory. Writes go to
//! a temporary file next to the target and replace it atomically on close,
//! so readers never observe partial content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestfs_kernel::{
    ChainLayout, Controller, Driver, Entry, EntryType, FsError, FsResult, MountContext, MountPoint, NodeName,
    ReadStream, ReaderStream, SyncExceptionBuilder, SyncOptions, WriteStream,
};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Driver for the host file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDriver;

impl Driver for FileDriver {
    fn new_controller(&self, context: MountContext) -> FsResult<Arc<dyn Controller>> {
        let root = context.mount_point.host_dir().ok_or_else(|| FsError::InvalidAddress {
            address: context.mount_point.to_string(),
            reason: "the file driver only serves hierarchical mount points".to_string(),
        })?;
        debug!("file: serving {} from {}", context.mount_point, root.display());
        Ok(Arc::new(FileController {
            mount_point: context.mount_point,
            root,
            read_only: context.read_only,
        }))
    }

    fn layout(&self) -> ChainLayout {
        ChainLayout::direct()
    }
}

/// Leaf controller of one host directory.
pub struct FileController {
    mount_point: MountPoint,
    root: PathBuf,
    read_only: bool,
}

fn map_io(e: io::Error, path: &str) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::not_found(path),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists { path: path.to_string() },
        io::ErrorKind::DirectoryNotEmpty => FsError::NotEmpty { path: path.to_string() },
        _ => FsError::Io(e),
    }
}

fn entry_from_metadata(name: &NodeName, host: &Path, meta: &fs::Metadata) -> FsResult<Entry> {
    let kind = if meta.is_dir() {
        EntryType::Directory
    } else if meta.is_file() {
        EntryType::File
    } else {
        EntryType::Special
    };
    let mut entry = Entry::with_kind(name.as_str(), kind);
    entry.modified = meta.modified().ok();
    entry.accessed = meta.accessed().ok();
    entry.created = meta.created().ok();
    match kind {
        EntryType::File => {
            entry.data_size = Some(meta.len());
            entry.storage_size = Some(meta.len());
        }
        EntryType::Directory => {
            let mut members = std::collections::BTreeSet::new();
            for child in fs::read_dir(host)? {
                if let Some(child) = child?.file_name().to_str() {
                    members.insert(child.to_string());
                }
            }
            entry.members = Some(members);
        }
        EntryType::Special => {}
    }
    Ok(entry)
}

impl FileController {
    fn host(&self, name: &NodeName) -> PathBuf {
        if name.is_root() {
            self.root.clone()
        } else {
            self.root.join(name.as_str())
        }
    }

    fn path(&self, name: &NodeName) -> String {
        format!("{}{}", self.mount_point, name)
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly {
                mount_point: self.mount_point.to_string(),
            });
        }
        Ok(())
    }
}

/// Atomic replacement of one host file.
struct FileWriter {
    temp: Option<NamedTempFile>,
    target: PathBuf,
    path: String,
    template: Option<Entry>,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.temp {
            Some(temp) => temp.write(buf),
            None => Err(FsError::StreamClosed { path: self.path.clone() }.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.temp {
            Some(temp) => temp.flush(),
            None => Ok(()),
        }
    }
}

impl WriteStream for FileWriter {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        let Some(mut temp) = self.temp.take() else {
            return Ok(());
        };
        temp.flush()?;
        let file = temp.persist(&self.target).map_err(|e| FsError::Io(e.error))?;
        if let Some(modified) = self.template.as_ref().and_then(|t| t.modified) {
            file.set_modified(modified)?;
        }
        trace!("file: replaced {}", self.target.display());
        Ok(())
    }
}

impl Controller for FileController {
    fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        let host = self.host(name);
        match fs::metadata(&host) {
            Ok(meta) => entry_from_metadata(name, &host, &meta).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
        let host = self.host(name);
        if host.is_dir() {
            return Err(FsError::IsADirectory { path: self.path(name) });
        }
        let file = File::open(&host).map_err(|e| map_io(e, &self.path(name)))?;
        Ok(Box::new(ReaderStream::new(BufReader::new(file))))
    }

    fn check_output(&self, name: &NodeName) -> FsResult<()> {
        self.check_writable()?;
        if self.host(name).is_dir() {
            return Err(FsError::IsADirectory { path: self.path(name) });
        }
        Ok(())
    }

    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        self.check_output(name)?;
        let target = self.host(name);
        let dir = target.parent().unwrap_or(self.root.as_path());
        if !dir.is_dir() {
            return Err(FsError::not_found(self.path(name)));
        }
        let temp = NamedTempFile::new_in(dir)?;
        Ok(Box::new(FileWriter {
            temp: Some(temp),
            target,
            path: self.path(name),
            template: template.cloned(),
        }))
    }

    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.check_writable()?;
        let host = self.host(name);
        let path = self.path(name);
        match kind {
            EntryType::Directory => fs::create_dir(&host).map_err(|e| map_io(e, &path))?,
            EntryType::File => {
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&host)
                    .map_err(|e| map_io(e, &path))?;
                if let Some(modified) = template.and_then(|t| t.modified) {
                    file.set_modified(modified)?;
                }
            }
            EntryType::Special => {
                return Err(FsError::NotSupported {
                    op: format!("mknod special entry {}", path),
                })
            }
        }
        Ok(())
    }

    fn unlink(&self, name: &NodeName) -> FsResult<()> {
        self.check_writable()?;
        if name.is_root() {
            return Err(FsError::NotSupported {
                op: format!("unlink mount point {}", self.mount_point),
            });
        }
        let host = self.host(name);
        let path = self.path(name);
        let meta = fs::symlink_metadata(&host).map_err(|e| map_io(e, &path))?;
        if meta.is_dir() {
            if fs::read_dir(&host)?.next().is_some() {
                return Err(FsError::NotEmpty { path });
            }
            fs::remove_dir(&host).map_err(|e| map_io(e, &path))
        } else {
            fs::remove_file(&host).map_err(|e| map_io(e, &path))
        }
    }

    fn sync(&self, _options: SyncOptions, _builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        // Every write is already on disk once its stream is closed.
        Ok(())
    }
}
