//! Generic leaf controller for archive formats.
//!
//! An archive is mounted lazily on first access: its parent entry is decoded
//! by an [`ArchiveCodec`] into pooled buffers, one per member. Changes are
//! kept in memory and re-encoded into the parent entry on sync.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::address::{MountPoint, NodeName};
use crate::controller::{ChainLayout, Controller};
use crate::driver::{Driver, MountContext, ParentLink};
use crate::entry::{Entry, EntryType};
use crate::error::{FsError, FsResult};
use crate::exceptions::{SyncExceptionBuilder, SyncIssue};
use crate::options::SyncOptions;
use crate::pool::{BufferPool, BufferWriter, IoBuffer};
use crate::socket::{ReadStream, ReaderStream, WriteStream};

/// One member of an archive.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// Member metadata; `entry.name` is the canonical member name.
    pub entry: Entry,
    /// Content of file members. `None` for directories and empty files.
    pub content: Option<IoBuffer>,
}

/// Reads and writes one archive container format.
pub trait ArchiveCodec: Send + Sync + 'static {
    /// Decodes `source`, calling `visit` once per member with its content.
    fn decode(
        &self,
        source: &mut dyn Read,
        visit: &mut dyn FnMut(Entry, &mut dyn Read) -> FsResult<()>,
    ) -> FsResult<()>;

    /// Encodes `members`, in order, into `sink`.
    fn encode(&self, members: &[ArchiveMember], sink: &mut dyn Write) -> FsResult<()>;
}

/// Driver mounting archives of one codec.
pub struct ArchiveDriver<C> {
    codec: Arc<C>,
}

impl<C: ArchiveCodec + Default> Default for ArchiveDriver<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C: ArchiveCodec> ArchiveDriver<C> {
    /// Wraps `codec`.
    pub fn new(codec: C) -> Self {
        Self { codec: Arc::new(codec) }
    }
}

impl<C: ArchiveCodec> Driver for ArchiveDriver<C> {
    fn new_controller(&self, context: MountContext) -> FsResult<Arc<dyn Controller>> {
        let codec: Arc<dyn ArchiveCodec> = self.codec.clone();
        Ok(Arc::new(ArchiveController::new(context, codec)?))
    }

    fn layout(&self) -> ChainLayout {
        ChainLayout::archive()
    }
}

/// Returns a buffer nobody else can reach anymore, logging a failed release.
fn release_logged(pool: &BufferPool, buffer: &IoBuffer) {
    if let Err(e) = pool.release(buffer) {
        warn!("archive: failed to release buffer id={}: {}", buffer.id(), e);
    }
}

#[derive(Default)]
struct Mounted {
    members: BTreeMap<NodeName, ArchiveMember>,
    dirty: bool,
    /// Whether the parent entry held an archive when mounted or since the
    /// last commit. A missing, unmodified archive has no entries at all.
    exists: bool,
}

impl Mounted {
    fn release_all(&mut self, pool: &BufferPool) -> Vec<FsError> {
        let mut errors = Vec::new();
        for member in std::mem::take(&mut self.members).into_values() {
            if let Some(buffer) = member.content {
                if let Err(e) = pool.release(&buffer) {
                    errors.push(e);
                }
            }
        }
        errors
    }

    fn buffers(&self) -> usize {
        self.members.values().filter(|m| m.content.is_some()).count()
    }

    /// Replaces or adds a member, releasing the content it replaces.
    fn put(&mut self, pool: &BufferPool, name: NodeName, member: ArchiveMember) {
        if let Some(old) = self.members.insert(name, member) {
            if let Some(buffer) = old.content {
                if let Err(e) = pool.release(&buffer) {
                    warn!("archive: failed to release replaced member buffer: {}", e);
                }
            }
        }
    }

    /// Creates missing parent directories of `name`.
    fn ensure_parents(&mut self, name: &NodeName) {
        let mut dir = name.parent();
        while let Some(current) = dir {
            if current.is_root() {
                break;
            }
            if !self.members.contains_key(&current) {
                self.members.insert(
                    current.clone(),
                    ArchiveMember {
                        entry: Entry::directory(current.as_str()),
                        content: None,
                    },
                );
            }
            dir = current.parent();
        }
    }

    fn children(&self, dir: &NodeName) -> BTreeSet<String> {
        self.members
            .keys()
            .filter(|name| name.parent().as_ref() == Some(dir))
            .map(|name| name.base_name().to_string())
            .collect()
    }

    fn member_entry(&self, name: &NodeName) -> Option<Entry> {
        if !self.exists && !self.dirty {
            return None;
        }
        if name.is_root() {
            let mut root = Entry::directory("");
            root.members = Some(self.children(name));
            return Some(root);
        }
        let member = self.members.get(name)?;
        let mut entry = member.entry.clone();
        if entry.is_directory() {
            entry.members = Some(self.children(name));
        }
        Some(entry)
    }
}

/// Leaf controller of one mounted archive.
pub struct ArchiveController {
    mount_point: MountPoint,
    parent: ParentLink,
    codec: Arc<dyn ArchiveCodec>,
    pool: Arc<BufferPool>,
    read_only: bool,
    state: Arc<Mutex<Option<Mounted>>>,
}

type MountedGuard<'a> = MutexGuard<'a, Option<Mounted>>;

impl ArchiveController {
    /// Creates the controller for a nested mount point. Nothing is read
    /// until the first operation.
    pub fn new(context: MountContext, codec: Arc<dyn ArchiveCodec>) -> FsResult<Self> {
        let parent = context.require_parent()?;
        Ok(Self {
            mount_point: context.mount_point,
            parent,
            codec,
            pool: context.pool,
            read_only: context.read_only,
            state: Arc::new(Mutex::new(None)),
        })
    }

    /// Returns true once the archive has been read.
    pub fn is_mounted(&self) -> bool {
        self.state.lock().is_some()
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

    fn load(&self) -> FsResult<Mounted> {
        let parent_path = self.parent.path().to_string();
        let mut mounted = Mounted::default();
        match self.parent.entry()? {
            None => {
                debug!("archive: {} starts as a new empty archive", self.mount_point);
                return Ok(mounted);
            }
            Some(entry) if !entry.is_file() => {
                return Err(FsError::NotAnArchive {
                    path: parent_path,
                    reason: format!("parent entry is a {:?}", entry.kind),
                });
            }
            Some(_) => {}
        }

        let pool = self.pool.clone();
        let mut source = self.parent.input()?.stream()?;
        let decoded = self.codec.decode(&mut source, &mut |entry: Entry, content: &mut dyn Read| {
            let name = NodeName::new(&entry.name).map_err(|e| FsError::CorruptArchive {
                path: parent_path.clone(),
                reason: e.to_string(),
            })?;
            if name.is_root() {
                return Ok(());
            }
            let buffer = if entry.is_file() {
                let buffer = pool.allocate()?;
                if let Err(e) = buffer.fill_from(content) {
                    release_logged(&pool, &buffer);
                    return Err(e);
                }
                Some(buffer)
            } else {
                None
            };
            let mut entry = entry;
            entry.name = name.as_str().to_string();
            mounted.put(&pool, name.clone(), ArchiveMember { entry, content: buffer });
            mounted.ensure_parents(&name);
            Ok(())
        });
        let closed = source.close();
        if let Err(e) = decoded.and(closed) {
            let e = match e {
                FsError::CorruptArchive { reason, .. } => FsError::CorruptArchive {
                    path: parent_path,
                    reason,
                },
                other => other,
            };
            for released in mounted.release_all(&self.pool) {
                warn!("archive: cleanup after failed mount of {}: {}", self.mount_point, released);
            }
            return Err(e);
        }
        mounted.exists = true;
        info!(
            "archive: mounted {} with {} member(s)",
            self.mount_point,
            mounted.members.len()
        );
        Ok(mounted)
    }

    /// Locks the archive state, mounting it first if needed.
    fn mounted(&self) -> FsResult<MountedGuard<'_>> {
        let mut guard = self.state.lock();
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        Ok(guard)
    }

    fn check_parents(&self, mounted: &Mounted, name: &NodeName) -> FsResult<()> {
        let mut dir = name.parent();
        while let Some(current) = dir {
            if current.is_root() {
                break;
            }
            if let Some(member) = mounted.members.get(&current) {
                if !member.entry.is_directory() {
                    return Err(FsError::NotADirectory {
                        path: self.path(&current),
                    });
                }
            }
            dir = current.parent();
        }
        Ok(())
    }

    fn commit(&self, mounted: &Mounted) -> FsResult<()> {
        let members: Vec<ArchiveMember> = mounted.members.values().cloned().collect();
        let mut template = Entry::file(self.parent.path().name().as_str());
        template.modified = Some(SystemTime::now());
        let mut sink = self.parent.output(Some(template))?.stream()?;
        self.codec.encode(&members, &mut sink)?;
        sink.close()?;
        info!(
            "archive: committed {} member(s) of {} to {}",
            members.len(),
            self.mount_point,
            self.parent.path()
        );
        Ok(())
    }
}

fn with_state<T>(guard: &mut MountedGuard<'_>, f: impl FnOnce(&mut Mounted) -> FsResult<T>) -> FsResult<T> {
    match guard.as_mut() {
        Some(mounted) => f(mounted),
        None => Err(FsError::NotSupported {
            op: "access to an unmounted archive".to_string(),
        }),
    }
}

/// Writes a member into a fresh buffer and swaps it in on close.
struct MemberWriter {
    state: Arc<Mutex<Option<Mounted>>>,
    pool: Arc<BufferPool>,
    name: NodeName,
    path: String,
    template: Option<Entry>,
    pending: Option<(IoBuffer, BufferWriter)>,
}

impl Write for MemberWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.pending {
            Some((_, writer)) => writer.write(buf),
            None => Err(FsError::StreamClosed { path: self.path.clone() }.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.pending {
            Some((_, writer)) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl WriteStream for MemberWriter {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        let Some((buffer, writer)) = self.pending.take() else {
            return Ok(());
        };
        let size = match writer.finish() {
            Ok(size) => size,
            Err(e) => {
                release_logged(&self.pool, &buffer);
                return Err(e);
            }
        };
        let mut guard = self.state.lock();
        let Some(mounted) = guard.as_mut() else {
            release_logged(&self.pool, &buffer);
            return Err(FsError::StreamClosed { path: self.path.clone() });
        };
        let now = SystemTime::now();
        let mut entry = Entry::file(self.name.as_str());
        entry.data_size = Some(size);
        entry.storage_size = Some(size);
        entry.modified = Some(now);
        if let Some(previous) = mounted.members.get(&self.name) {
            entry.created = previous.entry.created;
        } else {
            entry.created = Some(now);
        }
        if let Some(template) = &self.template {
            entry.apply_times(template);
        }
        mounted.put(
            &self.pool,
            self.name.clone(),
            ArchiveMember {
                entry,
                content: Some(buffer),
            },
        );
        mounted.ensure_parents(&self.name);
        mounted.dirty = true;
        Ok(())
    }
}

impl Drop for MemberWriter {
    fn drop(&mut self) {
        if let Some((buffer, _)) = self.pending.take() {
            release_logged(&self.pool, &buffer);
        }
    }
}

impl Controller for ArchiveController {
    fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    fn entry(&self, name: &NodeName) -> FsResult<Option<Entry>> {
        let mut guard = self.mounted()?;
        with_state(&mut guard, |m| Ok(m.member_entry(name)))
    }

    fn open_input(&self, name: &NodeName) -> FsResult<Box<dyn ReadStream>> {
        let mut guard = self.mounted()?;
        with_state(&mut guard, |m| {
            let member = m.members.get(name).ok_or_else(|| FsError::not_found(self.path(name)))?;
            if member.entry.is_directory() {
                return Err(FsError::IsADirectory { path: self.path(name) });
            }
            let stream: Box<dyn ReadStream> = match &member.content {
                Some(buffer) => Box::new(ReaderStream::new(buffer.input()?)),
                None => Box::new(ReaderStream::new(io::empty())),
            };
            Ok(stream)
        })
    }

    fn open_output(&self, name: &NodeName, template: Option<&Entry>) -> FsResult<Box<dyn WriteStream>> {
        self.check_output(name)?;
        let buffer = self.pool.allocate()?;
        let writer = match buffer.output() {
            Ok(writer) => writer,
            Err(e) => {
                release_logged(&self.pool, &buffer);
                return Err(e);
            }
        };
        Ok(Box::new(MemberWriter {
            state: self.state.clone(),
            pool: self.pool.clone(),
            name: name.clone(),
            path: self.path(name),
            template: template.cloned(),
            pending: Some((buffer, writer)),
        }))
    }

    fn check_output(&self, name: &NodeName) -> FsResult<()> {
        self.check_writable()?;
        if name.is_root() {
            return Err(FsError::IsADirectory { path: self.path(name) });
        }
        let mut guard = self.mounted()?;
        with_state(&mut guard, |m| {
            if m.members.get(name).is_some_and(|member| member.entry.is_directory()) {
                return Err(FsError::IsADirectory { path: self.path(name) });
            }
            self.check_parents(m, name)
        })
    }

    fn mknod(&self, name: &NodeName, kind: EntryType, template: Option<&Entry>) -> FsResult<()> {
        self.check_writable()?;
        let mut guard = self.mounted()?;
        with_state(&mut guard, |m| {
            if name.is_root() || m.members.contains_key(name) {
                return Err(FsError::AlreadyExists { path: self.path(name) });
            }
            self.check_parents(m, name)?;
            let mut entry = match kind {
                EntryType::Directory => Entry::directory(name.as_str()),
                other => {
                    let mut entry = Entry::with_kind(name.as_str(), other);
                    entry.data_size = Some(0);
                    entry
                }
            };
            let now = SystemTime::now();
            entry.created = Some(now);
            entry.modified = Some(now);
            if let Some(template) = template {
                entry.apply_times(template);
            }
            m.put(&self.pool, name.clone(), ArchiveMember { entry, content: None });
            m.ensure_parents(name);
            m.dirty = true;
            Ok(())
        })
    }

    fn unlink(&self, name: &NodeName) -> FsResult<()> {
        self.check_writable()?;
        if name.is_root() {
            return Err(FsError::NotSupported {
                op: format!("unlink archive root {}", self.mount_point),
            });
        }
        let mut guard = self.mounted()?;
        with_state(&mut guard, |m| {
            let is_dir = match m.members.get(name) {
                None => return Err(FsError::not_found(self.path(name))),
                Some(member) => member.entry.is_directory(),
            };
            if is_dir && !m.children(name).is_empty() {
                return Err(FsError::NotEmpty { path: self.path(name) });
            }
            if let Some(member) = m.members.remove(name) {
                if let Some(buffer) = member.content {
                    self.pool.release(&buffer)?;
                }
            }
            m.dirty = true;
            Ok(())
        })
    }

    fn sync(&self, options: SyncOptions, builder: &mut SyncExceptionBuilder) -> FsResult<()> {
        let mut guard = self.state.lock();
        if options.contains(SyncOptions::ABORT_CHANGES) {
            if let Some(mut mounted) = guard.take() {
                if mounted.dirty {
                    info!("archive: discarding pending changes of {}", self.mount_point);
                }
                for e in mounted.release_all(&self.pool) {
                    builder.warn(SyncIssue::warning(self.mount_point.clone(), e));
                }
            }
            return Ok(());
        }
        if let Some(mounted) = guard.as_mut() {
            if mounted.dirty {
                self.commit(mounted)?;
                mounted.dirty = false;
                mounted.exists = true;
            }
        }
        if options.contains(SyncOptions::CLEAR_CACHE) {
            if let Some(mut mounted) = guard.take() {
                debug!("archive: unmounting {}", self.mount_point);
                for e in mounted.release_all(&self.pool) {
                    builder.warn(SyncIssue::warning(self.mount_point.clone(), e));
                }
            }
        }
        Ok(())
    }

    fn pending_resources(&self) -> usize {
        // Never block here: the caller may hold the registry lock that a
        // concurrent commit needs.
        match self.state.try_lock() {
            Some(guard) => guard.as_ref().map(|m| m.buffers() + usize::from(m.dirty)).unwrap_or(0),
            None => 1,
        }
    }
}
