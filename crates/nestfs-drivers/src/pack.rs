//! The pack archive format.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! "NPAK" | version: u8 | count: u32
//! count x ( header_len: u32 | header: bincode PackHeader | data_len: u64 | data )
//! ```

use std::io::{self, Read, Write};
use std::time::SystemTime;

use nestfs_kernel::{ArchiveCodec, ArchiveDriver, ArchiveMember, Entry, EntryType, FsError, FsResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Leading magic bytes of every pack archive.
pub const PACK_MAGIC: [u8; 4] = *b"NPAK";

/// Current format version.
pub const PACK_VERSION: u8 = 1;

/// Upper bound for one serialized member header.
const MAX_HEADER_LEN: u64 = 64 * 1024;

/// Ways a pack archive can be malformed.
#[derive(Debug, Error)]
pub enum PackError {
    /// The magic bytes do not match.
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),

    /// Written by a newer format version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// A member header is unreasonably large.
    #[error("member header of {0} bytes exceeds limit")]
    HeaderTooLarge(u64),

    /// A member header could not be decoded or encoded.
    #[error("member header: {0}")]
    Header(#[from] bincode::Error),

    /// The archive ends before the declared content.
    #[error("truncated member {name:?}: {missing} byte(s) missing")]
    Truncated {
        /// Member name.
        name: String,
        /// Bytes still expected.
        missing: u64,
    },

    /// Member content changed length while being written.
    #[error("member {name:?} declared {declared} byte(s) but yielded {actual}")]
    LengthMismatch {
        /// Member name.
        name: String,
        /// Declared length.
        declared: u64,
        /// Bytes actually copied.
        actual: u64,
    },
}

impl From<PackError> for FsError {
    fn from(e: PackError) -> Self {
        FsError::CorruptArchive {
            path: String::new(),
            reason: e.to_string(),
        }
    }
}

/// Per-member metadata stored in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PackHeader {
    name: String,
    kind: EntryType,
    modified: Option<SystemTime>,
    created: Option<SystemTime>,
}

/// Fills `buf`, reporting an early end of input as a truncated archive.
fn read_exact(source: &mut dyn Read, buf: &mut [u8]) -> FsResult<()> {
    let wanted = buf.len() as u64;
    source.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FsError::from(PackError::Truncated {
            name: String::new(),
            missing: wanted,
        }),
        _ => FsError::Io(e),
    })
}

fn read_array<const N: usize>(source: &mut dyn Read) -> FsResult<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact(source, &mut buf)?;
    Ok(buf)
}

/// Codec for pack archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackCodec;

impl ArchiveCodec for PackCodec {
    fn decode(
        &self,
        source: &mut dyn Read,
        visit: &mut dyn FnMut(Entry, &mut dyn Read) -> FsResult<()>,
    ) -> FsResult<()> {
        let magic = read_array::<4>(source)?;
        if magic != PACK_MAGIC {
            return Err(PackError::BadMagic(magic).into());
        }
        let [version] = read_array::<1>(source)?;
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version).into());
        }
        let count = u32::from_le_bytes(read_array::<4>(source)?);

        for _ in 0..count {
            let header_len = u64::from(u32::from_le_bytes(read_array::<4>(source)?));
            if header_len > MAX_HEADER_LEN {
                return Err(PackError::HeaderTooLarge(header_len).into());
            }
            let mut raw = vec![0u8; header_len as usize];
            read_exact(source, &mut raw)?;
            let header: PackHeader = bincode::deserialize(&raw).map_err(PackError::from)?;
            let data_len = u64::from_le_bytes(read_array::<8>(source)?);

            let mut entry = Entry::with_kind(header.name.clone(), header.kind);
            entry.modified = header.modified;
            entry.created = header.created;
            if header.kind == EntryType::File {
                entry.data_size = Some(data_len);
                entry.storage_size = Some(data_len);
            }

            let mut content = (&mut *source).take(data_len);
            visit(entry, &mut content)?;
            // Skip whatever the visitor left unread.
            io::copy(&mut content, &mut io::sink())?;
            if content.limit() > 0 {
                return Err(PackError::Truncated {
                    name: header.name,
                    missing: content.limit(),
                }
                .into());
            }
            trace!("pack: decoded {} ({} bytes)", header.name, data_len);
        }
        Ok(())
    }

    fn encode(&self, members: &[ArchiveMember], sink: &mut dyn Write) -> FsResult<()> {
        sink.write_all(&PACK_MAGIC)?;
        sink.write_all(&[PACK_VERSION])?;
        let count = u32::try_from(members.len())
            .map_err(|_| FsError::NotSupported { op: format!("pack of {} members", members.len()) })?;
        sink.write_all(&count.to_le_bytes())?;

        for member in members {
            let header = PackHeader {
                name: member.entry.name.clone(),
                kind: member.entry.kind,
                modified: member.entry.modified,
                created: member.entry.created,
            };
            let raw = bincode::serialize(&header).map_err(PackError::from)?;
            let header_len = raw.len() as u64;
            if header_len > MAX_HEADER_LEN {
                return Err(PackError::HeaderTooLarge(header_len).into());
            }
            sink.write_all(&(header_len as u32).to_le_bytes())?;
            sink.write_all(&raw)?;

            let declared = match &member.content {
                Some(buffer) => buffer.len()?,
                None => 0,
            };
            sink.write_all(&declared.to_le_bytes())?;
            if let Some(buffer) = &member.content {
                let actual = io::copy(&mut buffer.input()?, sink)?;
                if actual != declared {
                    return Err(PackError::LengthMismatch {
                        name: header.name,
                        declared,
                        actual,
                    }
                    .into());
                }
            }
        }
        sink.flush()?;
        Ok(())
    }
}

/// Driver for pack archives.
pub type PackDriver = ArchiveDriver<PackCodec>;
