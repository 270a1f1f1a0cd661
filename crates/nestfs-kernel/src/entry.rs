//! Format-agnostic entry metadata.

use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The type of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Regular file with byte content.
    File,
    /// Directory containing other entries.
    Directory,
    /// Anything else the backing format can represent.
    Special,
}

/// Which size of an entry is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// Uncompressed length of the content.
    Data,
    /// Bytes the content occupies in the backing store.
    Storage,
}

/// Which access timestamp is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Creation time.
    Create,
    /// Last read.
    Read,
    /// Last modification.
    Write,
}

/// Metadata for one entry inside a file system level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Canonical name of the entry inside its level.
    pub name: String,
    /// Entry type.
    pub kind: EntryType,
    /// Content length in bytes, if known.
    pub data_size: Option<u64>,
    /// Stored length in bytes, if known.
    pub storage_size: Option<u64>,
    /// Last modification time.
    pub modified: Option<SystemTime>,
    /// Last access time.
    pub accessed: Option<SystemTime>,
    /// Creation time.
    pub created: Option<SystemTime>,
    /// Base names of the direct members, for directories.
    pub members: Option<BTreeSet<String>>,
}

impl Entry {
    /// A file entry with unknown size.
    pub fn file(name: impl Into<String>) -> Self {
        Self::with_kind(name, EntryType::File)
    }

    /// An empty directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        let mut entry = Self::with_kind(name, EntryType::Directory);
        entry.members = Some(BTreeSet::new());
        entry
    }

    /// An entry of the given type with no sizes or times set.
    pub fn with_kind(name: impl Into<String>, kind: EntryType) -> Self {
        Self {
            name: name.into(),
            kind,
            data_size: None,
            storage_size: None,
            modified: None,
            accessed: None,
            created: None,
            members: None,
        }
    }

    /// Returns true for directories.
    pub fn is_directory(&self) -> bool {
        self.kind == EntryType::Directory
    }

    /// Returns true for regular files.
    pub fn is_file(&self) -> bool {
        self.kind == EntryType::File
    }

    /// Returns the requested size.
    pub fn size(&self, size: Size) -> Option<u64> {
        match size {
            Size::Data => self.data_size,
            Size::Storage => self.storage_size,
        }
    }

    /// Returns the requested timestamp.
    pub fn time(&self, access: Access) -> Option<SystemTime> {
        match access {
            Access::Create => self.created,
            Access::Read => self.accessed,
            Access::Write => self.modified,
        }
    }

    /// Sets a timestamp.
    pub fn set_time(&mut self, access: Access, time: SystemTime) {
        match access {
            Access::Create => self.created = Some(time),
            Access::Read => self.accessed = Some(time),
            Access::Write => self.modified = Some(time),
        }
    }

    /// Copies the timestamps of `template` that are set onto `self`.
    pub fn apply_times(&mut self, template: &Entry) {
        for access in [Access::Create, Access::Read, Access::Write] {
            if let Some(t) = template.time(access) {
                self.set_time(access, t);
            }
        }
    }
}
