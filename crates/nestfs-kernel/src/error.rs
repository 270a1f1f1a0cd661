//! Error types for the kernel.

use thiserror::Error;

use crate::exceptions::SyncError;

/// Result type alias for kernel operations.
pub type FsResult<T> = Result<T, FsError>;

/// Error variants for kernel operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An address could not be parsed or escapes its root.
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending address text.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The entry or mount point does not resolve.
    #[error("Not found: {path}")]
    NotFound {
        /// The address that did not resolve.
        path: String,
    },

    /// The target is transiently unavailable; the caller may retry later.
    #[error("Busy: {path}: {reason}")]
    Busy {
        /// The busy address.
        path: String,
        /// What is holding it.
        reason: String,
    },

    /// A mutation was attempted on a read-only file system view.
    #[error("Read-only file system: {mount_point}")]
    ReadOnly {
        /// The read-only mount point.
        mount_point: String,
    },

    /// The entry already exists.
    #[error("Already exists: {path}")]
    AlreadyExists {
        /// The existing address.
        path: String,
    },

    /// A path component that must be a directory is not one.
    #[error("Not a directory: {path}")]
    NotADirectory {
        /// The offending address.
        path: String,
    },

    /// Byte content was requested from a directory.
    #[error("Is a directory: {path}")]
    IsADirectory {
        /// The directory address.
        path: String,
    },

    /// A directory still has members.
    #[error("Directory not empty: {path}")]
    NotEmpty {
        /// The non-empty directory.
        path: String,
    },

    /// Temporary storage could not be allocated.
    #[error("Buffer pool exhausted: {reason}")]
    PoolExhausted {
        /// Description of the allocation failure.
        reason: String,
    },

    /// A buffer was handed back to the pool more than once.
    #[error("Buffer {id} released twice")]
    DoubleRelease {
        /// The buffer id.
        id: u64,
    },

    /// A buffer was accessed after it was released.
    #[error("Buffer {id} used after release")]
    BufferReleased {
        /// The buffer id.
        id: u64,
    },

    /// The stream was closed, possibly forcibly by a sync.
    #[error("Stream closed: {path}")]
    StreamClosed {
        /// The address the stream was opened for.
        path: String,
    },

    /// No driver is registered for the scheme.
    #[error("No driver registered for scheme {scheme:?}")]
    UnknownScheme {
        /// The unknown scheme.
        scheme: String,
    },

    /// The parent entry of an archive mount point is not an archive file.
    #[error("Not an archive: {path}: {reason}")]
    NotAnArchive {
        /// The parent entry address.
        path: String,
        /// Why it cannot be mounted.
        reason: String,
    },

    /// Archive content could not be decoded or encoded.
    #[error("Corrupt archive {path}: {reason}")]
    CorruptArchive {
        /// The archive address.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// The kernel that owned this controller has been dropped.
    #[error("Kernel detached from mount point {mount_point}")]
    Detached {
        /// The orphaned mount point.
        mount_point: String,
    },

    /// The requested operation is not supported by this file system.
    #[error("Operation not supported: {op}")]
    NotSupported {
        /// The operation name.
        op: String,
    },

    /// Invalid kernel configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more mount points failed to sync.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl FsError {
    /// Shorthand for [`FsError::NotFound`].
    pub fn not_found(path: impl ToString) -> Self {
        FsError::NotFound {
            path: path.to_string(),
        }
    }

    /// Shorthand for [`FsError::Busy`].
    pub fn busy(path: impl ToString, reason: impl Into<String>) -> Self {
        FsError::Busy {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors a caller may resolve by retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Busy { .. })
    }

    /// Maps the error onto the closest `std::io::ErrorKind`.
    pub fn kind(&self) -> std::io::ErrorKind {
        use std::io::ErrorKind;
        match self {
            FsError::Io(e) => e.kind(),
            FsError::InvalidAddress { .. } => ErrorKind::InvalidInput,
            FsError::NotFound { .. } => ErrorKind::NotFound,
            FsError::Busy { .. } => ErrorKind::WouldBlock,
            FsError::ReadOnly { .. } => ErrorKind::PermissionDenied,
            FsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FsError::NotADirectory { .. } => ErrorKind::NotADirectory,
            FsError::IsADirectory { .. } => ErrorKind::IsADirectory,
            FsError::NotEmpty { .. } => ErrorKind::DirectoryNotEmpty,
            FsError::PoolExhausted { .. } => ErrorKind::OutOfMemory,
            FsError::UnknownScheme { .. } | FsError::Config(_) => ErrorKind::InvalidInput,
            FsError::NotSupported { .. } => ErrorKind::Unsupported,
            FsError::CorruptArchive { .. } | FsError::NotAnArchive { .. } => {
                ErrorKind::InvalidData
            }
            _ => ErrorKind::Other,
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Io(io) => io,
            other => std::io::Error::new(other.kind(), other),
        }
    }
}
