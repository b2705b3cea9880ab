//! Errors surfaced by the filesystem core.

use thiserror::Error;

use crate::store::{StoreError, Version};

/// Result type of every [`ContainerFs`](crate::fs::container_fs::ContainerFs) operation.
pub type FsResult<T> = Result<T, FsError>;

/// Errors returned by the filesystem core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    /// No live entry exists at the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live entry already exists at the path.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The descriptor is not open, or is not open on the given path.
    #[error("invalid file descriptor")]
    InvalidDescriptor,

    /// Another writer committed first.
    #[error("version conflict on {key}: expected {expected}, current {current:?}")]
    VersionConflict {
        /// The key being committed.
        key: String,
        /// The version this commit asked for.
        expected: Version,
        /// The version the store holds.
        current: Option<Version>,
    },

    /// The operation is not supported on this path or with these arguments.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// The remote store failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The account ran out of balance or quota.
    #[error("account balance or storage quota exhausted")]
    QuotaExceeded,

    /// A write landed before the current write cursor.
    #[error("write at offset {offset} is behind the write cursor at {cursor}")]
    BackwardWrite {
        /// Current write cursor.
        cursor: u64,
        /// Requested write offset.
        offset: u64,
    },

    /// The path names a container, not a file.
    #[error("is a container: {0}")]
    IsAContainer(String),
}

impl FsError {
    /// The closest POSIX errno for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::InvalidDescriptor => libc::EBADF,
            Self::VersionConflict { .. } => libc::ESTALE,
            Self::Unimplemented(_) => libc::ENOSYS,
            Self::Backend(_) => libc::EIO,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::BackwardWrite { .. } => libc::ESPIPE,
            Self::IsAContainer(_) => libc::EISDIR,
        }
    }

    /// Whether the failure came from the account running dry.
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded)
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::VersionConflict {
                key,
                expected,
                current,
            } => Self::VersionConflict {
                key,
                expected,
                current,
            },
            StoreError::QuotaExceeded => Self::QuotaExceeded,
            StoreError::EmptyContent | StoreError::InvalidHandle(_) | StoreError::Backend(_) => {
                Self::Backend(e.to_string())
            }
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        Self::from_raw_os_error(e.errno())
    }
}
