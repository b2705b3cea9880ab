//! The remote container store this crate wraps.
//!
//! A store holds *containers*: flat, versioned key → value maps. Values are
//! either stored-file records (pointing at immutable blob content), pointers
//! to nested containers, raw user metadata, or a soft-deleted placeholder.
//! Every entry carries a version; updates and deletes must name
//! `current_version + 1` or they fail with [`StoreError::VersionConflict`].
//!
//! Large values are accessed through a file-like *blob layer*:
//! [`RemoteStore::open`] / [`read`](RemoteStore::read) /
//! [`write`](RemoteStore::write) / [`close`](RemoteStore::close). Closing a
//! write handle yields a new [`StoredFile`] which only becomes visible once it
//! is committed into a container entry with [`RemoteStore::mutate`].

/// In-memory store, used by tests and the CLI.
pub mod memory;

use std::future::Future;
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

/// Version of a single container entry.
pub type Version = u64;

/// Key reserved in every container for user-supplied container metadata.
///
/// It is never listed and never participates in prefix matching.
pub const METADATA_KEY: &str = "_metadata";

/// Address of a remote container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u64);

/// Address of an immutable blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobAddr(pub u64);

/// A handle returned by [`RemoteStore::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenHandle(pub u64);

/// The mode a blob is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Read the existing content.
    Read,
    /// Start from empty content, discarding what was there.
    Overwrite,
    /// Start from the existing content and write after its end.
    Append,
}

impl OpenMode {
    /// Whether this mode produces a new blob on close.
    #[must_use]
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// What a nested container is used for. Determines how the namespace node
/// wrapping it interprets its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// A default container: files and nested containers.
    Default,
    /// A per-name service container: every entry points at a nested container.
    Services,
    /// A blob store: files only.
    Blob,
}

/// A committed file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Where the content lives. `None` for empty content.
    pub blob: Option<BlobAddr>,
    /// Content length in bytes.
    pub size: u64,
    /// When the file was first written.
    pub created: SystemTime,
    /// When the content last changed.
    pub modified: SystemTime,
    /// Opaque user metadata stored alongside the file.
    pub user_metadata: Bytes,
}

/// The value stored under a container key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    /// A file record.
    File(StoredFile),
    /// A pointer to a nested container.
    Container {
        /// Address of the nested container.
        id: ContainerId,
        /// How the nested container is used.
        kind: ContainerKind,
    },
    /// Raw user metadata (only under [`METADATA_KEY`]).
    Metadata(Bytes),
    /// A soft-deleted entry. The key keeps its version history.
    Deleted,
}

impl EntryValue {
    /// Whether this entry is live (not soft-deleted).
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

/// A single `(key, value, version)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// The entry key.
    pub key: String,
    /// The entry value.
    pub value: EntryValue,
    /// The entry version.
    pub version: Version,
}

/// The result of fetching one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEntry {
    /// The value under the key (possibly [`EntryValue::Deleted`]).
    pub value: EntryValue,
    /// The entry version.
    pub version: Version,
}

/// Versioned mutations accepted by [`RemoteStore::mutate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutateOp {
    /// Create a key that has never existed. The entry starts at version 0.
    Insert,
    /// Replace the value of an existing key.
    Update,
    /// Soft-delete an existing key.
    Delete,
}

/// Errors reported by a [`RemoteStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key or container does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed.
    #[error("version conflict on {key}: expected {expected}, current {current:?}")]
    VersionConflict {
        /// The key being mutated.
        key: String,
        /// The version the caller asked for.
        expected: Version,
        /// The version the store holds, if the key exists.
        current: Option<Version>,
    },

    /// The account ran out of balance or storage quota.
    #[error("account balance or storage quota exhausted")]
    QuotaExceeded,

    /// The blob layer refuses to open zero-length content for reading.
    #[error("cannot open empty content for reading")]
    EmptyContent,

    /// The handle is not open.
    #[error("invalid blob handle {0:?}")]
    InvalidHandle(OpenHandle),

    /// Any other transport or storage failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// The remote backend consumed by the core.
///
/// Every method is a suspension point; implementations decide how (and
/// whether) they talk to the network.
pub trait RemoteStore: Clone + Send + Sync + 'static {
    /// Fetch the value and version stored under `key`.
    fn fetch(
        &self,
        container: ContainerId,
        key: &str,
    ) -> impl Future<Output = Result<FetchedEntry, StoreError>> + Send;

    /// Open a blob for reading or writing.
    ///
    /// `file` is the committed record to start from; `None` opens fresh
    /// content (only meaningful for writable modes).
    fn open(
        &self,
        file: Option<&StoredFile>,
        mode: OpenMode,
    ) -> impl Future<Output = Result<OpenHandle, StoreError>> + Send;

    /// Read up to `len` bytes from `offset`.
    fn read(
        &self,
        handle: OpenHandle,
        offset: u64,
        len: u64,
    ) -> impl Future<Output = Result<Bytes, StoreError>> + Send;

    /// Append `data` to a writable handle.
    fn write(
        &self,
        handle: OpenHandle,
        data: Bytes,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Current content length seen through `handle`.
    fn size(&self, handle: OpenHandle) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Close a handle. Writable handles yield the new, uncommitted file record.
    fn close(
        &self,
        handle: OpenHandle,
    ) -> impl Future<Output = Result<Option<StoredFile>, StoreError>> + Send;

    /// Apply a versioned mutation to `key` in `container`.
    fn mutate(
        &self,
        container: ContainerId,
        op: MutateOp,
        key: &str,
        payload: Option<EntryValue>,
        expected_version: Option<Version>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Enumerate every entry of `container`, including soft-deleted ones.
    ///
    /// The stream is single-pass; call again to re-enumerate.
    fn entries(&self, container: ContainerId) -> BoxStream<'static, Result<StoreEntry, StoreError>>;
}
