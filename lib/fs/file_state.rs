use std::time::SystemTime;

use bytes::Bytes;
use tracing::{trace, warn};

use super::{ItemAttributes, ItemType};
use crate::error::{FsError, FsResult};
use crate::store::{OpenHandle, OpenMode, RemoteStore, StoreError, StoredFile, Version};

/// Where a [`FileState`] is in its lifecycle.
///
/// New files go `Closed → Creating → OpenWrite → Closed`. Existing files go
/// `Closed → Fetching → OpenRead | EmptyRead | OpenWrite → Closed`.
/// `Deleted` marks a key that exists remotely but holds a soft-deleted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No remote handle.
    Closed,
    /// A fresh write handle is being opened.
    Creating,
    /// An existing blob is being opened.
    Fetching,
    /// Open for reading through a remote handle.
    OpenRead,
    /// Open for reading a zero-length file. No remote handle exists.
    EmptyRead,
    /// Open for writing.
    OpenWrite,
    /// The key holds a soft-deleted entry.
    Deleted,
}

/// One in-progress interaction with one remote blob.
///
/// Holds at most one remote handle. `modified` is set by writes, truncation
/// and metadata changes, and is cleared by every successful open and close.
#[derive(Debug)]
pub struct FileState {
    item_path: String,
    has_key: bool,
    snapshot: Option<StoredFile>,
    opened_at_version: Option<Version>,
    open_handle: Option<OpenHandle>,
    mode: Option<OpenMode>,
    write_cursor: u64,
    modified: bool,
    pending_metadata: Option<Bytes>,
    phase: Phase,
    created_at: SystemTime,
}

impl FileState {
    /// State for a path with no remote key.
    pub fn new_file(item_path: impl Into<String>) -> Self {
        Self::from_entry(item_path, None, None)
    }

    /// State for a path whose remote entry was fetched.
    ///
    /// `version` is `None` when the key does not exist. A key with a version
    /// but no file record is a soft-deleted placeholder.
    pub fn from_entry(
        item_path: impl Into<String>,
        snapshot: Option<StoredFile>,
        version: Option<Version>,
    ) -> Self {
        let has_key = version.is_some();
        let phase = if has_key && snapshot.is_none() {
            Phase::Deleted
        } else {
            Phase::Closed
        };
        Self {
            item_path: item_path.into(),
            has_key,
            created_at: snapshot
                .as_ref()
                .map_or_else(SystemTime::now, |s| s.created),
            snapshot,
            opened_at_version: version,
            open_handle: None,
            mode: None,
            write_cursor: 0,
            modified: false,
            pending_metadata: None,
            phase,
        }
    }

    /// The namespace path this state was opened on.
    #[must_use]
    pub fn item_path(&self) -> &str {
        &self.item_path
    }

    /// Whether the remote key exists (possibly soft-deleted).
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.has_key
    }

    /// The fetched stored-file record, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&StoredFile> {
        self.snapshot.as_ref()
    }

    /// Entry version observed when this state was built.
    #[must_use]
    pub fn opened_at_version(&self) -> Option<Version> {
        self.opened_at_version
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Open mode, `None` when closed.
    #[must_use]
    pub fn mode(&self) -> Option<OpenMode> {
        self.mode
    }

    /// Whether there is anything to commit.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Offset the next sequential write lands at.
    #[must_use]
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    /// Attributes as seen through this open file.
    #[must_use]
    pub fn attributes(&self) -> ItemAttributes {
        let size = match self.phase {
            Phase::OpenWrite => self.write_cursor,
            _ => self.snapshot.as_ref().map_or(0, |s| s.size),
        };
        ItemAttributes {
            item_type: if self.snapshot.is_some() {
                ItemType::File
            } else {
                ItemType::NewFile
            },
            size,
            version: self.opened_at_version.unwrap_or(0),
            created: self.created_at,
            modified: self.snapshot.as_ref().map_or(self.created_at, |s| s.modified),
        }
    }

    /// Open a fresh write handle for a file with no content yet.
    pub async fn create<S: RemoteStore>(&mut self, store: &S) -> FsResult<()> {
        self.discard_handle(store).await;
        self.phase = Phase::Creating;
        match store.open(None, OpenMode::Overwrite).await {
            Ok(handle) => {
                self.open_handle = Some(handle);
                self.mode = Some(OpenMode::Overwrite);
                self.write_cursor = 0;
                self.modified = true;
                self.phase = Phase::OpenWrite;
                trace!(path = %self.item_path, "file state: created");
                Ok(())
            }
            Err(e) => {
                self.reset_phase();
                Err(e.into())
            }
        }
    }

    /// Open the blob in `mode`.
    ///
    /// Writable modes start a new blob from the snapshot (or from nothing).
    /// Reading a zero-length file opens no remote handle.
    pub async fn open<S: RemoteStore>(&mut self, store: &S, mode: OpenMode) -> FsResult<()> {
        self.discard_handle(store).await;
        self.phase = Phase::Fetching;
        let result = match mode {
            OpenMode::Read => self.open_read(store).await,
            OpenMode::Overwrite | OpenMode::Append => self.open_write(store, mode).await,
        };
        match &result {
            Ok(()) => {
                trace!(path = %self.item_path, phase = ?self.phase, "file state: opened");
            }
            Err(_) => self.reset_phase(),
        }
        result
    }

    async fn open_read<S: RemoteStore>(&mut self, store: &S) -> FsResult<()> {
        let Some(file) = self.snapshot.as_ref() else {
            return Err(FsError::NotFound(self.item_path.clone()));
        };
        let handle = if file.size == 0 {
            None
        } else {
            match store.open(Some(file), OpenMode::Read).await {
                Ok(handle) => Some(handle),
                Err(StoreError::EmptyContent) => None,
                Err(e) => return Err(e.into()),
            }
        };
        self.phase = if handle.is_some() {
            Phase::OpenRead
        } else {
            Phase::EmptyRead
        };
        self.open_handle = handle;
        self.mode = Some(OpenMode::Read);
        self.write_cursor = 0;
        self.modified = false;
        Ok(())
    }

    async fn open_write<S: RemoteStore>(&mut self, store: &S, mode: OpenMode) -> FsResult<()> {
        let handle = store.open(self.snapshot.as_ref(), mode).await?;
        let cursor = if mode == OpenMode::Append {
            match store.size(handle).await {
                Ok(size) => size,
                Err(e) => {
                    if let Err(close_err) = store.close(handle).await {
                        warn!(path = %self.item_path, error = %close_err, "failed to close handle after size probe failure");
                    }
                    return Err(e.into());
                }
            }
        } else {
            0
        };
        self.open_handle = Some(handle);
        self.mode = Some(mode);
        self.write_cursor = cursor;
        // A file with no committed content must be committed even if empty.
        self.modified = self.snapshot.is_none();
        self.phase = Phase::OpenWrite;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`, clamped to the current size.
    pub async fn read<S: RemoteStore>(&self, store: &S, offset: u64, len: u64) -> FsResult<Bytes> {
        let size = match self.phase {
            Phase::EmptyRead => return Ok(Bytes::new()),
            Phase::OpenRead => self.snapshot.as_ref().map_or(0, |s| s.size),
            Phase::OpenWrite => self.write_cursor,
            _ => return Err(FsError::InvalidDescriptor),
        };
        let Some(handle) = self.open_handle else {
            return Err(FsError::InvalidDescriptor);
        };
        if offset >= size || len == 0 {
            return Ok(Bytes::new());
        }
        let len = len.min(size - offset);
        Ok(store.read(handle, offset, len).await?)
    }

    /// Read into `buf` at `offset`. Returns the number of bytes copied.
    pub async fn read_buf<S: RemoteStore>(
        &self,
        store: &S,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let data = self.read(store, offset, buf.len() as u64).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Write `data` at `offset`.
    ///
    /// Writes are sequential. A gap between the cursor and `offset` is filled
    /// with zeros; an offset behind the cursor fails with
    /// [`FsError::BackwardWrite`].
    pub async fn write<S: RemoteStore>(
        &mut self,
        store: &S,
        offset: u64,
        data: Bytes,
    ) -> FsResult<u64> {
        let (Phase::OpenWrite, Some(handle)) = (self.phase, self.open_handle) else {
            return Err(FsError::InvalidDescriptor);
        };
        if offset < self.write_cursor {
            return Err(FsError::BackwardWrite {
                cursor: self.write_cursor,
                offset,
            });
        }
        if offset > self.write_cursor {
            let gap = usize::try_from(offset - self.write_cursor)
                .map_err(|_| FsError::Unimplemented("write gap larger than addressable memory"))?;
            store.write(handle, Bytes::from(vec![0u8; gap])).await?;
            self.write_cursor = offset;
            self.modified = true;
        }
        if data.is_empty() {
            return Ok(0);
        }
        let written = data.len() as u64;
        store.write(handle, data).await?;
        self.write_cursor += written;
        self.modified = true;
        Ok(written)
    }

    /// Write a borrowed buffer at `offset`.
    pub async fn write_buf<S: RemoteStore>(
        &mut self,
        store: &S,
        offset: u64,
        buf: &[u8],
    ) -> FsResult<u64> {
        self.write(store, offset, Bytes::copy_from_slice(buf)).await
    }

    /// Truncate to `size`. Only zero is supported.
    pub async fn truncate<S: RemoteStore>(&mut self, store: &S, size: u64) -> FsResult<()> {
        if size != 0 {
            return Err(FsError::Unimplemented("truncate to a non-zero size"));
        }
        self.discard_handle(store).await;
        match store.open(self.snapshot.as_ref(), OpenMode::Overwrite).await {
            Ok(handle) => {
                self.open_handle = Some(handle);
                self.mode = Some(OpenMode::Overwrite);
                self.write_cursor = 0;
                self.modified = true;
                self.phase = Phase::OpenWrite;
                Ok(())
            }
            Err(e) => {
                self.reset_phase();
                Err(e.into())
            }
        }
    }

    /// User metadata as seen through this open file.
    #[must_use]
    pub fn user_metadata(&self) -> Bytes {
        self.pending_metadata
            .clone()
            .or_else(|| self.snapshot.as_ref().map(|s| s.user_metadata.clone()))
            .unwrap_or_default()
    }

    /// Stage new user metadata. It is committed on close.
    pub fn set_user_metadata(&mut self, metadata: Bytes) -> FsResult<()> {
        if matches!(self.phase, Phase::Closed | Phase::Deleted) {
            return Err(FsError::InvalidDescriptor);
        }
        self.pending_metadata = Some(metadata);
        self.modified = true;
        Ok(())
    }

    /// Close the remote handle.
    ///
    /// Returns the record to commit when something changed, `None` otherwise.
    /// Committing is left to the caller.
    pub async fn close<S: RemoteStore>(&mut self, store: &S) -> FsResult<Option<StoredFile>> {
        let closed = match self.open_handle.take() {
            Some(handle) => store.close(handle).await,
            None => Ok(None),
        };
        let was_modified = self.modified;
        self.reset_phase();
        let record = closed?;
        if !was_modified {
            return Ok(None);
        }
        let mut record = record.or_else(|| self.snapshot.clone());
        if let (Some(record), Some(metadata)) = (record.as_mut(), self.pending_metadata.take()) {
            record.user_metadata = metadata;
        }
        trace!(path = %self.item_path, size = ?record.as_ref().map(|r| r.size), "file state: closed");
        Ok(record)
    }

    /// Adopt a freshly committed record as the new snapshot.
    pub fn mark_committed(&mut self, file: StoredFile, version: Version) {
        self.snapshot = Some(file);
        self.has_key = true;
        self.opened_at_version = Some(version);
        self.pending_metadata = None;
        self.modified = false;
    }

    /// Drop the remote handle and every cached field.
    pub async fn destroy<S: RemoteStore>(&mut self, store: &S) {
        self.discard_handle(store).await;
        self.snapshot = None;
        self.pending_metadata = None;
        self.modified = false;
        self.mode = None;
        self.write_cursor = 0;
        self.phase = Phase::Closed;
    }

    async fn discard_handle<S: RemoteStore>(&mut self, store: &S) {
        if let Some(handle) = self.open_handle.take()
            && let Err(e) = store.close(handle).await
        {
            warn!(path = %self.item_path, error = %e, "failed to close discarded handle");
        }
    }

    fn reset_phase(&mut self) {
        self.open_handle = None;
        self.mode = None;
        self.write_cursor = 0;
        self.modified = false;
        self.phase = if self.has_key && self.snapshot.is_none() {
            Phase::Deleted
        } else {
            Phase::Closed
        };
    }
}
