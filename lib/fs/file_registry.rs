use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, trace, warn};

use super::descriptor::DescriptorTable;
use super::entry_index::IndexCell;
use super::file_state::FileState;
use super::path::{join, parent};
use super::{Descriptor, ItemAttributes, NodeId};
use crate::cache::{CachedResult, Op, OperationResultCache};
use crate::error::{FsError, FsResult};
use crate::session::Session;
use crate::store::{
    ContainerId, EntryValue, FetchedEntry, METADATA_KEY, MutateOp, OpenMode, RemoteStore,
    StoreError, StoredFile, Version,
};

/// Collaborators shared by every node of one filesystem.
pub struct FsContext<S: RemoteStore> {
    /// The remote backend.
    pub store: S,
    /// Process-wide descriptor table.
    pub descriptors: Arc<DescriptorTable>,
    /// Listing and attribute cache.
    pub cache: Arc<OperationResultCache>,
    /// Account session, told about quota exhaustion.
    pub session: Arc<dyn Session>,
}

impl<S: RemoteStore> Clone for FsContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            descriptors: Arc::clone(&self.descriptors),
            cache: Arc::clone(&self.cache),
            session: Arc::clone(&self.session),
        }
    }
}

/// What was last fetched for a key.
#[derive(Debug, Clone)]
struct FetchedFile {
    file: Option<StoredFile>,
    /// `None` if the key does not exist at all.
    version: Option<Version>,
}

impl FetchedFile {
    const ABSENT: Self = Self {
        file: None,
        version: None,
    };
}

/// Path-based file operations over one container.
///
/// Turns calls into [`FileState`] transitions and versioned commits. Caches
/// the last fetched record per key until the key is committed, deleted or an
/// operation on it fails. Every commit invalidates the owning node's entry
/// index and the affected result-cache entries before returning.
pub struct ContainerFileRegistry<S: RemoteStore> {
    ctx: FsContext<S>,
    container: ContainerId,
    node: NodeId,
    node_path: String,
    index: Arc<IndexCell>,
    snapshots: scc::HashMap<String, FetchedFile>,
    /// Files created here and not yet committed, by key.
    pending_creates: scc::HashMap<String, Descriptor>,
    /// Descriptor pairs bound to one shared append state, in both directions.
    shared_with: scc::HashMap<Descriptor, Descriptor>,
}

impl<S: RemoteStore> std::fmt::Debug for ContainerFileRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFileRegistry")
            .field("node", &self.node)
            .field("node_path", &self.node_path)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> ContainerFileRegistry<S> {
    /// A registry for `container`, owned by `node` mounted at `node_path`.
    pub fn new(
        ctx: FsContext<S>,
        container: ContainerId,
        node: NodeId,
        node_path: impl Into<String>,
        index: Arc<IndexCell>,
    ) -> Self {
        Self {
            ctx,
            container,
            node,
            node_path: node_path.into(),
            index,
            snapshots: scc::HashMap::new(),
            pending_creates: scc::HashMap::new(),
            shared_with: scc::HashMap::new(),
        }
    }

    fn abs(&self, key: &str) -> String {
        join(&self.node_path, key)
    }

    fn check_key(&self, key: &str) -> FsResult<()> {
        if key.is_empty() {
            return Err(FsError::IsAContainer(self.node_path.clone()));
        }
        if key == METADATA_KEY {
            return Err(FsError::NotFound(self.abs(key)));
        }
        Ok(())
    }

    /// Handle a failure on `key` outside any open file.
    fn fail(&self, key: &str, e: FsError) -> FsError {
        if self.snapshots.remove_sync(key).is_some() {
            warn!(path = %self.abs(key), error = %e, "dropping cached file record after failure");
        }
        if e.is_quota() {
            self.ctx.session.report_low_balance();
        }
        e
    }

    /// Handle a failure on an open file: tear the state down and release
    /// every descriptor bound to it.
    async fn fail_open(
        &self,
        key: &str,
        d: Descriptor,
        state: &mut FileState,
        e: FsError,
    ) -> FsError {
        state.destroy(&self.ctx.store).await;
        self.ctx.descriptors.release(d);
        if let Some(partner) = self.unshare(d) {
            self.ctx.descriptors.release(partner);
        }
        self.forget_pending(key, d);
        warn!(path = %self.abs(key), descriptor = d, error = %e, "destroyed open file after failure");
        self.fail(key, e)
    }

    /// Unbind `d` from the descriptor it shares state with, if any.
    fn unshare(&self, d: Descriptor) -> Option<Descriptor> {
        let (_, partner) = self.shared_with.remove_sync(&d)?;
        self.shared_with.remove_sync(&partner);
        Some(partner)
    }

    async fn fetch_snapshot(&self, key: &str) -> FsResult<FetchedFile> {
        if let Some(hit) = self.snapshots.read_sync(key, |_, s| s.clone()) {
            trace!(path = %self.abs(key), "reusing fetched file record");
            return Ok(hit);
        }
        let fetched = match self.ctx.store.fetch(self.container, key).await {
            Ok(FetchedEntry {
                value: EntryValue::File(file),
                version,
            }) => FetchedFile {
                file: Some(file),
                version: Some(version),
            },
            Ok(FetchedEntry {
                value: EntryValue::Deleted,
                version,
            }) => FetchedFile {
                file: None,
                version: Some(version),
            },
            Ok(FetchedEntry {
                value: EntryValue::Container { .. },
                ..
            }) => return Err(FsError::IsAContainer(self.abs(key))),
            Ok(FetchedEntry {
                value: EntryValue::Metadata(_),
                ..
            })
            | Err(StoreError::NotFound(_)) => FetchedFile::ABSENT,
            Err(e) => return Err(self.fail(key, e.into())),
        };
        self.snapshots.upsert_sync(key.to_owned(), fetched.clone());
        Ok(fetched)
    }

    fn live_pending_create(&self, key: &str) -> Option<Descriptor> {
        let d = self.pending_creates.read_sync(key, |_, d| *d)?;
        if self.ctx.descriptors.lookup(d).is_some() {
            Some(d)
        } else {
            self.pending_creates.remove_sync(key);
            None
        }
    }

    async fn lock_open(&self, key: &str, d: Descriptor) -> FsResult<OwnedMutexGuard<FileState>> {
        let shared = self
            .ctx
            .descriptors
            .lookup(d)
            .ok_or(FsError::InvalidDescriptor)?;
        let state = shared.lock_owned().await;
        if state.item_path() != self.abs(key) {
            return Err(FsError::InvalidDescriptor);
        }
        Ok(state)
    }

    /// Attributes to report for a key with no committed entry, if a create
    /// is in flight for it.
    #[must_use]
    pub fn pending_attributes(&self, key: &str) -> Option<ItemAttributes> {
        self.live_pending_create(key)
            .map(|_| ItemAttributes::new_file())
    }

    /// Open `key` in `mode`.
    ///
    /// Writable modes on a missing key start a new file. If the key has no
    /// committed entry but a create for it is still open, that create is
    /// committed first and reopened for appending. A competing append then
    /// shares that state under its own descriptor, so neither writer loses
    /// the other's bytes.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn open_file(&self, key: &str, mode: OpenMode) -> FsResult<Descriptor> {
        self.check_key(key)?;
        let fetched = self.fetch_snapshot(key).await?;
        if fetched.file.is_none() {
            if let Some(pending) = self.live_pending_create(key) {
                return self.open_racing_create(key, pending, mode).await;
            }
            if mode == OpenMode::Read {
                return Err(FsError::NotFound(self.abs(key)));
            }
        }

        let creating = fetched.file.is_none();
        let mut state = FileState::from_entry(self.abs(key), fetched.file, fetched.version);
        if let Err(e) = state.open(&self.ctx.store, mode).await {
            return Err(self.fail(key, e));
        }
        let d = self.ctx.descriptors.allocate(state);
        if creating {
            self.track_create(key, d);
        }
        debug!(descriptor = d, "opened file");
        Ok(d)
    }

    async fn open_racing_create(
        &self,
        key: &str,
        pending: Descriptor,
        mode: OpenMode,
    ) -> FsResult<Descriptor> {
        let shared = self
            .ctx
            .descriptors
            .lookup(pending)
            .ok_or(FsError::InvalidDescriptor)?;
        let mut guard = Arc::clone(&shared).lock_owned().await;
        debug!(pending, "committing in-flight create for a competing open");
        self.close_and_commit(key, pending, &mut guard).await?;

        let snapshot = guard.snapshot().cloned();
        let version = guard.opened_at_version();
        let mut reopened = FileState::from_entry(self.abs(key), snapshot.clone(), version);
        if let Err(e) = reopened.open(&self.ctx.store, OpenMode::Append).await {
            return Err(self.fail_open(key, pending, &mut guard, e).await);
        }
        *guard = reopened;
        drop(guard);
        self.ctx.descriptors.restore(pending, Arc::clone(&shared));

        if mode == OpenMode::Append {
            let d = self.ctx.descriptors.share(&shared);
            self.shared_with.upsert_sync(d, pending);
            self.shared_with.upsert_sync(pending, d);
            debug!(descriptor = d, pending, "sharing append state with in-flight create");
            return Ok(d);
        }

        let mut state = FileState::from_entry(self.abs(key), snapshot, version);
        if let Err(e) = state.open(&self.ctx.store, mode).await {
            return Err(self.fail(key, e));
        }
        let d = self.ctx.descriptors.allocate(state);
        debug!(descriptor = d, pending, "opened file after committing in-flight create");
        Ok(d)
    }

    /// Stop tracking `d` as the create for `key`. A create that never
    /// committed must not keep reporting a new file.
    fn forget_pending(&self, key: &str, d: Descriptor) {
        if self
            .pending_creates
            .remove_if_sync(key, |pending| *pending == d)
            .is_some()
        {
            self.ctx.cache.invalidate(self.node, key, Op::ItemAttributes);
        }
    }

    fn track_create(&self, key: &str, d: Descriptor) {
        self.pending_creates.upsert_sync(key.to_owned(), d);
        let seen = self.ctx.cache.generation();
        self.ctx.cache.publish(
            seen,
            &self.abs(key),
            self.node,
            key,
            Op::ItemAttributes,
            CachedResult::Attributes(ItemAttributes::new_file()),
        );
    }

    /// Create a new, empty file at `key`, open for writing.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn create_file(&self, key: &str) -> FsResult<Descriptor> {
        self.check_key(key)?;
        let fetched = self.fetch_snapshot(key).await?;
        if fetched.file.is_some() || self.live_pending_create(key).is_some() {
            return Err(FsError::AlreadyExists(self.abs(key)));
        }
        let mut state = FileState::from_entry(self.abs(key), None, fetched.version);
        if let Err(e) = state.create(&self.ctx.store).await {
            return Err(self.fail(key, e));
        }
        let d = self.ctx.descriptors.allocate(state);
        self.track_create(key, d);
        debug!(descriptor = d, "created file");
        Ok(d)
    }

    /// Read up to `len` bytes at `offset`.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn read_file(
        &self,
        key: &str,
        d: Descriptor,
        offset: u64,
        len: u64,
    ) -> FsResult<Bytes> {
        let mut state = self.lock_open(key, d).await?;
        let result = state.read(&self.ctx.store, offset, len).await;
        match result {
            Ok(data) => Ok(data),
            Err(e) => Err(self.fail_open(key, d, &mut state, e).await),
        }
    }

    /// Read into `buf` at `offset`.
    #[instrument(skip(self, buf), fields(node = %self.node_path))]
    pub async fn read_file_buf(
        &self,
        key: &str,
        d: Descriptor,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let mut state = self.lock_open(key, d).await?;
        let result = state.read_buf(&self.ctx.store, offset, buf).await;
        match result {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail_open(key, d, &mut state, e).await),
        }
    }

    /// Write `data` at `offset`.
    #[instrument(skip(self, data), fields(node = %self.node_path, len = data.len()))]
    pub async fn write_file(
        &self,
        key: &str,
        d: Descriptor,
        offset: u64,
        data: Bytes,
    ) -> FsResult<u64> {
        let mut state = self.lock_open(key, d).await?;
        let result = state.write(&self.ctx.store, offset, data).await;
        match result {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail_open(key, d, &mut state, e).await),
        }
    }

    /// Write a borrowed buffer at `offset`.
    #[instrument(skip(self, buf), fields(node = %self.node_path, len = buf.len()))]
    pub async fn write_file_buf(
        &self,
        key: &str,
        d: Descriptor,
        offset: u64,
        buf: &[u8],
    ) -> FsResult<u64> {
        let mut state = self.lock_open(key, d).await?;
        let result = state.write_buf(&self.ctx.store, offset, buf).await;
        match result {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail_open(key, d, &mut state, e).await),
        }
    }

    /// Truncate the open file to `size`. Only zero is supported.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn truncate_file(&self, key: &str, d: Descriptor, size: u64) -> FsResult<()> {
        let mut state = self.lock_open(key, d).await?;
        let result = state.truncate(&self.ctx.store, size).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail_open(key, d, &mut state, e).await),
        }
    }

    /// User metadata of the open file.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn get_file_metadata(&self, key: &str, d: Descriptor) -> FsResult<Bytes> {
        let state = self.lock_open(key, d).await?;
        Ok(state.user_metadata())
    }

    /// Stage new user metadata on the open file. Committed on close.
    #[instrument(skip(self, metadata), fields(node = %self.node_path))]
    pub async fn set_file_metadata(
        &self,
        key: &str,
        d: Descriptor,
        metadata: Bytes,
    ) -> FsResult<()> {
        let mut state = self.lock_open(key, d).await?;
        match state.set_user_metadata(metadata) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail_open(key, d, &mut state, e).await),
        }
    }

    /// Attributes as seen through an open descriptor.
    pub async fn open_file_attributes(&self, key: &str, d: Descriptor) -> FsResult<ItemAttributes> {
        let state = self.lock_open(key, d).await?;
        Ok(state.attributes())
    }

    /// Close `d`, committing any change.
    ///
    /// A lost commit race fails with [`FsError::VersionConflict`]; nothing is
    /// rebased. The descriptor is released either way. A descriptor sharing
    /// the state keeps appending on top of what was just committed.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn close_file(&self, key: &str, d: Descriptor) -> FsResult<()> {
        let mut state = self.lock_open(key, d).await?;
        let partner = self.unshare(d);
        let result = self.close_and_commit(key, d, &mut state).await;
        self.ctx.descriptors.release(d);
        self.forget_pending(key, d);
        match (partner, result) {
            (Some(partner), Ok(_)) => {
                if let Err(e) = state.open(&self.ctx.store, OpenMode::Append).await {
                    return Err(self.fail_open(key, partner, &mut state, e).await);
                }
                debug!(descriptor = d, partner, "reopened shared append state after commit");
                Ok(())
            }
            (Some(partner), Err(e)) => {
                self.ctx.descriptors.release(partner);
                Err(e)
            }
            (None, result) => result.map(|_| ()),
        }
    }

    /// Close the remote handle of `state` and commit what it produced.
    ///
    /// Returns the committed version, or `None` if there was nothing to commit.
    async fn close_and_commit(
        &self,
        key: &str,
        d: Descriptor,
        state: &mut FileState,
    ) -> FsResult<Option<Version>> {
        let record = match state.close(&self.ctx.store).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.fail_open(key, d, state, e).await),
        };

        let (op, expected) = match state.opened_at_version() {
            Some(version) if state.has_key() => (MutateOp::Update, Some(version + 1)),
            _ => (MutateOp::Insert, None),
        };
        let payload = EntryValue::File(record.clone());
        self.attributes_changed(key);
        self.listing_changed(key);
        if let Err(e) = self
            .ctx
            .store
            .mutate(self.container, op, key, Some(payload), expected)
            .await
        {
            return Err(self.fail_open(key, d, state, e.into()).await);
        }

        let version = expected.unwrap_or(0);
        debug!(path = %self.abs(key), version, ?op, size = record.size, "committed file");
        self.snapshots.remove_sync(key);
        drop(self.pending_creates.remove_if_sync(key, |pending| *pending == d));
        // Results computed between the first invalidation and the commit are stale.
        self.attributes_changed(key);
        self.listing_changed(key);
        state.mark_committed(record, version);
        Ok(Some(version))
    }

    /// Soft-delete `key`. Returns whether it was the last live entry in its
    /// folder.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn delete_file(&self, key: &str) -> FsResult<bool> {
        self.delete_entry(key).await?;
        let was_last = self.deleted(key, None).await;
        debug!(path = %self.abs(key), was_last, "deleted file");
        Ok(was_last)
    }

    async fn delete_entry(&self, key: &str) -> FsResult<()> {
        self.check_key(key)?;
        let fetched = self.fetch_snapshot(key).await?;
        let (Some(_), Some(version)) = (fetched.file, fetched.version) else {
            return Err(FsError::NotFound(self.abs(key)));
        };
        self.index.invalidate();
        self.ctx.cache.invalidate_all(self.node, key);
        if let Some(folder) = parent(key) {
            self.ctx.cache.invalidate(self.node, folder, Op::ListFolder);
        }
        if let Err(e) = self
            .ctx
            .store
            .mutate(self.container, MutateOp::Delete, key, None, Some(version + 1))
            .await
        {
            return Err(self.fail(key, e.into()));
        }
        self.snapshots.remove_sync(key);
        self.index.invalidate();
        Ok(())
    }

    /// Invalidate after `key` was deleted (or renamed to `renamed_to`),
    /// cascading through every folder the rescanned container no longer has.
    /// Returns whether the folder that held `key` is now empty.
    async fn deleted(&self, key: &str, renamed_to: Option<&str>) -> bool {
        let folder = parent(key).unwrap_or_default();
        match self.index.get_or_load(&self.ctx.store, self.container).await {
            Ok(index) => {
                let folder_is_empty = |folder: &str| !index.has_live_under(folder, key);
                match renamed_to {
                    Some(new) => {
                        self.ctx
                            .cache
                            .invalidate_on_rename(self.node, key, new, &folder_is_empty);
                    }
                    None => {
                        self.ctx
                            .cache
                            .invalidate_on_delete(self.node, key, &folder_is_empty);
                    }
                }
                folder_is_empty(folder)
            }
            Err(e) => {
                warn!(path = %self.abs(key), error = %e, "could not rescan container after delete");
                if let Some(new) = renamed_to {
                    self.ctx.cache.invalidate_on_create(self.node, new);
                }
                self.ctx.cache.invalidate_enclosing(self.node, key);
                true
            }
        }
    }

    /// The committed file record at `key`.
    pub async fn committed_file(&self, key: &str) -> FsResult<StoredFile> {
        self.check_key(key)?;
        self.fetch_snapshot(key)
            .await?
            .file
            .ok_or_else(|| FsError::NotFound(self.abs(key)))
    }

    async fn commit_entry(&self, key: &str, mut file: StoredFile) -> FsResult<Version> {
        self.check_key(key)?;
        let fetched = self.fetch_snapshot(key).await?;
        let (op, expected) = match fetched.version {
            Some(version) => (MutateOp::Update, Some(version + 1)),
            None => (MutateOp::Insert, None),
        };
        file.modified = std::time::SystemTime::now();
        self.attributes_changed(key);
        self.listing_changed(key);
        if let Err(e) = self
            .ctx
            .store
            .mutate(self.container, op, key, Some(EntryValue::File(file)), expected)
            .await
        {
            return Err(self.fail(key, e.into()));
        }
        self.snapshots.remove_sync(key);
        self.attributes_changed(key);
        self.listing_changed(key);
        Ok(expected.unwrap_or(0))
    }

    /// Commit `file` under `key`, replacing any existing entry. The blob is
    /// shared, not re-uploaded.
    #[instrument(skip(self, file), fields(node = %self.node_path))]
    pub async fn put_file(&self, key: &str, file: StoredFile) -> FsResult<()> {
        let version = self.commit_entry(key, file).await?;
        debug!(path = %self.abs(key), version, "committed copied file");
        Ok(())
    }

    /// Copy `src` to `dst` within this container.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn copy_file(&self, src: &str, dst: &str) -> FsResult<()> {
        let file = self.committed_file(src).await?;
        self.put_file(dst, file).await
    }

    /// Move `old` to `new` within this container.
    #[instrument(skip(self), fields(node = %self.node_path))]
    pub async fn rename_file(&self, old: &str, new: &str) -> FsResult<()> {
        if old == new {
            self.committed_file(old).await?;
            return Ok(());
        }
        let file = self.committed_file(old).await?;
        self.commit_entry(new, file).await?;
        self.delete_entry(old).await?;
        self.deleted(old, Some(new)).await;
        debug!(old = %self.abs(old), new = %self.abs(new), "renamed file");
        Ok(())
    }

    /// Forget every fetched record, so the next access refetches.
    pub fn forget_snapshots(&self) {
        self.snapshots.retain_sync(|_, _| false);
    }

    fn attributes_changed(&self, key: &str) {
        self.index.invalidate();
        self.ctx.cache.invalidate(self.node, key, Op::ItemAttributes);
    }

    fn listing_changed(&self, key: &str) {
        self.index.invalidate();
        self.ctx.cache.invalidate_on_create(self.node, key);
    }
}
