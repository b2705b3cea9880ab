use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tracing::trace;

use super::{
    BlobAddr, ContainerId, ContainerKind, EntryValue, FetchedEntry, MutateOp, OpenHandle,
    OpenMode, RemoteStore, StoreEntry, StoreError, StoredFile, Version,
};

/// One kind of call made against the store. Used for call accounting and
/// fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    /// [`RemoteStore::fetch`].
    Fetch,
    /// [`RemoteStore::open`].
    Open,
    /// [`RemoteStore::read`].
    Read,
    /// [`RemoteStore::write`].
    Write,
    /// [`RemoteStore::size`].
    Size,
    /// [`RemoteStore::close`].
    Close,
    /// [`RemoteStore::mutate`].
    Mutate,
    /// [`RemoteStore::entries`].
    Entries,
}

/// Number of calls made against a [`MemoryStore`], per call kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Fetches.
    pub fetch: u64,
    /// Blob opens.
    pub open: u64,
    /// Blob reads.
    pub read: u64,
    /// Blob writes.
    pub write: u64,
    /// Size probes.
    pub size: u64,
    /// Blob closes.
    pub close: u64,
    /// Versioned mutations.
    pub mutate: u64,
    /// Entry enumerations.
    pub entries: u64,
}

impl CallCounts {
    /// Sum over every call kind.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.fetch
            + self.open
            + self.read
            + self.write
            + self.size
            + self.close
            + self.mutate
            + self.entries
    }

    fn bump(&mut self, call: StoreCall) {
        let slot = match call {
            StoreCall::Fetch => &mut self.fetch,
            StoreCall::Open => &mut self.open,
            StoreCall::Read => &mut self.read,
            StoreCall::Write => &mut self.write,
            StoreCall::Size => &mut self.size,
            StoreCall::Close => &mut self.close,
            StoreCall::Mutate => &mut self.mutate,
            StoreCall::Entries => &mut self.entries,
        };
        *slot += 1;
    }
}

struct OpenBlob {
    mode: OpenMode,
    data: Vec<u8>,
    base: Option<StoredFile>,
}

#[derive(Default)]
struct State {
    containers: HashMap<ContainerId, BTreeMap<String, (EntryValue, Version)>>,
    blobs: HashMap<BlobAddr, Bytes>,
    handles: HashMap<OpenHandle, OpenBlob>,
    next_id: u64,
    stored_bytes: u64,
    quota: Option<u64>,
    faults: HashMap<StoreCall, StoreError>,
    counts: CallCounts,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Count the call and consume any injected fault for it.
    fn begin(&mut self, call: StoreCall) -> Result<(), StoreError> {
        self.counts.bump(call);
        match self.faults.remove(&call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn container_mut(
        &mut self,
        id: ContainerId,
    ) -> Result<&mut BTreeMap<String, (EntryValue, Version)>, StoreError> {
        self.containers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("container {}", id.0)))
    }

    fn store_blob(&mut self, content: Vec<u8>) -> Option<BlobAddr> {
        if content.is_empty() {
            return None;
        }
        let addr = BlobAddr(self.next_id());
        self.stored_bytes += content.len() as u64;
        self.blobs.insert(addr, Bytes::from(content));
        Some(addr)
    }
}

/// A complete in-process [`RemoteStore`].
///
/// Follows the same contract a networked backend does: soft deletes keep the
/// key's version history, updates must name `current + 1`, zero-length content
/// cannot be opened for reading, and appends are emulated by copying the
/// previous content into the new write buffer. Cloning is cheap and shares the
/// underlying state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryStore")
            .field("containers", &state.containers.len())
            .field("blobs", &state.blobs.len())
            .field("open_handles", &state.handles.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// An empty store with no quota.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store that rejects writes once `bytes` of blob content are stored.
    #[must_use]
    pub fn with_quota(bytes: u64) -> Self {
        let store = Self::default();
        store.lock().quota = Some(bytes);
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a new, empty container.
    pub fn create_container(&self) -> ContainerId {
        let mut state = self.lock();
        let id = ContainerId(state.next_id());
        state.containers.insert(id, BTreeMap::new());
        id
    }

    /// Point `key` in `parent` at `child`, bumping the entry version if the
    /// key already exists. Bypasses call accounting.
    pub fn link_container(
        &self,
        parent: ContainerId,
        key: &str,
        child: ContainerId,
        kind: ContainerKind,
    ) -> Result<Version, StoreError> {
        self.put_value(parent, key, EntryValue::Container { id: child, kind })
    }

    /// Write `content` as a committed file under `key`, as another client
    /// would. Bypasses call accounting.
    pub fn put_file(
        &self,
        container: ContainerId,
        key: &str,
        content: &[u8],
    ) -> Result<Version, StoreError> {
        let now = SystemTime::now();
        let blob = self.lock().store_blob(content.to_vec());
        let file = StoredFile {
            blob,
            size: content.len() as u64,
            created: now,
            modified: now,
            user_metadata: Bytes::new(),
        };
        self.put_value(container, key, EntryValue::File(file))
    }

    fn put_value(
        &self,
        container: ContainerId,
        key: &str,
        value: EntryValue,
    ) -> Result<Version, StoreError> {
        let mut state = self.lock();
        let entries = state.container_mut(container)?;
        let version = match entries.get(key) {
            Some((_, v)) => v + 1,
            None => 0,
        };
        entries.insert(key.to_owned(), (value, version));
        Ok(version)
    }

    /// Inspect one entry without counting a call.
    #[must_use]
    pub fn entry(&self, container: ContainerId, key: &str) -> Option<StoreEntry> {
        let state = self.lock();
        let (value, version) = state.containers.get(&container)?.get(key)?;
        Some(StoreEntry {
            key: key.to_owned(),
            value: value.clone(),
            version: *version,
        })
    }

    /// The content of a stored blob.
    #[must_use]
    pub fn blob(&self, addr: BlobAddr) -> Option<Bytes> {
        self.lock().blobs.get(&addr).cloned()
    }

    /// Number of blob handles currently open.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.lock().handles.len()
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().counts
    }

    /// Reset the call counters.
    pub fn reset_calls(&self) {
        self.lock().counts = CallCounts::default();
    }

    /// Make the next call of kind `call` fail with `err`.
    pub fn fail_next(&self, call: StoreCall, err: StoreError) {
        self.lock().faults.insert(call, err);
    }
}

impl RemoteStore for MemoryStore {
    async fn fetch(&self, container: ContainerId, key: &str) -> Result<FetchedEntry, StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Fetch)?;
        let entries = state.container_mut(container)?;
        let (value, version) = entries
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_owned()))?;
        trace!(container = container.0, key, version, "memory store: fetch");
        Ok(FetchedEntry {
            value: value.clone(),
            version: *version,
        })
    }

    async fn open(
        &self,
        file: Option<&StoredFile>,
        mode: OpenMode,
    ) -> Result<OpenHandle, StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Open)?;

        let existing = match file.and_then(|f| f.blob) {
            Some(addr) => state
                .blobs
                .get(&addr)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("blob {}", addr.0)))?,
            None => Bytes::new(),
        };

        let data = match mode {
            OpenMode::Read => {
                if file.is_none() {
                    return Err(StoreError::NotFound("no content to read".to_owned()));
                }
                if existing.is_empty() {
                    return Err(StoreError::EmptyContent);
                }
                existing.to_vec()
            }
            OpenMode::Overwrite => Vec::new(),
            OpenMode::Append => existing.to_vec(),
        };

        let handle = OpenHandle(state.next_id());
        state.handles.insert(
            handle,
            OpenBlob {
                mode,
                data,
                base: file.cloned(),
            },
        );
        Ok(handle)
    }

    async fn read(&self, handle: OpenHandle, offset: u64, len: u64) -> Result<Bytes, StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Read)?;
        let blob = state
            .handles
            .get(&handle)
            .ok_or(StoreError::InvalidHandle(handle))?;
        let total = blob.data.len();
        let start = usize::try_from(offset).unwrap_or(total).min(total);
        let end = start
            .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
            .min(total);
        Ok(Bytes::copy_from_slice(&blob.data[start..end]))
    }

    async fn write(&self, handle: OpenHandle, data: Bytes) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Write)?;
        let quota = state.quota;
        let stored = state.stored_bytes;
        let blob = state
            .handles
            .get_mut(&handle)
            .ok_or(StoreError::InvalidHandle(handle))?;
        if !blob.mode.is_writable() {
            return Err(StoreError::Backend("handle is read-only".to_owned()));
        }
        if let Some(limit) = quota
            && stored + (blob.data.len() + data.len()) as u64 > limit
        {
            return Err(StoreError::QuotaExceeded);
        }
        blob.data.extend_from_slice(&data);
        Ok(())
    }

    async fn size(&self, handle: OpenHandle) -> Result<u64, StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Size)?;
        state
            .handles
            .get(&handle)
            .map(|blob| blob.data.len() as u64)
            .ok_or(StoreError::InvalidHandle(handle))
    }

    async fn close(&self, handle: OpenHandle) -> Result<Option<StoredFile>, StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Close)?;
        let blob = state
            .handles
            .remove(&handle)
            .ok_or(StoreError::InvalidHandle(handle))?;
        if !blob.mode.is_writable() {
            return Ok(None);
        }

        let now = SystemTime::now();
        let size = blob.data.len() as u64;
        let (created, user_metadata) = blob
            .base
            .map_or((now, Bytes::new()), |b| (b.created, b.user_metadata));
        let addr = state.store_blob(blob.data);
        Ok(Some(StoredFile {
            blob: addr,
            size,
            created,
            modified: now,
            user_metadata,
        }))
    }

    async fn mutate(
        &self,
        container: ContainerId,
        op: MutateOp,
        key: &str,
        payload: Option<EntryValue>,
        expected_version: Option<Version>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.begin(StoreCall::Mutate)?;
        let entries = state.container_mut(container)?;
        let conflict = |current: Option<Version>| StoreError::VersionConflict {
            key: key.to_owned(),
            expected: expected_version.unwrap_or_default(),
            current,
        };

        match op {
            MutateOp::Insert => {
                if let Some((_, current)) = entries.get(key) {
                    return Err(conflict(Some(*current)));
                }
                let value = payload
                    .ok_or_else(|| StoreError::Backend("insert without payload".to_owned()))?;
                entries.insert(key.to_owned(), (value, 0));
            }
            MutateOp::Update | MutateOp::Delete => {
                let (value, current) = entries
                    .get_mut(key)
                    .ok_or_else(|| StoreError::NotFound(key.to_owned()))?;
                if expected_version != Some(*current + 1) {
                    return Err(conflict(Some(*current)));
                }
                *value = match op {
                    MutateOp::Delete => EntryValue::Deleted,
                    _ => payload
                        .ok_or_else(|| StoreError::Backend("update without payload".to_owned()))?,
                };
                *current += 1;
            }
        }
        trace!(container = container.0, key, ?op, "memory store: mutate");
        Ok(())
    }

    fn entries(&self, container: ContainerId) -> BoxStream<'static, Result<StoreEntry, StoreError>> {
        let mut state = self.lock();
        if let Err(err) = state.begin(StoreCall::Entries) {
            return stream::once(async move { Err(err) }).boxed();
        }
        let snapshot: Result<Vec<StoreEntry>, StoreError> =
            state.container_mut(container).map(|entries| {
                entries
                    .iter()
                    .map(|(key, (value, version))| StoreEntry {
                        key: key.clone(),
                        value: value.clone(),
                        version: *version,
                    })
                    .collect()
            });
        match snapshot {
            Ok(entries) => stream::iter(entries.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }
}
