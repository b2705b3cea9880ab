use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::TryStreamExt as _;
use tracing::trace;

use super::path::folder_prefix;
use super::ListEntry;
use crate::error::FsResult;
use crate::store::{
    ContainerId, ContainerKind, EntryValue, METADATA_KEY, RemoteStore, StoreEntry, StoredFile,
    Version,
};

/// What a relative key resolves to inside one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// A live file entry.
    File(&'a StoredFile, Version),
    /// A pointer to a nested container.
    Container {
        /// The nested container.
        id: ContainerId,
        /// How the nested container is used.
        kind: ContainerKind,
        /// Version of the pointer entry.
        version: Version,
    },
    /// The empty key: the container itself.
    SelfContainer,
    /// A prefix shared by live keys.
    InferredFolder,
    /// Nothing live.
    Missing,
}

/// A scan of every entry of one container, ordered by key.
#[derive(Debug, Default)]
pub struct EntryIndex {
    entries: BTreeMap<String, (EntryValue, Version)>,
}

impl EntryIndex {
    /// Index a set of entries.
    pub fn from_entries(entries: impl IntoIterator<Item = StoreEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.key, (e.value, e.version)))
                .collect(),
        }
    }

    /// Scan `container` once.
    pub async fn load<S: RemoteStore>(store: &S, container: ContainerId) -> FsResult<Self> {
        let entries: Vec<StoreEntry> = store.entries(container).try_collect().await?;
        trace!(container = container.0, count = entries.len(), "indexed container");
        Ok(Self::from_entries(entries))
    }

    /// Value and version stored under exactly `key`, soft-deleted or not.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<(&EntryValue, Version)> {
        self.entries.get(key).map(|(value, version)| (value, *version))
    }

    fn live_under<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a EntryValue)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .filter(|(key, (value, _))| key.as_str() != METADATA_KEY && value.is_live())
            .map(|(key, (value, _))| (key.as_str(), value))
    }

    /// The shortest live nested-container key enclosing `key` (or equal to it).
    #[must_use]
    pub fn enclosing_container<'k>(
        &self,
        key: &'k str,
    ) -> Option<(&'k str, ContainerId, ContainerKind, Version)> {
        let mut boundary = 0;
        loop {
            let end = key[boundary..].find('/').map_or(key.len(), |i| boundary + i);
            let candidate = &key[..end];
            if let Some((EntryValue::Container { id, kind }, version)) = self.get(candidate) {
                return Some((candidate, *id, *kind, version));
            }
            if end == key.len() {
                return None;
            }
            boundary = end + 1;
        }
    }

    /// Resolve `key` by exact match, then self match, then enclosing prefix.
    #[must_use]
    pub fn lookup(&self, key: &str, follow_containers: bool) -> Lookup<'_> {
        if key == METADATA_KEY {
            return Lookup::Missing;
        }
        match self.get(key) {
            Some((EntryValue::File(file), version)) => return Lookup::File(file, version),
            Some((EntryValue::Container { id, kind }, version)) if follow_containers => {
                return Lookup::Container {
                    id: *id,
                    kind: *kind,
                    version,
                };
            }
            _ => {}
        }
        if key.is_empty() {
            return Lookup::SelfContainer;
        }
        let prefix = folder_prefix(key);
        let mut under = self.live_under(&prefix);
        let found = if follow_containers {
            under.next().is_some()
        } else {
            under.any(|(_, value)| !matches!(value, EntryValue::Container { .. }))
        };
        if found {
            Lookup::InferredFolder
        } else {
            Lookup::Missing
        }
    }

    /// Group the live entries under `folder` by their next path segment.
    #[must_use]
    pub fn list(&self, folder: &str, follow_containers: bool) -> Vec<ListEntry> {
        let prefix = folder_prefix(folder);
        let mut names: BTreeMap<&str, bool> = BTreeMap::new();
        for (key, value) in self.live_under(&prefix) {
            let is_container = matches!(value, EntryValue::Container { .. });
            if is_container && !follow_containers {
                continue;
            }
            let rest = &key[prefix.len()..];
            let (name, nested) = rest.split_once('/').map_or((rest, false), |(n, _)| (n, true));
            if name.is_empty() {
                continue;
            }
            *names.entry(name).or_default() |= nested || is_container;
        }
        names
            .into_iter()
            .map(|(name, is_folder)| ListEntry {
                name: name.to_owned(),
                is_folder,
            })
            .collect()
    }

    /// Whether any live key other than `except` sits under `folder`.
    #[must_use]
    pub fn has_live_under(&self, folder: &str, except: &str) -> bool {
        let prefix = folder_prefix(folder);
        self.live_under(&prefix).any(|(key, _)| key != except)
    }
}

/// A lazily loaded [`EntryIndex`] that can be dropped at any time.
///
/// A load that races with [`invalidate`](Self::invalidate) is returned to its
/// caller but not kept.
#[derive(Debug, Default)]
pub struct IndexCell {
    slot: Mutex<Option<Arc<EntryIndex>>>,
    generation: AtomicU64,
}

impl IndexCell {
    /// The cached index, loading it if needed.
    pub async fn get_or_load<S: RemoteStore>(
        &self,
        store: &S,
        container: ContainerId,
    ) -> FsResult<Arc<EntryIndex>> {
        if let Some(index) = self.cached() {
            return Ok(index);
        }
        let generation = self.generation.load(Ordering::Acquire);
        let index = Arc::new(EntryIndex::load(store, container).await?);
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) == generation {
            *slot = Some(Arc::clone(&index));
        }
        Ok(index)
    }

    /// The cached index, if loaded.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<EntryIndex>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the cached index.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *slot = None;
    }
}
