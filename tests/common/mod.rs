#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use bytes::Bytes;
use containerfs::store::memory::MemoryStore;
use containerfs::store::{ContainerId, ContainerKind, OpenMode};
use containerfs::{ContainerFs, Descriptor};

/// A store with a root container and two default containers linked under it.
pub struct Fixture {
    pub store: MemoryStore,
    pub root: ContainerId,
    pub public: ContainerId,
    pub documents: ContainerId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_quota(bytes: u64) -> Self {
        Self::with_store(MemoryStore::with_quota(bytes))
    }

    fn with_store(store: MemoryStore) -> Self {
        let root = store.create_container();
        let public = store.create_container();
        let documents = store.create_container();
        store
            .link_container(root, "_public", public, ContainerKind::Default)
            .unwrap();
        store
            .link_container(root, "_documents", documents, ContainerKind::Default)
            .unwrap();
        Self {
            store,
            root,
            public,
            documents,
        }
    }

    /// An initialized filesystem over this fixture's store.
    pub async fn fs(&self) -> ContainerFs<MemoryStore> {
        let fs = ContainerFs::new(self.store.clone(), self.root);
        fs.initialize().await.unwrap();
        fs
    }
}

/// Create `path`, write `content` and close it.
pub async fn write_new(fs: &ContainerFs<MemoryStore>, path: &str, content: &[u8]) {
    let d = fs.create_file(path).await.unwrap();
    if !content.is_empty() {
        fs.write_file(path, d, 0, Bytes::copy_from_slice(content))
            .await
            .unwrap();
    }
    fs.close_file(path, d).await.unwrap();
}

/// Open `path` for reading and return its whole content.
pub async fn read_all(fs: &ContainerFs<MemoryStore>, path: &str) -> Bytes {
    let d: Descriptor = fs.open_file(path, OpenMode::Read).await.unwrap();
    let size = fs.item_attributes(path, Some(d)).await.unwrap().size;
    let data = fs.read_file(path, d, 0, size).await.unwrap();
    fs.close_file(path, d).await.unwrap();
    data
}

/// Names of a listing, folders suffixed with `/`.
pub async fn names(fs: &ContainerFs<MemoryStore>, path: &str) -> Vec<String> {
    fs.list_folder(path)
        .await
        .unwrap()
        .iter()
        .map(|e| {
            if e.is_folder {
                format!("{}/", e.name)
            } else {
                e.name.clone()
            }
        })
        .collect()
}
