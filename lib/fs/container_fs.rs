//! The consumer-facing filesystem.
//!
//! [`ContainerFs`] routes every call to the namespace node owning the path
//! and serves `item_attributes` and `list_folder` from the result cache when
//! it can. A cache hit is resolved from the absolute path alone, without
//! routing and without touching the store.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{instrument, trace};

use super::descriptor::DescriptorTable;
use super::file_registry::FsContext;
use super::node::ContainerNode;
use super::path::normalize;
use super::registry::ContainerRegistry;
use super::{Descriptor, ItemAttributes, ItemType, ListEntry, OpenFlags};
use crate::cache::{CachedResult, Op, OperationResultCache};
use crate::error::{FsError, FsResult};
use crate::session::{Session, SessionState};
use crate::store::{ContainerId, OpenMode, RemoteStore};

/// Point-in-time counters for a [`ContainerFs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Live descriptors.
    pub open_descriptors: usize,
    /// Live namespace nodes, root included.
    pub nodes: usize,
    /// Cached listing and attribute results.
    pub cached_results: usize,
    /// Whether the backend has reported exhausted balance or quota.
    pub low_balance: bool,
}

/// A filesystem view over a tree of remote containers.
pub struct ContainerFs<S: RemoteStore> {
    ctx: FsContext<S>,
    registry: ContainerRegistry<S>,
}

impl<S: RemoteStore> std::fmt::Debug for ContainerFs<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFs")
            .field("registry", &self.registry)
            .field("descriptors", &self.ctx.descriptors)
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> ContainerFs<S> {
    /// A filesystem rooted at `root` with a fresh session.
    pub fn new(store: S, root: ContainerId) -> Self {
        Self::with_session(store, root, Arc::new(SessionState::new()))
    }

    /// A filesystem rooted at `root` reporting into `session`.
    pub fn with_session(store: S, root: ContainerId, session: Arc<dyn Session>) -> Self {
        let ctx = FsContext {
            store,
            descriptors: Arc::new(DescriptorTable::new()),
            cache: Arc::new(OperationResultCache::new()),
            session,
        };
        let registry = ContainerRegistry::new(ctx.clone(), root);
        Self { ctx, registry }
    }

    /// Bind and index the root container. Safe to call repeatedly.
    pub async fn initialize(&self) -> FsResult<()> {
        self.registry.initialize().await
    }

    /// The session this filesystem reports into.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.ctx.session
    }

    /// The node registry.
    #[must_use]
    pub fn registry(&self) -> &ContainerRegistry<S> {
        &self.registry
    }

    /// The remote store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.ctx.store
    }

    async fn route(&self, path: &str) -> FsResult<(Arc<ContainerNode<S>>, String)> {
        self.registry.route(path).await
    }

    /// Open `path` in `mode`. Writable modes create a missing file.
    #[instrument(name = "ContainerFs::open_file", skip(self))]
    pub async fn open_file(&self, path: &str, mode: OpenMode) -> FsResult<Descriptor> {
        let (node, key) = self.route(path).await?;
        node.files()?.open_file(&key, mode).await
    }

    /// Open `path` with POSIX-style flags.
    ///
    /// `CREAT | EXCL` creates and fails if the file exists. Without `CREAT`
    /// the file must already exist.
    #[instrument(name = "ContainerFs::open", skip(self))]
    pub async fn open(&self, path: &str, flags: OpenFlags) -> FsResult<Descriptor> {
        if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
            return self.create_file(path).await;
        }
        let mode = flags.open_mode();
        if mode.is_writable() && !flags.contains(OpenFlags::CREAT) {
            let attrs = self.item_attributes(path, None).await?;
            if attrs.item_type.is_folder() {
                return Err(FsError::IsAContainer(normalize(path)));
            }
        }
        self.open_file(path, mode).await
    }

    /// Create a new, empty file at `path`, open for writing.
    #[instrument(name = "ContainerFs::create_file", skip(self))]
    pub async fn create_file(&self, path: &str) -> FsResult<Descriptor> {
        let (node, key) = self.route(path).await?;
        node.files()?.create_file(&key).await
    }

    /// Read up to `len` bytes at `offset` through `d`.
    #[instrument(name = "ContainerFs::read_file", skip(self))]
    pub async fn read_file(
        &self,
        path: &str,
        d: Descriptor,
        offset: u64,
        len: u64,
    ) -> FsResult<Bytes> {
        let (node, key) = self.route(path).await?;
        node.files()?.read_file(&key, d, offset, len).await
    }

    /// Read into `buf` at `offset` through `d`.
    #[instrument(name = "ContainerFs::read_file_buf", skip(self, buf))]
    pub async fn read_file_buf(
        &self,
        path: &str,
        d: Descriptor,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let (node, key) = self.route(path).await?;
        node.files()?.read_file_buf(&key, d, offset, buf).await
    }

    /// Write `data` at `offset` through `d`.
    #[instrument(name = "ContainerFs::write_file", skip(self, data))]
    pub async fn write_file(
        &self,
        path: &str,
        d: Descriptor,
        offset: u64,
        data: Bytes,
    ) -> FsResult<u64> {
        let (node, key) = self.route(path).await?;
        node.files()?.write_file(&key, d, offset, data).await
    }

    /// Write a borrowed buffer at `offset` through `d`.
    #[instrument(name = "ContainerFs::write_file_buf", skip(self, buf))]
    pub async fn write_file_buf(
        &self,
        path: &str,
        d: Descriptor,
        offset: u64,
        buf: &[u8],
    ) -> FsResult<u64> {
        let (node, key) = self.route(path).await?;
        node.files()?.write_file_buf(&key, d, offset, buf).await
    }

    /// Close `d`, committing any change.
    #[instrument(name = "ContainerFs::close_file", skip(self))]
    pub async fn close_file(&self, path: &str, d: Descriptor) -> FsResult<()> {
        let (node, key) = self.route(path).await?;
        node.files()?.close_file(&key, d).await
    }

    /// Truncate the file open as `d` to `size`. Only zero is supported.
    #[instrument(name = "ContainerFs::truncate_file", skip(self))]
    pub async fn truncate_file(&self, path: &str, d: Descriptor, size: u64) -> FsResult<()> {
        let (node, key) = self.route(path).await?;
        node.files()?.truncate_file(&key, d, size).await
    }

    /// Delete the file at `path`. Returns whether it was the last entry of
    /// its folder.
    #[instrument(name = "ContainerFs::delete_file", skip(self))]
    pub async fn delete_file(&self, path: &str) -> FsResult<bool> {
        let (node, key) = self.route(path).await?;
        node.files()?.delete_file(&key).await
    }

    /// Move the file at `old` to `new`, replacing any file there.
    #[instrument(name = "ContainerFs::rename_file", skip(self))]
    pub async fn rename_file(&self, old: &str, new: &str) -> FsResult<()> {
        let (src_node, src_key) = self.route(old).await?;
        let (dst_node, dst_key) = self.route(new).await?;
        if Arc::ptr_eq(&src_node, &dst_node) {
            return src_node.files()?.rename_file(&src_key, &dst_key).await;
        }
        let file = src_node.files()?.committed_file(&src_key).await?;
        dst_node.files()?.put_file(&dst_key, file).await?;
        src_node.files()?.delete_file(&src_key).await?;
        Ok(())
    }

    /// Copy the file at `src` to `dst`, sharing the stored content.
    #[instrument(name = "ContainerFs::copy_file", skip(self))]
    pub async fn copy_file(&self, src: &str, dst: &str) -> FsResult<()> {
        let (src_node, src_key) = self.route(src).await?;
        let (dst_node, dst_key) = self.route(dst).await?;
        if Arc::ptr_eq(&src_node, &dst_node) {
            return src_node.files()?.copy_file(&src_key, &dst_key).await;
        }
        let file = src_node.files()?.committed_file(&src_key).await?;
        dst_node.files()?.put_file(&dst_key, file).await
    }

    /// Attributes of `path`, as seen through `d` if given.
    #[instrument(name = "ContainerFs::item_attributes", skip(self))]
    pub async fn item_attributes(
        &self,
        path: &str,
        d: Option<Descriptor>,
    ) -> FsResult<ItemAttributes> {
        if let Some(d) = d {
            let (node, key) = self.route(path).await?;
            return node.files()?.open_file_attributes(&key, d).await;
        }
        let path = normalize(path);
        if let Some(CachedResult::Attributes(attrs)) = self.ctx.cache.lookup(&path, Op::ItemAttributes)
        {
            return Ok(attrs);
        }
        let seen = self.ctx.cache.generation();
        let (node, key) = self.route(&path).await?;
        let attrs = node.item_attributes(&key).await?;
        self.ctx.cache.publish(
            seen,
            &path,
            node.id(),
            &key,
            Op::ItemAttributes,
            CachedResult::Attributes(attrs),
        );
        Ok(attrs)
    }

    /// What `path` names.
    #[instrument(name = "ContainerFs::item_type", skip(self))]
    pub async fn item_type(&self, path: &str) -> FsResult<ItemType> {
        Ok(self.item_attributes(path, None).await?.item_type)
    }

    /// The entries directly under folder `path`.
    #[instrument(name = "ContainerFs::list_folder", skip(self))]
    pub async fn list_folder(&self, path: &str) -> FsResult<Arc<[ListEntry]>> {
        let path = normalize(path);
        if let Some(CachedResult::Listing(listing)) = self.ctx.cache.lookup(&path, Op::ListFolder) {
            return Ok(listing);
        }
        let seen = self.ctx.cache.generation();
        let (node, key) = self.route(&path).await?;
        let listing: Arc<[ListEntry]> = node.list_folder(&key).await?.into();
        trace!(%path, entries = listing.len(), "listed folder");
        self.ctx.cache.publish(
            seen,
            &path,
            node.id(),
            &key,
            Op::ListFolder,
            CachedResult::Listing(Arc::clone(&listing)),
        );
        Ok(listing)
    }

    /// User metadata of the file open as `d`.
    #[instrument(name = "ContainerFs::get_file_metadata", skip(self))]
    pub async fn get_file_metadata(&self, path: &str, d: Descriptor) -> FsResult<Bytes> {
        let (node, key) = self.route(path).await?;
        node.files()?.get_file_metadata(&key, d).await
    }

    /// Stage user metadata on the file open as `d`. Committed on close.
    #[instrument(name = "ContainerFs::set_file_metadata", skip(self, metadata))]
    pub async fn set_file_metadata(
        &self,
        path: &str,
        d: Descriptor,
        metadata: Bytes,
    ) -> FsResult<()> {
        let (node, key) = self.route(path).await?;
        node.files()?.set_file_metadata(&key, d, metadata).await
    }

    /// Drop cached state along `path`, making external changes visible.
    pub async fn refresh(&self, path: &str) -> FsResult<()> {
        self.registry.refresh(path).await
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> FsStats {
        FsStats {
            open_descriptors: self.ctx.descriptors.len(),
            nodes: self.registry.node_count(),
            cached_results: self.ctx.cache.len(),
            low_balance: self.ctx.session.low_balance(),
        }
    }
}
