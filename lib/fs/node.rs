use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::entry_index::{EntryIndex, IndexCell, Lookup};
use super::file_registry::{ContainerFileRegistry, FsContext};
use super::{ItemAttributes, ItemType, ListEntry, NodeId};
use crate::error::{FsError, FsResult};
use crate::store::{ContainerId, ContainerKind, RemoteStore, Version};

/// The flavors of namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The account root container.
    Root,
    /// A default container holding files and nested containers.
    Default,
    /// A per-name service container. Every entry names a nested container;
    /// file operations are not supported.
    Services,
    /// A blob store. Holds only files; nested pointers are not followed.
    Blob,
}

impl From<ContainerKind> for NodeKind {
    fn from(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::Default => Self::Default,
            ContainerKind::Services => Self::Services,
            ContainerKind::Blob => Self::Blob,
        }
    }
}

impl NodeKind {
    /// Whether nested-container pointers are routed through.
    #[must_use]
    pub fn follows_containers(self) -> bool {
        !matches!(self, Self::Blob)
    }

    /// Whether paths in this node can name files.
    #[must_use]
    pub fn holds_files(self) -> bool {
        !matches!(self, Self::Services)
    }
}

/// Where a child node hangs off its parent.
#[derive(Debug)]
pub struct ParentLink {
    /// The parent node.
    pub node: NodeId,
    /// Key of the pointer entry in the parent's container.
    pub entry_key: String,
    last_known_version: AtomicU64,
}

/// A namespace node wrapping one remote container.
///
/// A child node stays valid only while its parent still records the pointer
/// version the child was bound at. The registry checks this before every use.
pub struct ContainerNode<S: RemoteStore> {
    id: NodeId,
    kind: NodeKind,
    path: String,
    container: ContainerId,
    parent: Option<ParentLink>,
    index: Arc<IndexCell>,
    files: ContainerFileRegistry<S>,
    ctx: FsContext<S>,
}

impl<S: RemoteStore> std::fmt::Debug for ContainerNode<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("container", &self.container)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> ContainerNode<S> {
    fn new(
        ctx: FsContext<S>,
        id: NodeId,
        kind: NodeKind,
        path: String,
        container: ContainerId,
        parent: Option<ParentLink>,
    ) -> Self {
        let index = Arc::new(IndexCell::default());
        let files = ContainerFileRegistry::new(
            ctx.clone(),
            container,
            id,
            path.clone(),
            Arc::clone(&index),
        );
        Self {
            id,
            kind,
            path,
            container,
            parent,
            index,
            files,
            ctx,
        }
    }

    /// The root node, bound directly to `container`.
    pub fn root(ctx: FsContext<S>, id: NodeId, container: ContainerId) -> Self {
        Self::new(ctx, id, NodeKind::Root, "/".to_owned(), container, None)
    }

    /// A child node bound through the pointer `entry_key` of `parent`, as
    /// observed at `version`.
    #[expect(
        clippy::too_many_arguments,
        reason = "a child binding is defined by all of these"
    )]
    pub fn child(
        ctx: FsContext<S>,
        id: NodeId,
        kind: NodeKind,
        path: String,
        container: ContainerId,
        parent: NodeId,
        entry_key: impl Into<String>,
        version: Version,
    ) -> Self {
        let link = ParentLink {
            node: parent,
            entry_key: entry_key.into(),
            last_known_version: AtomicU64::new(version),
        };
        Self::new(ctx, id, kind, path, container, Some(link))
    }

    /// This node's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// This node's flavor.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Absolute namespace path of this node.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The remote container this node wraps.
    #[must_use]
    pub fn container(&self) -> ContainerId {
        self.container
    }

    /// Where this node hangs off its parent. `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    /// Version of the parent's pointer entry this node was last validated at.
    #[must_use]
    pub fn last_known_parent_version(&self) -> Option<Version> {
        self.parent
            .as_ref()
            .map(|link| link.last_known_version.load(Ordering::Acquire))
    }

    /// Record that the parent's pointer moved to `version` without changing
    /// which container it names.
    pub fn rebind(&self, version: Version) {
        if let Some(link) = &self.parent {
            link.last_known_version.store(version, Ordering::Release);
        }
    }

    /// File operations on this node.
    pub fn files(&self) -> FsResult<&ContainerFileRegistry<S>> {
        if self.kind.holds_files() {
            Ok(&self.files)
        } else {
            Err(FsError::Unimplemented("file operations on a services container"))
        }
    }

    /// The entry index, scanning the container if it is not cached.
    pub async fn entry_index(&self) -> FsResult<Arc<EntryIndex>> {
        self.index
            .get_or_load(&self.ctx.store, self.container)
            .await
    }

    /// Drop the entry index and fetched file records so the next use rereads
    /// the container.
    pub fn invalidate(&self) {
        self.index.invalidate();
        self.files.forget_snapshots();
        trace!(node = self.id.0, path = %self.path, "node invalidated");
    }

    fn missing(&self, key: &str) -> FsError {
        FsError::NotFound(super::path::join(&self.path, key))
    }

    /// What `key` names in this node.
    pub async fn item_type(&self, key: &str) -> FsResult<ItemType> {
        Ok(self.item_attributes(key).await?.item_type)
    }

    /// Attributes of `key` in this node.
    pub async fn item_attributes(&self, key: &str) -> FsResult<ItemAttributes> {
        let index = self.entry_index().await?;
        match index.lookup(key, self.kind.follows_containers()) {
            Lookup::File(file, version) if self.kind.holds_files() => Ok(ItemAttributes {
                item_type: ItemType::File,
                size: file.size,
                version,
                created: file.created,
                modified: file.modified,
            }),
            Lookup::Container { version, .. } => {
                Ok(ItemAttributes::folder(ItemType::Container, version))
            }
            Lookup::SelfContainer => Ok(ItemAttributes::folder(
                ItemType::Container,
                self.last_known_parent_version().unwrap_or(0),
            )),
            Lookup::InferredFolder => Ok(ItemAttributes::folder(ItemType::InferredFolder, 0)),
            Lookup::File(..) | Lookup::Missing => self
                .files
                .pending_attributes(key)
                .ok_or_else(|| self.missing(key)),
        }
    }

    /// The entries directly under folder `key` in this node.
    pub async fn list_folder(&self, key: &str) -> FsResult<Vec<ListEntry>> {
        let index = self.entry_index().await?;
        let follow = self.kind.follows_containers();
        match index.lookup(key, follow) {
            Lookup::SelfContainer | Lookup::InferredFolder => Ok(index.list(key, follow)),
            Lookup::File(..) | Lookup::Container { .. } | Lookup::Missing => {
                Err(self.missing(key))
            }
        }
    }
}
