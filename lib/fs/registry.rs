use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, instrument, warn};

use super::file_registry::FsContext;
use super::node::{ContainerNode, NodeKind};
use super::path::{join, normalize, relative};
use super::NodeId;
use crate::cache::ResultReference;
use crate::error::{FsError, FsResult};
use crate::store::{ContainerId, ContainerKind, EntryValue, FetchedEntry, RemoteStore, StoreError, Version};

/// Every live namespace node, by absolute path.
///
/// Nodes are created lazily the first time a path routes through them. Before
/// a child node is used, its recorded parent version is compared with what the
/// parent's entry index holds for the pointer; on mismatch the pointer is
/// fetched again and the node is either rebound (same container) or replaced
/// by a node with a fresh [`NodeId`], dropping everything cached for the old
/// one.
pub struct ContainerRegistry<S: RemoteStore> {
    ctx: FsContext<S>,
    root_container: ContainerId,
    root: OnceLock<Arc<ContainerNode<S>>>,
    nodes: scc::HashMap<String, Arc<ContainerNode<S>>>,
    next_node: AtomicU64,
}

impl<S: RemoteStore> std::fmt::Debug for ContainerRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("root_container", &self.root_container)
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> ContainerRegistry<S> {
    /// A registry rooted at `root_container`.
    pub fn new(ctx: FsContext<S>, root_container: ContainerId) -> Self {
        Self {
            ctx,
            root_container,
            root: OnceLock::new(),
            nodes: scc::HashMap::new(),
            next_node: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> NodeId {
        NodeId(self.next_node.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind the root node and index its container. Safe to call repeatedly.
    #[instrument(name = "ContainerRegistry::initialize", skip(self))]
    pub async fn initialize(&self) -> FsResult<()> {
        self.root().entry_index().await?;
        Ok(())
    }

    /// The root node.
    pub fn root(&self) -> Arc<ContainerNode<S>> {
        Arc::clone(self.root.get_or_init(|| {
            let id = self.allocate_id();
            self.ctx.cache.register_node(id, None);
            debug!(node = id.0, container = self.root_container.0, "bound root node");
            Arc::new(ContainerNode::root(self.ctx.clone(), id, self.root_container))
        }))
    }

    /// Number of live nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len() + usize::from(self.root.get().is_some())
    }

    /// The live node mounted at exactly `path`, if one was bound.
    #[must_use]
    pub fn node_at(&self, path: &str) -> Option<Arc<ContainerNode<S>>> {
        let path = normalize(path);
        if path == "/" {
            return self.root.get().cloned();
        }
        self.nodes.read_sync(path.as_str(), |_, node| Arc::clone(node))
    }

    /// Find the node owning `path` and the key relative to it.
    ///
    /// Walks from the root, descending through every nested-container pointer
    /// that encloses the remaining key and validating each child on the way.
    #[instrument(name = "ContainerRegistry::route", skip(self))]
    pub async fn route(&self, path: &str) -> FsResult<(Arc<ContainerNode<S>>, String)> {
        let path = normalize(path);
        let mut node = self.root();
        let mut key = relative("/", &path).unwrap_or_default().to_owned();
        loop {
            if key.is_empty() || !node.kind().follows_containers() {
                return Ok((node, key));
            }
            let index = node.entry_index().await?;
            let Some((pointer, container, kind, version)) = index.enclosing_container(&key)
            else {
                return Ok((node, key));
            };
            let pointer = pointer.to_owned();
            let child = self
                .validated_child(&node, &pointer, container, kind, version)
                .await?;
            key = key[pointer.len()..].trim_start_matches('/').to_owned();
            node = child;
        }
    }

    /// The child of `parent` behind `pointer`, bound and validated against
    /// the pointer state the parent currently records.
    async fn validated_child(
        &self,
        parent: &Arc<ContainerNode<S>>,
        pointer: &str,
        container: ContainerId,
        kind: ContainerKind,
        version: Version,
    ) -> FsResult<Arc<ContainerNode<S>>> {
        let path = join(parent.path(), pointer);
        let existing = match self.nodes.entry_sync(path.clone()) {
            scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let node = self.bind_child(parent, pointer, path, container, kind, version);
                vac.insert_entry(Arc::clone(&node));
                return Ok(node);
            }
        };

        let same_parent = existing.parent().is_some_and(|link| link.node == parent.id());
        if same_parent && existing.last_known_parent_version() == Some(version) {
            return Ok(existing);
        }
        self.revalidate(parent, pointer, existing, version).await
    }

    fn bind_child(
        &self,
        parent: &ContainerNode<S>,
        pointer: &str,
        path: String,
        container: ContainerId,
        kind: ContainerKind,
        version: Version,
    ) -> Arc<ContainerNode<S>> {
        let id = self.allocate_id();
        self.ctx
            .cache
            .register_node(id, Some(ResultReference::new(parent.id(), pointer)));
        debug!(node = id.0, %path, container = container.0, version, "bound child node");
        Arc::new(ContainerNode::child(
            self.ctx.clone(),
            id,
            NodeKind::from(kind),
            path,
            container,
            parent.id(),
            pointer,
            version,
        ))
    }

    /// The parent's recorded pointer version moved away from `existing`'s.
    /// Fetch the pointer again and rebind or replace.
    async fn revalidate(
        &self,
        parent: &Arc<ContainerNode<S>>,
        pointer: &str,
        existing: Arc<ContainerNode<S>>,
        recorded: Version,
    ) -> FsResult<Arc<ContainerNode<S>>> {
        debug!(
            path = %existing.path(),
            known = ?existing.last_known_parent_version(),
            recorded,
            "node version moved, re-resolving"
        );
        let fetched = self.ctx.store.fetch(parent.container(), pointer).await;
        match fetched {
            Ok(FetchedEntry {
                value: EntryValue::Container { id, kind },
                version,
            }) => {
                if version != recorded {
                    parent.invalidate();
                }
                let same_parent = existing.parent().is_some_and(|link| link.node == parent.id());
                if same_parent && id == existing.container() && NodeKind::from(kind) == existing.kind() {
                    existing.rebind(version);
                    debug!(path = %existing.path(), version, "rebound node");
                    return Ok(existing);
                }
                let path = existing.path().to_owned();
                self.drop_subtree(&path);
                let node = self.bind_child(parent, pointer, path.clone(), id, kind, version);
                self.nodes.upsert_sync(path, Arc::clone(&node));
                Ok(node)
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {
                parent.invalidate();
                let path = existing.path().to_owned();
                self.drop_subtree(&path);
                Err(FsError::NotFound(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the node at `path` and every node below it, dropping their
    /// cached results.
    fn drop_subtree(&self, path: &str) {
        let prefix = format!("{path}/");
        let mut dropped = Vec::new();
        self.nodes.retain_sync(|node_path, node| {
            let keep = node_path != path && !node_path.starts_with(&prefix);
            if !keep {
                dropped.push(node.id());
            }
            keep
        });
        for id in dropped {
            self.ctx.cache.forget_node(id);
            warn!(node = id.0, %path, "replaced node");
        }
    }

    fn forget(&self, node: &ContainerNode<S>) {
        node.invalidate();
        self.ctx.cache.forget_node(node.id());
        if let Some(link) = node.parent() {
            self.ctx.cache.register_node(
                node.id(),
                Some(ResultReference::new(link.node, link.entry_key.clone())),
            );
        }
    }

    /// Drop cached state for every node on the way to `path` and every node
    /// mounted below it, so the next access rereads containers and parent
    /// versions.
    #[instrument(name = "ContainerRegistry::refresh", skip(self))]
    pub async fn refresh(&self, path: &str) -> FsResult<()> {
        let path = normalize(path);
        let prefix = if path == "/" {
            path.clone()
        } else {
            format!("{path}/")
        };
        self.nodes.retain_sync(|node_path, node| {
            if node_path == &path || node_path.starts_with(&prefix) {
                self.forget(node);
            }
            true
        });

        let mut current = Some(self.root());
        let mut key = relative("/", &path).unwrap_or_default().to_owned();
        while let Some(node) = current.take() {
            self.forget(&node);
            if key.is_empty() || !node.kind().follows_containers() {
                break;
            }
            let index = node.entry_index().await?;
            if let Some((pointer, ..)) = index.enclosing_container(&key) {
                let pointer = pointer.to_owned();
                current = self.nodes.read_sync(join(node.path(), &pointer).as_str(), |_, n| {
                    Arc::clone(n)
                });
                key = key[pointer.len()..].trim_start_matches('/').to_owned();
            }
        }
        Ok(())
    }
}
