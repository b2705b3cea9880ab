//! Cache of listing and attribute results, keyed by owning node and path.
//!
//! Results live in *holders* addressed by a [`ResultReference`]: the node that
//! computed the result plus the key relative to that node. Absolute namespace
//! paths map to references, so a lookup by path never has to route through the
//! node hierarchy. When a node is replaced its holders are dropped and every
//! reference that pointed at them misses.
//!
//! There is no time-based expiry. Entries leave the cache only through the
//! `invalidate*` family and [`forget_node`](OperationResultCache::forget_node).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::fs::path::{file_name, parent};
use crate::fs::{ItemAttributes, ItemType, ListEntry, NodeId};

/// The operations whose results are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `list_folder`.
    ListFolder,
    /// `item_attributes`.
    ItemAttributes,
}

/// A cached operation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedResult {
    /// A folder listing.
    Listing(Arc<[ListEntry]>),
    /// Item attributes.
    Attributes(ItemAttributes),
}

impl CachedResult {
    /// Container and inferred-folder attributes are derived on every call and
    /// never cached.
    fn is_cacheable(&self) -> bool {
        match self {
            Self::Listing(_) => true,
            Self::Attributes(attrs) => {
                matches!(attrs.item_type, ItemType::File | ItemType::NewFile)
            }
        }
    }
}

/// Where a path's cached results actually live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultReference {
    /// The node that computed the result.
    pub owner: NodeId,
    /// Key relative to `owner`.
    pub key: String,
}

impl ResultReference {
    /// Reference to `key` inside `owner`.
    pub fn new(owner: NodeId, key: impl Into<String>) -> Self {
        Self {
            owner,
            key: key.into(),
        }
    }
}

type ResultHolder = HashMap<Op, CachedResult>;

#[derive(Default)]
struct Inner {
    holders: HashMap<ResultReference, ResultHolder>,
    /// Absolute namespace path → holder.
    refs: HashMap<String, ResultReference>,
    /// Holder → the absolute paths linked to it.
    linked: HashMap<ResultReference, HashSet<String>>,
    /// Node → the pointer entry in its parent node.
    parents: HashMap<NodeId, ResultReference>,
    /// Bumped by every invalidation.
    generation: u64,
}

impl Inner {
    fn insert(&mut self, at: &ResultReference, op: Op, result: CachedResult) {
        self.holders.entry(at.clone()).or_default().insert(op, result);
    }

    fn link(&mut self, path: String, at: ResultReference) {
        if let Some(previous) = self.refs.insert(path.clone(), at.clone())
            && previous != at
            && let Some(paths) = self.linked.get_mut(&previous)
        {
            paths.remove(&path);
        }
        self.linked.entry(at).or_default().insert(path);
    }

    /// Remove the holder at `at` and unlink every path pointing at it.
    fn drop_holder(&mut self, at: &ResultReference) {
        self.holders.remove(at);
        for path in self.linked.remove(at).unwrap_or_default() {
            if self.refs.get(&path) == Some(at) {
                self.refs.remove(&path);
            }
        }
    }

    fn remove_op(&mut self, at: &ResultReference, op: Op) {
        let Some(holder) = self.holders.get_mut(at) else {
            return;
        };
        holder.remove(&op);
        if holder.is_empty() {
            self.drop_holder(at);
        }
    }

    /// Remove `name` from the listing cached at `at`. Returns `Some(true)` if
    /// that emptied the listing and `None` if no listing was cached.
    fn remove_from_listing(&mut self, at: &ResultReference, name: &str) -> Option<bool> {
        let holder = self.holders.get_mut(at)?;
        let Some(CachedResult::Listing(listing)) = holder.get(&Op::ListFolder) else {
            return None;
        };
        let remaining: Arc<[ListEntry]> = listing.iter().filter(|e| e.name != name).cloned().collect();
        let emptied = remaining.is_empty();
        if emptied {
            self.remove_op(at, Op::ListFolder);
        } else {
            holder.insert(Op::ListFolder, CachedResult::Listing(remaining));
        }
        Some(emptied)
    }

    /// Drop the listing of every folder enclosing `key` in `node`, then keep
    /// going in each parent node.
    fn drop_enclosing_listings(&mut self, mut node: NodeId, mut key: String) {
        loop {
            let mut current = key.as_str();
            while let Some(folder) = parent(current) {
                self.remove_op(&ResultReference::new(node, folder), Op::ListFolder);
                current = folder;
            }
            match self.parents.get(&node) {
                Some(link) => {
                    node = link.owner;
                    key.clone_from(&link.key);
                }
                None => return,
            }
        }
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Cache of `list_folder` and `item_attributes` results.
///
/// Readers take a [`generation`](Self::generation) before computing a result
/// and hand it to [`publish`](Self::publish). A result computed across an
/// invalidation is returned to its caller but not kept.
#[derive(Default)]
pub struct OperationResultCache {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for OperationResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationResultCache")
            .field("results", &self.len())
            .finish_non_exhaustive()
    }
}

impl OperationResultCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current invalidation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Record where `node` hangs off its parent, so invalidation can cross
    /// into the parent node.
    pub fn register_node(&self, node: NodeId, parent: Option<ResultReference>) {
        let mut inner = self.lock();
        match parent {
            Some(link) => {
                inner.parents.insert(node, link);
            }
            None => {
                inner.parents.remove(&node);
            }
        }
    }

    /// Drop every result owned by `node` and every reference to them.
    pub fn forget_node(&self, node: NodeId) {
        let mut inner = self.lock();
        inner.bump();
        inner.holders.retain(|at, _| at.owner != node);
        inner.refs.retain(|_, at| at.owner != node);
        inner.linked.retain(|at, _| at.owner != node);
        inner.parents.remove(&node);
        trace!(node = node.0, "result cache: forgot node");
    }

    /// Store `result` for `(node, key, op)`.
    ///
    /// Returns the reference to link paths to, or `None` if the result is not
    /// cacheable.
    pub fn cache_result(
        &self,
        node: NodeId,
        key: &str,
        op: Op,
        result: CachedResult,
    ) -> Option<ResultReference> {
        if !result.is_cacheable() {
            return None;
        }
        let at = ResultReference::new(node, key);
        self.lock().insert(&at, op, result);
        Some(at)
    }

    /// Point absolute `path` at `reference`.
    pub fn link(&self, path: impl Into<String>, reference: ResultReference) {
        self.lock().link(path.into(), reference);
    }

    /// Cache `result` and link `path` to it, unless an invalidation ran since
    /// `observed` was taken. Returns whether the result was kept.
    pub fn publish(
        &self,
        observed: u64,
        path: &str,
        node: NodeId,
        key: &str,
        op: Op,
        result: CachedResult,
    ) -> bool {
        if !result.is_cacheable() {
            return false;
        }
        let mut inner = self.lock();
        if inner.generation != observed {
            trace!(path, ?op, "result cache: discarding result computed across an invalidation");
            return false;
        }
        let at = ResultReference::new(node, key);
        inner.insert(&at, op, result);
        inner.link(path.to_owned(), at);
        true
    }

    /// The result of `op` cached for absolute `path`.
    #[must_use]
    pub fn lookup(&self, path: &str, op: Op) -> Option<CachedResult> {
        let inner = self.lock();
        let hit = inner
            .refs
            .get(path)
            .and_then(|at| inner.holders.get(at))
            .and_then(|holder| holder.get(&op))
            .cloned();
        trace!(path, ?op, hit = hit.is_some(), "result cache: lookup");
        hit
    }

    /// The result of `op` cached directly at `(node, key)`.
    #[must_use]
    pub fn get(&self, node: NodeId, key: &str, op: Op) -> Option<CachedResult> {
        self.lock()
            .holders
            .get(&ResultReference::new(node, key))
            .and_then(|holder| holder.get(&op))
            .cloned()
    }

    /// Drop the result of `op` at `(node, key)`.
    pub fn invalidate(&self, node: NodeId, key: &str, op: Op) {
        let mut inner = self.lock();
        inner.bump();
        inner.remove_op(&ResultReference::new(node, key), op);
    }

    /// Drop every result at `(node, key)`.
    pub fn invalidate_all(&self, node: NodeId, key: &str) {
        let mut inner = self.lock();
        inner.bump();
        inner.drop_holder(&ResultReference::new(node, key));
    }

    /// A file appeared at `key`: drop the listing of every enclosing folder.
    ///
    /// The new file's own attributes are left alone.
    pub fn invalidate_on_create(&self, node: NodeId, key: &str) {
        let mut inner = self.lock();
        inner.bump();
        let mut current = key;
        while let Some(folder) = parent(current) {
            inner.remove_op(&ResultReference::new(node, folder), Op::ListFolder);
            current = folder;
        }
        trace!(node = node.0, key, "result cache: invalidated on create");
    }

    /// The entry at `key` disappeared.
    ///
    /// Its name is removed from the cached parent listing. When that listing
    /// empties, or `folder_is_empty` reports that the folder holds nothing
    /// live any more, the folder is treated as gone too and the walk
    /// continues upward, crossing into parent nodes at container boundaries.
    pub fn invalidate_on_delete(
        &self,
        node: NodeId,
        key: &str,
        folder_is_empty: impl Fn(&str) -> bool,
    ) {
        let mut inner = self.lock();
        inner.bump();
        inner.drop_holder(&ResultReference::new(node, key));

        let mut current = key.to_owned();
        loop {
            let Some(folder) = parent(&current).map(str::to_owned) else {
                // The container itself stays, but listings above it are stale.
                if let Some(link) = inner.parents.get(&node).cloned() {
                    inner.drop_enclosing_listings(link.owner, link.key);
                }
                break;
            };
            let at = ResultReference::new(node, folder.as_str());
            let emptied = inner.remove_from_listing(&at, file_name(&current));
            if emptied != Some(true) && !folder_is_empty(&folder) {
                break;
            }
            inner.drop_holder(&at);
            current = folder;
        }
        trace!(node = node.0, key, "result cache: invalidated on delete");
    }

    /// The entry at `key` disappeared and nothing is known about what is left
    /// around it: drop its results and every enclosing listing, in this node
    /// and above.
    pub fn invalidate_enclosing(&self, node: NodeId, key: &str) {
        let mut inner = self.lock();
        inner.bump();
        inner.drop_holder(&ResultReference::new(node, key));
        inner.drop_enclosing_listings(node, key.to_owned());
    }

    /// `old` was renamed to `new`: apply creation of `new`, then deletion of
    /// `old`.
    pub fn invalidate_on_rename(
        &self,
        node: NodeId,
        old: &str,
        new: &str,
        folder_is_empty: impl Fn(&str) -> bool,
    ) {
        self.invalidate_on_create(node, new);
        self.invalidate_on_delete(node, old, folder_is_empty);
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().holders.values().map(HashMap::len).sum()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: NodeId = NodeId(1);
    const CHILD: NodeId = NodeId(2);

    fn listing(names: &[&str]) -> CachedResult {
        CachedResult::Listing(
            names
                .iter()
                .map(|n| ListEntry {
                    name: (*n).to_owned(),
                    is_folder: false,
                })
                .collect(),
        )
    }

    fn file_attrs() -> CachedResult {
        CachedResult::Attributes(ItemAttributes {
            item_type: ItemType::File,
            size: 3,
            version: 0,
            created: std::time::SystemTime::UNIX_EPOCH,
            modified: std::time::SystemTime::UNIX_EPOCH,
        })
    }

    fn names(cache: &OperationResultCache, node: NodeId, key: &str) -> Option<Vec<String>> {
        match cache.get(node, key, Op::ListFolder)? {
            CachedResult::Listing(l) => Some(l.iter().map(|e| e.name.clone()).collect()),
            CachedResult::Attributes(_) => None,
        }
    }

    #[test]
    fn folder_attributes_are_not_cached() {
        let cache = OperationResultCache::new();
        let folder = CachedResult::Attributes(ItemAttributes::folder(ItemType::InferredFolder, 0));
        assert!(cache.cache_result(ROOT, "a", Op::ItemAttributes, folder).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_follows_reference() {
        let cache = OperationResultCache::new();
        let seen = cache.generation();
        assert!(cache.publish(
            seen,
            "/_public/a.txt",
            CHILD,
            "a.txt",
            Op::ItemAttributes,
            file_attrs(),
        ));
        assert_eq!(
            cache.lookup("/_public/a.txt", Op::ItemAttributes),
            Some(file_attrs())
        );
        assert!(cache.lookup("/_public/a.txt", Op::ListFolder).is_none());
    }

    #[test]
    fn forgetting_a_node_breaks_its_references() {
        let cache = OperationResultCache::new();
        let seen = cache.generation();
        cache.publish(seen, "/_public/a.txt", CHILD, "a.txt", Op::ItemAttributes, file_attrs());
        cache.publish(seen, "/", ROOT, "", Op::ListFolder, listing(&["_public"]));
        cache.forget_node(CHILD);
        assert!(cache.lookup("/_public/a.txt", Op::ItemAttributes).is_none());
        assert!(cache.lookup("/", Op::ListFolder).is_some());
    }

    #[test]
    fn create_drops_ancestor_listings_but_keeps_new_attributes() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["a"]));
        cache.cache_result(ROOT, "a", Op::ListFolder, listing(&["x"]));
        cache.cache_result(ROOT, "a/b", Op::ListFolder, listing(&["y"]));
        cache.cache_result(ROOT, "a/b/new.txt", Op::ItemAttributes, file_attrs());

        cache.invalidate_on_create(ROOT, "a/b/new.txt");

        assert!(names(&cache, ROOT, "").is_none());
        assert!(names(&cache, ROOT, "a").is_none());
        assert!(names(&cache, ROOT, "a/b").is_none());
        assert!(cache.get(ROOT, "a/b/new.txt", Op::ItemAttributes).is_some());
    }

    #[test]
    fn delete_removes_name_from_parent_listing() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["a"]));
        cache.cache_result(ROOT, "a", Op::ListFolder, listing(&["b.txt", "c.txt"]));
        cache.cache_result(ROOT, "a/b.txt", Op::ItemAttributes, file_attrs());

        cache.invalidate_on_delete(ROOT, "a/b.txt", |_| false);

        assert_eq!(names(&cache, ROOT, "a"), Some(vec!["c.txt".to_owned()]));
        assert_eq!(names(&cache, ROOT, ""), Some(vec!["a".to_owned()]));
        assert!(cache.get(ROOT, "a/b.txt", Op::ItemAttributes).is_none());
    }

    #[test]
    fn delete_of_last_item_cascades_upward() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["a", "top.txt"]));
        cache.cache_result(ROOT, "a", Op::ListFolder, listing(&["b"]));
        cache.cache_result(ROOT, "a/b", Op::ListFolder, listing(&["c.txt"]));

        cache.invalidate_on_delete(ROOT, "a/b/c.txt", |_| false);

        assert!(names(&cache, ROOT, "a/b").is_none());
        assert!(names(&cache, ROOT, "a").is_none());
        assert_eq!(names(&cache, ROOT, ""), Some(vec!["top.txt".to_owned()]));
    }

    #[test]
    fn empty_folder_cascades_without_cached_listing() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["a", "top.txt"]));

        cache.invalidate_on_delete(ROOT, "a/b.txt", |folder| folder == "a");

        assert_eq!(names(&cache, ROOT, ""), Some(vec!["top.txt".to_owned()]));
    }

    #[test]
    fn emptied_container_cascades_into_parent_node() {
        let cache = OperationResultCache::new();
        cache.register_node(CHILD, Some(ResultReference::new(ROOT, "apps/_public")));
        cache.cache_result(ROOT, "apps", Op::ListFolder, listing(&["_public"]));
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["apps"]));
        cache.cache_result(CHILD, "", Op::ListFolder, listing(&["only.txt"]));

        cache.invalidate_on_delete(CHILD, "only.txt", |_| false);

        assert!(names(&cache, CHILD, "").is_none());
        assert!(names(&cache, ROOT, "apps").is_none());
        assert!(names(&cache, ROOT, "").is_none());
    }

    #[test]
    fn rename_applies_create_before_delete() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["old.txt"]));
        cache.cache_result(ROOT, "old.txt", Op::ItemAttributes, file_attrs());

        cache.invalidate_on_rename(ROOT, "old.txt", "new.txt", |_| false);

        assert!(names(&cache, ROOT, "").is_none());
        assert!(cache.get(ROOT, "old.txt", Op::ItemAttributes).is_none());
    }

    #[test]
    fn cascade_consults_emptiness_above_uncached_listings() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["deep", "keep.txt"]));

        // Neither "deep/er" nor "deep" has a cached listing; both are empty now.
        cache.invalidate_on_delete(ROOT, "deep/er/only.txt", |folder| {
            folder == "deep/er" || folder == "deep"
        });

        assert_eq!(names(&cache, ROOT, ""), Some(vec!["keep.txt".to_owned()]));
    }

    #[test]
    fn cascade_stops_at_a_folder_that_still_holds_entries() {
        let cache = OperationResultCache::new();
        cache.cache_result(ROOT, "", Op::ListFolder, listing(&["a"]));

        cache.invalidate_on_delete(ROOT, "a/b/c.txt", |folder| folder == "a/b");

        assert_eq!(names(&cache, ROOT, ""), Some(vec!["a".to_owned()]));
    }

    #[test]
    fn result_computed_across_an_invalidation_is_not_kept() {
        let cache = OperationResultCache::new();
        let seen = cache.generation();
        cache.invalidate(ROOT, "a.txt", Op::ItemAttributes);

        let kept = cache.publish(seen, "/a.txt", ROOT, "a.txt", Op::ItemAttributes, file_attrs());
        assert!(!kept);
        assert!(cache.lookup("/a.txt", Op::ItemAttributes).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn removed_holders_unlink_their_paths() {
        let cache = OperationResultCache::new();
        let seen = cache.generation();
        let attrs = file_attrs();
        cache.publish(seen, "/docs/a.txt", ROOT, "docs/a.txt", Op::ItemAttributes, attrs);
        cache.publish(seen, "/docs", ROOT, "docs", Op::ListFolder, listing(&["a.txt"]));
        assert_eq!(cache.lock().refs.len(), 2);

        cache.invalidate_on_delete(ROOT, "docs/a.txt", |_| false);

        let inner = cache.lock();
        assert!(inner.refs.is_empty());
        assert!(inner.linked.is_empty());
    }
}
