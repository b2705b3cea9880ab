use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::Descriptor;
use super::file_state::FileState;

/// Largest descriptor handed out before the counter wraps back to 1.
pub const MAX_DESCRIPTOR: Descriptor = (1 << 53) - 1;

/// A file state shared between the descriptor table and the operation
/// currently running on it.
pub type SharedFileState = Arc<Mutex<FileState>>;

/// Maps live descriptors to their open-file state.
///
/// Descriptors come from a counter that wraps at [`MAX_DESCRIPTOR`] back to 1
/// and skips values that are still live, so a descriptor is never reused
/// while its state exists.
#[must_use]
pub struct DescriptorTable {
    next: AtomicU64,
    open: scc::HashMap<Descriptor, SharedFileState>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("open", &self.open.len())
            .finish_non_exhaustive()
    }
}

impl DescriptorTable {
    /// An empty table whose first descriptor is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(next: Descriptor) -> Self {
        Self {
            next: AtomicU64::new(next),
            open: scc::HashMap::new(),
        }
    }

    fn next_candidate(&self) -> Descriptor {
        let (Ok(d) | Err(d)) = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(if d >= MAX_DESCRIPTOR { 1 } else { d + 1 })
            });
        d
    }

    /// Register `state` under a fresh descriptor.
    pub fn allocate(&self, state: FileState) -> Descriptor {
        self.share(&Arc::new(Mutex::new(state)))
    }

    /// Register an already shared state under a fresh descriptor. Every
    /// descriptor bound to it sees the same open file.
    pub fn share(&self, state: &SharedFileState) -> Descriptor {
        loop {
            let candidate = self.next_candidate();
            if self.open.insert_sync(candidate, Arc::clone(state)).is_ok() {
                return candidate;
            }
        }
    }

    /// Forget `d`. Returns the state it held, if any.
    pub fn release(&self, d: Descriptor) -> Option<SharedFileState> {
        self.open.remove_sync(&d).map(|(_, state)| state)
    }

    /// The state registered under `d`.
    #[must_use]
    pub fn lookup(&self, d: Descriptor) -> Option<SharedFileState> {
        self.open.read_sync(&d, |_, state| Arc::clone(state))
    }

    /// Register `state` under an existing descriptor, replacing whatever was
    /// there.
    pub fn restore(&self, d: Descriptor, state: SharedFileState) {
        self.open.upsert_sync(d, state);
    }

    /// Number of live descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether no descriptor is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_increasing_descriptors_from_one() {
        let table = DescriptorTable::new();
        assert_eq!(table.allocate(FileState::new_file("/a")), 1);
        assert_eq!(table.allocate(FileState::new_file("/b")), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn lookup_after_release_is_none() {
        let table = DescriptorTable::new();
        let d = table.allocate(FileState::new_file("/a"));
        assert!(table.lookup(d).is_some());
        assert!(table.release(d).is_some());
        assert!(table.lookup(d).is_none());
        assert!(table.release(d).is_none());
    }

    #[test]
    fn wraps_at_max_and_skips_live_values() {
        let table = DescriptorTable::starting_at(MAX_DESCRIPTOR);
        let last = table.allocate(FileState::new_file("/a"));
        assert_eq!(last, MAX_DESCRIPTOR);
        // 1 is still free, so the counter lands there.
        let first = table.allocate(FileState::new_file("/b"));
        assert_eq!(first, 1);

        let table = DescriptorTable::starting_at(MAX_DESCRIPTOR);
        table.restore(1, Arc::new(Mutex::new(FileState::new_file("/held"))));
        assert_eq!(table.allocate(FileState::new_file("/a")), MAX_DESCRIPTOR);
        assert_eq!(
            table.allocate(FileState::new_file("/b")),
            2,
            "descriptor 1 is live and must be skipped"
        );
    }

    #[tokio::test]
    async fn restore_replaces_state_under_same_descriptor() {
        let table = DescriptorTable::new();
        let d = table.allocate(FileState::new_file("/a"));
        table.restore(d, Arc::new(Mutex::new(FileState::new_file("/b"))));
        let state = table.lookup(d).unwrap();
        assert_eq!(state.lock().await.item_path(), "/b");
    }

    #[tokio::test]
    async fn shared_descriptors_see_one_state() {
        let table = DescriptorTable::new();
        let first = table.allocate(FileState::new_file("/a"));
        let state = table.lookup(first).unwrap();
        let second = table.share(&state);
        assert_ne!(first, second);
        assert!(Arc::ptr_eq(&state, &table.lookup(second).unwrap()));

        table.release(first);
        assert_eq!(table.lookup(second).unwrap().lock().await.item_path(), "/a");
    }
}
