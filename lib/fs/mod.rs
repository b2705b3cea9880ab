//! Filesystem-like access to a tree of remote containers.
/// The consumer-facing filesystem façade.
pub mod container_fs;
/// Process-wide descriptor → open-file table.
pub mod descriptor;
/// Flat-key index over one container's entries.
pub mod entry_index;
/// Path-based file operations over one container.
pub mod file_registry;
/// Per-open-file state machine.
pub mod file_state;
/// Namespace nodes, one per remote container.
pub mod node;
/// Node registry and path routing.
pub mod registry;

pub use container_fs::{ContainerFs, FsStats};
pub use descriptor::DescriptorTable;

use std::time::SystemTime;

use bitflags::bitflags;

use crate::store::{OpenMode, Version};

/// An open-file handle handed out to callers.
pub type Descriptor = u64;

/// Identifier of a namespace node. A replaced node gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// The blob mode these flags translate to.
    ///
    /// Blobs cannot be edited in place, so any writable open without
    /// `APPEND` starts from empty content.
    #[must_use]
    pub fn open_mode(self) -> OpenMode {
        if !self.intersects(Self::WRONLY | Self::RDWR) {
            OpenMode::Read
        } else if self.contains(Self::APPEND) && !self.contains(Self::TRUNC) {
            OpenMode::Append
        } else {
            OpenMode::Overwrite
        }
    }
}

impl From<OpenFlags> for OpenMode {
    fn from(flags: OpenFlags) -> Self {
        flags.open_mode()
    }
}

/// What a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// A committed file.
    File,
    /// A file created through this core and not yet committed.
    NewFile,
    /// A container (the namespace root or a nested-container pointer).
    Container,
    /// A folder implied by keys sharing a `/`-separated prefix.
    InferredFolder,
}

impl ItemType {
    /// Whether entries of this type can be listed.
    #[must_use]
    pub fn is_folder(self) -> bool {
        matches!(self, Self::Container | Self::InferredFolder)
    }
}

/// Attributes reported by `item_attributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemAttributes {
    /// What the path names.
    pub item_type: ItemType,
    /// Content length in bytes. Zero for folders.
    pub size: u64,
    /// Version of the backing entry. Zero for new files and inferred folders.
    pub version: Version,
    /// Creation time.
    pub created: SystemTime,
    /// Last modification time.
    pub modified: SystemTime,
}

impl ItemAttributes {
    /// Attributes of a folder with no backing entry of its own.
    #[must_use]
    pub fn folder(item_type: ItemType, version: Version) -> Self {
        Self {
            item_type,
            size: 0,
            version,
            created: SystemTime::UNIX_EPOCH,
            modified: SystemTime::UNIX_EPOCH,
        }
    }

    /// Attributes published for a file between create and first commit.
    #[must_use]
    pub fn new_file() -> Self {
        let now = SystemTime::now();
        Self {
            item_type: ItemType::NewFile,
            size: 0,
            version: 0,
            created: now,
            modified: now,
        }
    }
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListEntry {
    /// Name relative to the listed folder. Never contains `/`.
    pub name: String,
    /// What the name refers to.
    pub is_folder: bool,
}

pub mod path {
    //! Helpers over `/`-separated paths.
    //!
    //! Namespace paths are absolute (`/_public/docs/a.txt`). Keys inside a
    //! container are relative and never start with `/` (`docs/a.txt`); the
    //! container itself is the empty key.

    /// Canonical absolute form: leading `/`, no trailing or doubled `/`.
    #[must_use]
    pub fn normalize(path: &str) -> String {
        let mut out = String::with_capacity(path.len() + 1);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// The relative key under which `path` lives in a node rooted at `base`.
    ///
    /// Both arguments must be normalized. Returns `None` if `path` is not
    /// inside `base`.
    #[must_use]
    pub fn relative<'a>(base: &str, path: &'a str) -> Option<&'a str> {
        if base == "/" {
            return Some(path.trim_start_matches('/'));
        }
        let rest = path.strip_prefix(base)?;
        if rest.is_empty() {
            Some("")
        } else {
            rest.strip_prefix('/')
        }
    }

    /// Join a normalized absolute path and a relative key.
    #[must_use]
    pub fn join(base: &str, key: &str) -> String {
        if key.is_empty() {
            base.to_owned()
        } else if base == "/" {
            format!("/{key}")
        } else {
            format!("{base}/{key}")
        }
    }

    /// The relative key of the folder holding `key`. The container itself
    /// has no parent.
    #[must_use]
    pub fn parent(key: &str) -> Option<&str> {
        if key.is_empty() {
            return None;
        }
        Some(key.rsplit_once('/').map_or("", |(parent, _)| parent))
    }

    /// The last segment of `key`.
    #[must_use]
    pub fn file_name(key: &str) -> &str {
        key.rsplit_once('/').map_or(key, |(_, name)| name)
    }

    /// The prefix every key inside folder `key` starts with.
    #[must_use]
    pub fn folder_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_flags_open_for_reading() {
        assert_eq!(OpenFlags::RDONLY.open_mode(), OpenMode::Read);
        assert_eq!(OpenFlags::empty().open_mode(), OpenMode::Read);
    }

    #[test]
    fn writable_flags_pick_overwrite_or_append() {
        assert_eq!(OpenFlags::WRONLY.open_mode(), OpenMode::Overwrite);
        assert_eq!(
            (OpenFlags::WRONLY | OpenFlags::APPEND).open_mode(),
            OpenMode::Append
        );
        assert_eq!(
            (OpenFlags::RDWR | OpenFlags::APPEND | OpenFlags::TRUNC).open_mode(),
            OpenMode::Overwrite
        );
    }
}
