//! containerfs shared library.
//!
//! A filesystem-like access layer over a remote, versioned key-value
//! container store: descriptor-based file I/O with versioned commits, plus a
//! hierarchy of namespace nodes whose listing and attribute results are cached
//! until a mutation invalidates them.

/// Caching of operation results.
pub mod cache;
pub mod error;
/// Filesystem core: descriptors, file states, nodes and routing.
pub mod fs;
pub mod session;
pub mod store;

pub use error::{FsError, FsResult};
pub use fs::{ContainerFs, Descriptor, FsStats, ItemAttributes, ItemType, ListEntry, OpenFlags};
