//! Virtual filesystem for Nimbus.
//!
//! Files and directories are JSON documents (`io.cozy.files`); their bytes
//! live in a blob store addressed by document id. The index enforces
//! parent/name uniqueness and caches directory paths; the blob store writes
//! atomically with backup and rollback; the [`Vfs`] facade ties both
//! together and keeps the MD5 bookkeeping honest.

pub mod blob;
pub mod doc;
pub mod index;
mod vfs;

pub use blob::{BlobInfo, BlobStore};
pub use doc::{conflict_name, DirDoc, DocKind, FileDoc, RefBy, ROOT_DIR_ID, TRASH_DIR_ID};
pub use index::VfsIndex;
pub use vfs::Vfs;
