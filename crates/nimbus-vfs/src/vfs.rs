//! The VFS facade.
//!
//! Ties the index and the blob store together: content writes keep the MD5
//! and size fields of the file document in sync with the stored bytes, and
//! a failed index insert rolls the blob write back.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use nimbus_core::{random_hex, Clock, Error, Result};

use crate::blob::{md5_hex, BlobInfo, BlobStore};
use crate::doc::{DirDoc, FileDoc, TRASH_DIR_ID};
use crate::index::VfsIndex;

/// A complete virtual filesystem for one instance.
pub struct Vfs {
    index: VfsIndex,
    blobs: BlobStore,
    clock: Arc<dyn Clock>,
}

impl Vfs {
    /// Open a VFS whose blobs live under the given directory.
    pub fn new(base: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            index: VfsIndex::new(clock.now()),
            blobs: BlobStore::new(base)?,
            clock,
        })
    }

    pub fn index(&self) -> &VfsIndex {
        &self.index
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Resolve a directory by path, creating missing components.
    pub fn mkdir_p(&self, path: &str) -> Result<DirDoc> {
        if let Some(dir) = self.index.dir_by_path(path) {
            return Ok(dir);
        }
        let mut current = self
            .index
            .dir_by_path("/")
            .ok_or_else(|| Error::NotFound("root directory".to_string()))?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = match self.index.child_by_name(&current.id, segment) {
                Some(crate::doc::DocKind::Dir(dir)) => dir,
                Some(crate::doc::DocKind::File(file)) => {
                    return Err(Error::PathExists(format!(
                        "{}/{}",
                        current.fullpath.trim_end_matches('/'),
                        file.name
                    )))
                }
                None => {
                    let dir =
                        DirDoc::new(random_hex(16), current.id.clone(), segment, "", self.now());
                    self.index.add_dir(dir.clone())?;
                    // add_dir recomputed the fullpath; read it back.
                    self.index
                        .dir(&dir.id)
                        .ok_or_else(|| Error::NotFound(format!("directory {}", dir.id)))?
                }
            };
        }
        debug!("Created directory path: {}", current.fullpath);
        Ok(current)
    }

    /// Create a file with the given content.
    ///
    /// The document's `md5` and `size` are derived from the bytes, never
    /// trusted from the caller.
    pub fn create_file(&self, mut file: FileDoc, content: &[u8]) -> Result<FileDoc> {
        let info = self.blobs.put(&file.id, content)?;
        file.md5 = info.md5;
        file.size = info.size;
        if let Err(e) = self.index.add_file(file.clone()) {
            // Do not leave orphaned bytes behind a failed insert.
            let _ = self.blobs.remove(&file.id);
            return Err(e);
        }
        info!("Created file: id={}, name={}, size={}", file.id, file.name, file.size);
        Ok(file)
    }

    /// Replace the content of an existing file.
    pub fn update_content(&self, id: &str, content: &[u8]) -> Result<FileDoc> {
        let mut file = self
            .index
            .file(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        let BlobInfo { md5, size } = self.blobs.put(id, content)?;
        file.md5 = md5;
        file.size = size;
        file.updated_at = self.now();
        self.index.update_file(file.clone())?;
        Ok(file)
    }

    /// Read a file's bytes.
    pub fn content(&self, id: &str) -> Result<Vec<u8>> {
        self.blobs.get(id)
    }

    /// Verify stored bytes against the document's MD5.
    pub fn verify_content(&self, id: &str) -> Result<bool> {
        let file = self
            .index
            .file(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        Ok(md5_hex(&self.blobs.get(id)?) == file.md5)
    }

    /// Rename and/or move a file.
    pub fn rename_file(&self, id: &str, new_dir_id: &str, new_name: &str) -> Result<FileDoc> {
        let mut file = self
            .index
            .file(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        file.dir_id = new_dir_id.to_string();
        file.name = new_name.to_string();
        file.updated_at = self.now();
        self.index.update_file(file.clone())?;
        Ok(file)
    }

    /// Move a file to the trash, remembering where it came from.
    pub fn trash_file(&self, id: &str) -> Result<FileDoc> {
        let mut file = self
            .index
            .file(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        if file.trashed {
            return Ok(file);
        }
        let origin = self
            .index
            .dir(&file.dir_id)
            .map(|d| d.fullpath)
            .unwrap_or_else(|| "/".to_string());
        file.restore_path = Some(origin);
        file.dir_id = TRASH_DIR_ID.to_string();
        file.trashed = true;
        file.updated_at = self.now();
        self.index.update_file(file.clone())?;
        info!("Trashed file: id={}, name={}", file.id, file.name);
        Ok(file)
    }

    /// Restore a trashed file to its original directory, recreating it if
    /// it disappeared in the meantime.
    pub fn restore_file(&self, id: &str) -> Result<FileDoc> {
        let mut file = self
            .index
            .file(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        if !file.trashed {
            return Ok(file);
        }
        let origin = file.restore_path.take().unwrap_or_else(|| "/".to_string());
        let parent = self.mkdir_p(&origin)?;
        file.dir_id = parent.id;
        file.trashed = false;
        file.updated_at = self.now();
        self.index.update_file(file.clone())?;
        info!("Restored file: id={}, name={}", file.id, file.name);
        Ok(file)
    }
}
