//! Blob store - file bytes addressed by document id.
//!
//! Blobs are stored in a two-level directory structure based on the MD5 of
//! the document id for even distribution.
//!
//! # File Layout
//! ```text
//! <base>/blobs/
//! └── ab/
//!     └── cd/
//!         └── ab cd ef ...  # blob data file
//! ```
//!
//! Replacement is atomic: the new bytes land in a temp file, the previous
//! blob is kept as a backup until the rename succeeds, and a failed swap
//! rolls the backup back into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{debug, warn};

use nimbus_core::{random_hex, Error, Result};

/// Outcome of a blob write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    /// Lowercase hex MD5 of the stored bytes.
    pub md5: String,
    pub size: u64,
}

/// Lowercase hex MD5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Persistent, id-addressed byte storage.
pub struct BlobStore {
    base: PathBuf,
}

impl BlobStore {
    /// Open (or create) a blob store rooted at the given directory.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(base.join("tmp"))?;
        fs::create_dir_all(base.join("blobs"))?;
        debug!("Blob store directory: {:?}", base);
        Ok(Self { base })
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        let digest = hex::encode(Md5::digest(id.as_bytes()));
        self.base
            .join("blobs")
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(digest)
    }

    /// Whether bytes exist for the given id.
    pub fn exists(&self, id: &str) -> bool {
        self.blob_path(id).exists()
    }

    /// Read the bytes stored for the given id.
    pub fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(id);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("blob {}", id)),
            _ => Error::Io(e),
        })
    }

    /// Atomically create or replace the bytes for the given id.
    ///
    /// The previous content, if any, is moved aside first and restored when
    /// the final rename fails, so a crashed replacement never loses data.
    pub fn put(&self, id: &str, data: &[u8]) -> Result<BlobInfo> {
        let target = self.blob_path(id);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.base.join("tmp").join(random_hex(8));
        write_all(&tmp, data)?;

        let backup = target.with_extension("bak");
        let had_previous = target.exists();
        if had_previous {
            fs::rename(&target, &backup)?;
        }

        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            if had_previous {
                if let Err(restore) = fs::rename(&backup, &target) {
                    warn!("Blob rollback failed for {}: {}", id, restore);
                }
            }
            return Err(Error::Io(e));
        }
        if had_previous {
            let _ = fs::remove_file(&backup);
        }

        Ok(BlobInfo {
            md5: md5_hex(data),
            size: data.len() as u64,
        })
    }

    /// Remove the bytes for the given id. Missing blobs are not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn write_all(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}
