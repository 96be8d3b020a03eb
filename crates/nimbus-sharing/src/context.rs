//! Per-instance context.
//!
//! Every operation of the engine receives this bundle instead of reaching
//! for globals: the document store, the VFS, the locker, the peer factory,
//! the clock, and the configuration. The write helpers here are the local
//! mutation path: they persist the document and project the change onto
//! the shared log in one place.

use std::sync::Arc;

use nimbus_core::config::Config;
use nimbus_core::types::consts;
use nimbus_core::{Clock, Error, JsonDoc, Result};
use nimbus_vfs::{DirDoc, FileDoc, Vfs, ROOT_DIR_ID};

use crate::lock::Locker;
use crate::peer::PeerFactory;
use crate::shared::{self, DocEvent};
use crate::store::DocumentStore;
use crate::trigger::TriggerRegistry;
use crate::upload::UploadKeyStore;

/// Everything one instance's sharing engine depends on.
pub struct Context {
    /// Domain of this instance, e.g. `alice.example.net`.
    pub domain: String,
    pub store: Arc<dyn DocumentStore>,
    pub vfs: Arc<Vfs>,
    pub locker: Arc<dyn Locker>,
    pub peers: Arc<dyn PeerFactory>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
    pub triggers: Arc<TriggerRegistry>,
    pub uploads: Arc<UploadKeyStore>,
}

impl Context {
    /// Write a generic document, then feed the shared log.
    pub async fn write_doc(&self, doctype: &str, doc: JsonDoc) -> Result<String> {
        let rev = self.store.put(doctype, doc.clone()).await?;
        let mut tracked = doc;
        tracked.set_rev(rev.clone());
        self.track(DocEvent {
            doctype: doctype.to_string(),
            doc: tracked,
            rev: rev.clone(),
            deleted: false,
            md5_changed: false,
            ancestors: Vec::new(),
        })
        .await;
        Ok(rev)
    }

    /// Delete a generic document, then feed the shared log.
    pub async fn delete_doc(&self, doctype: &str, id: &str, rev: &str) -> Result<String> {
        let new_rev = self.store.delete(doctype, id, rev).await?;
        let mut tombstone = JsonDoc::with_id(id);
        tombstone.set_rev(new_rev.clone());
        tombstone.mark_deleted();
        self.track(DocEvent {
            doctype: doctype.to_string(),
            doc: tombstone,
            rev: new_rev.clone(),
            deleted: true,
            md5_changed: false,
            ancestors: Vec::new(),
        })
        .await;
        Ok(new_rev)
    }

    /// Write a file document, with or without new content.
    ///
    /// Content lands in the blob store first; the document (with its MD5
    /// and size refreshed) goes to the document store second; the shared
    /// log sees the event last, with `md5_changed` telling the uploader
    /// whether bytes must travel.
    pub async fn write_file(&self, mut file: FileDoc, content: Option<&[u8]>) -> Result<FileDoc> {
        let existing = self.vfs.index().file(&file.id);
        let md5_before = existing.as_ref().map(|f| f.md5.clone());

        match (&existing, content) {
            (None, Some(bytes)) => {
                file = self.vfs.create_file(file, bytes)?;
            }
            (None, None) => {
                return Err(Error::Store(format!(
                    "new file {} needs content",
                    file.id
                )))
            }
            (Some(_), Some(bytes)) => {
                let refreshed = self.vfs.update_content(&file.id, bytes)?;
                file.md5 = refreshed.md5;
                file.size = refreshed.size;
                file.updated_at = self.clock.now();
                self.vfs.index().update_file(file.clone())?;
            }
            (Some(_), None) => {
                file.updated_at = self.clock.now();
                self.vfs.index().update_file(file.clone())?;
            }
        }

        let new_rev = match self.store.put(consts::FILES, file.to_json()?).await {
            Ok(rev) => rev,
            Err(e) => {
                // A fresh file that failed the store write must not linger
                // half-created in the index.
                if existing.is_none() {
                    let _ = self.vfs.index().remove_file(&file.id);
                }
                return Err(e);
            }
        };
        file.rev = Some(new_rev.clone());
        self.vfs.index().update_file(file.clone())?;

        let md5_changed = md5_before.as_deref() != Some(file.md5.as_str());
        self.track_file(&file, new_rev, md5_changed).await;
        Ok(file)
    }

    /// Resolve a directory by path, creating missing components through
    /// the tracked write path (so new directories replicate).
    pub async fn mkdir_p(&self, path: &str) -> Result<DirDoc> {
        let dir = self.vfs.mkdir_p(path)?;
        let mut ids = self.vfs.index().ancestors(&dir.id);
        // Parents first, so every directory has a revision before its
        // children reference it.
        ids.reverse();
        for id in ids {
            if id == ROOT_DIR_ID {
                continue;
            }
            let Some(mut component) = self.vfs.index().dir(&id) else {
                continue;
            };
            if component.rev.is_some() {
                continue;
            }
            let rev = self.store.put(consts::FILES, component.to_json()?).await?;
            component.rev = Some(rev.clone());
            self.vfs.index().update_dir(component.clone())?;
            let ancestors = self.vfs.index().ancestors(&component.dir_id);
            self.track(DocEvent {
                doctype: consts::FILES.to_string(),
                doc: component.to_json()?,
                rev,
                deleted: false,
                md5_changed: false,
                ancestors,
            })
            .await;
        }
        self.vfs
            .index()
            .dir(&dir.id)
            .ok_or_else(|| Error::NotFound(format!("directory {}", dir.id)))
    }

    /// Rename and/or move a file (metadata only).
    pub async fn rename_file(&self, id: &str, new_dir_id: &str, new_name: &str) -> Result<FileDoc> {
        let mut file = self
            .vfs
            .index()
            .file(id)
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        file.dir_id = new_dir_id.to_string();
        file.name = new_name.to_string();
        self.write_file(file, None).await
    }

    /// Move a file to the trash and feed the shared log.
    pub async fn trash_file(&self, id: &str) -> Result<FileDoc> {
        let mut file = self.vfs.trash_file(id)?;
        let new_rev = self.store.put(consts::FILES, file.to_json()?).await?;
        file.rev = Some(new_rev.clone());
        self.vfs.index().update_file(file.clone())?;
        self.track_file(&file, new_rev, false).await;
        Ok(file)
    }

    async fn track_file(&self, file: &FileDoc, rev: String, md5_changed: bool) {
        let ancestors = self.vfs.index().ancestors(&file.dir_id);
        let doc = match file.to_json() {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!("File document serialization failed: id={}, error={}", file.id, e);
                return;
            }
        };
        self.track(DocEvent {
            doctype: consts::FILES.to_string(),
            doc,
            rev,
            deleted: false,
            md5_changed,
            ancestors,
        })
        .await;
    }

    async fn track(&self, event: DocEvent) {
        if self.triggers.is_tracked(&event.doctype) {
            shared::track(self, &event).await;
        }
    }
}
