//! Document store adapter.
//!
//! The sharing engine talks to the JSON document database through the
//! [`DocumentStore`] trait: get/put with compare-and-swap on the revision,
//! forced-revision writes for replicated documents, bulk reads with
//! revision chains, a monotonic changes feed, and index lookups. The
//! production backend is external; [`MemoryStore`] is the reference
//! implementation the engine is developed and tested against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use nimbus_core::{random_hex, Error, JsonDoc, Result, RevChain, RevTree};

/// Revisions of history kept per document.
const MAX_HISTORY: usize = 100;

/// One entry of the changes feed.
#[derive(Clone, Debug)]
pub struct Change {
    /// Position in the feed. Strictly increasing.
    pub seq: u64,
    pub id: String,
    pub doc: JsonDoc,
    pub deleted: bool,
}

/// A bounded slice of the changes feed.
#[derive(Clone, Debug, Default)]
pub struct ChangesPage {
    pub changes: Vec<Change>,
    /// Checkpoint value after consuming this page.
    pub last_seq: Option<String>,
    /// Whether more changes were pending past the limit.
    pub pending: bool,
}

/// A document together with its revision chain, as returned by bulk reads.
#[derive(Clone, Debug)]
pub struct DocWithChain {
    pub doc: JsonDoc,
    pub chain: RevChain,
}

/// A losing revision kept aside for manual resolution.
#[derive(Clone, Debug)]
pub struct ConflictEntry {
    pub rev: String,
    pub doc: Option<JsonDoc>,
}

/// Uniform interface to the JSON document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the current winner of a document.
    async fn get(&self, doctype: &str, id: &str) -> Result<JsonDoc>;

    /// Write a document. The embedded `_rev` must match the stored one
    /// (absent for a creation) or the write fails with `Conflict`.
    /// Returns the new revision.
    async fn put(&self, doctype: &str, doc: JsonDoc) -> Result<String>;

    /// Write a deletion tombstone.
    async fn delete(&self, doctype: &str, id: &str, rev: &str) -> Result<String>;

    /// Write a replicated document at exactly the revision its chain
    /// names. No local revision is generated.
    async fn put_existing_rev(&self, doctype: &str, doc: JsonDoc, chain: RevChain) -> Result<()>;

    /// Fetch several documents with their revision chains. Unknown ids are
    /// skipped.
    async fn bulk_get(&self, doctype: &str, ids: &[String]) -> Result<Vec<DocWithChain>>;

    /// The winning revision chain of a document, if known.
    async fn revisions_of(&self, doctype: &str, id: &str) -> Result<Option<RevChain>>;

    /// Read the changes feed, exclusive of `since`, at most `limit`
    /// entries. Entries are collapsed per document.
    async fn changes_since(
        &self,
        doctype: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<ChangesPage>;

    /// Find documents whose top-level field equals the given value.
    async fn find_by_index(&self, doctype: &str, field: &str, value: &str) -> Result<Vec<JsonDoc>>;

    /// Every live document of a doctype.
    async fn all_docs(&self, doctype: &str) -> Result<Vec<JsonDoc>>;

    /// Record a losing revision so it can be resolved manually later.
    async fn add_conflict(
        &self,
        doctype: &str,
        id: &str,
        rev: String,
        doc: Option<JsonDoc>,
    ) -> Result<()>;

    /// Losing revisions recorded for a document.
    async fn conflicts(&self, doctype: &str, id: &str) -> Result<Vec<ConflictEntry>>;
}

struct StoredDoc {
    doc: JsonDoc,
    /// Winning branch, newest first.
    chain: RevChain,
    tree: RevTree,
    deleted: bool,
    conflicts: Vec<ConflictEntry>,
    /// Latest feed position of this document.
    seq: u64,
}

/// In-memory reference implementation of [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    seq: AtomicU64,
    inner: RwLock<HashMap<String, HashMap<String, StoredDoc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, doctype: &str, id: &str) -> Result<JsonDoc> {
        let inner = self.inner.read();
        let stored = inner
            .get(doctype)
            .and_then(|docs| docs.get(id))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", doctype, id)))?;
        if stored.deleted {
            return Err(Error::NotFound(format!("{}/{}", doctype, id)));
        }
        Ok(stored.doc.clone())
    }

    async fn put(&self, doctype: &str, mut doc: JsonDoc) -> Result<String> {
        let id = doc.id().to_string();
        if id.is_empty() {
            return Err(Error::Store("document without _id".to_string()));
        }
        let seq = self.next_seq();
        let mut inner = self.inner.write();
        let docs = inner.entry(doctype.to_string()).or_default();

        let new_rev = match docs.get_mut(&id) {
            Some(stored) => {
                let current = stored.chain.head_str();
                match doc.rev() {
                    Some(rev) if rev == current => {}
                    Some(rev) => {
                        return Err(Error::Conflict(format!(
                            "document {}/{} is at {}, write carries {}",
                            doctype, id, current, rev
                        )))
                    }
                    None if stored.deleted => {
                        // Recreating a deleted document restarts its history.
                        let rev = format!("1-{}", random_hex(8));
                        doc.set_rev(rev.clone());
                        let chain = RevChain::single(&rev)?;
                        stored.tree = RevTree::from_chain(chain.clone());
                        stored.chain = chain;
                        stored.doc = doc;
                        stored.deleted = false;
                        stored.seq = seq;
                        return Ok(rev);
                    }
                    None => {
                        return Err(Error::Conflict(format!(
                            "document {}/{} already exists",
                            doctype, id
                        )))
                    }
                }
                let next = stored.chain.head().child(random_hex(8));
                let rev = next.to_string();
                doc.set_rev(rev.clone());
                stored.chain.start = next.generation;
                stored.chain.ids.insert(0, next.hash);
                stored.chain.ids.truncate(MAX_HISTORY);
                stored.tree.add(stored.chain.clone());
                stored.doc = doc;
                stored.deleted = false;
                stored.seq = seq;
                rev
            }
            None => {
                if doc.rev().is_some() {
                    return Err(Error::Conflict(format!(
                        "document {}/{} does not exist",
                        doctype, id
                    )));
                }
                let rev = format!("1-{}", random_hex(8));
                doc.set_rev(rev.clone());
                let chain = RevChain::single(&rev)?;
                docs.insert(
                    id.clone(),
                    StoredDoc {
                        doc,
                        chain: chain.clone(),
                        tree: RevTree::from_chain(chain),
                        deleted: false,
                        conflicts: Vec::new(),
                        seq,
                    },
                );
                rev
            }
        };
        trace!("put {}/{} -> {}", doctype, id, new_rev);
        Ok(new_rev)
    }

    async fn delete(&self, doctype: &str, id: &str, rev: &str) -> Result<String> {
        let seq = self.next_seq();
        let mut inner = self.inner.write();
        let stored = inner
            .get_mut(doctype)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", doctype, id)))?;
        let current = stored.chain.head_str();
        if rev != current {
            return Err(Error::Conflict(format!(
                "document {}/{} is at {}, delete carries {}",
                doctype, id, current, rev
            )));
        }
        let next = stored.chain.head().child(random_hex(8));
        let new_rev = next.to_string();
        stored.chain.start = next.generation;
        stored.chain.ids.insert(0, next.hash);
        stored.chain.ids.truncate(MAX_HISTORY);
        stored.tree.add(stored.chain.clone());
        stored.doc.set_rev(new_rev.clone());
        stored.doc.mark_deleted();
        stored.deleted = true;
        stored.seq = seq;
        Ok(new_rev)
    }

    async fn put_existing_rev(&self, doctype: &str, mut doc: JsonDoc, chain: RevChain) -> Result<()> {
        if chain.is_empty() {
            return Err(Error::MalformedRevision("empty revision chain".to_string()));
        }
        let id = doc.id().to_string();
        if id.is_empty() {
            return Err(Error::Store("document without _id".to_string()));
        }
        doc.set_rev(chain.head_str());
        let deleted = doc.is_deleted();
        let seq = self.next_seq();
        let mut inner = self.inner.write();
        let docs = inner.entry(doctype.to_string()).or_default();
        match docs.get_mut(&id) {
            Some(stored) => {
                stored.tree.add(chain.clone());
                let replaces = chain.contains(&stored.chain.head())
                    || chain.head() > stored.chain.head();
                if replaces {
                    stored.chain = chain;
                    stored.doc = doc;
                    stored.deleted = deleted;
                }
                stored.seq = seq;
            }
            None => {
                docs.insert(
                    id,
                    StoredDoc {
                        doc,
                        chain: chain.clone(),
                        tree: RevTree::from_chain(chain),
                        deleted,
                        conflicts: Vec::new(),
                        seq,
                    },
                );
            }
        }
        Ok(())
    }

    async fn bulk_get(&self, doctype: &str, ids: &[String]) -> Result<Vec<DocWithChain>> {
        let inner = self.inner.read();
        let Some(docs) = inner.get(doctype) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id))
            .map(|stored| DocWithChain {
                doc: stored.doc.clone(),
                chain: stored.chain.clone(),
            })
            .collect())
    }

    async fn revisions_of(&self, doctype: &str, id: &str) -> Result<Option<RevChain>> {
        let inner = self.inner.read();
        Ok(inner
            .get(doctype)
            .and_then(|docs| docs.get(id))
            .map(|stored| stored.chain.clone()))
    }

    async fn changes_since(
        &self,
        doctype: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<ChangesPage> {
        let since: u64 = match since {
            Some(s) => s
                .parse()
                .map_err(|_| Error::Store(format!("invalid sequence {:?}", s)))?,
            None => 0,
        };
        let inner = self.inner.read();
        let Some(docs) = inner.get(doctype) else {
            return Ok(ChangesPage::default());
        };
        let mut entries: Vec<&StoredDoc> =
            docs.values().filter(|stored| stored.seq > since).collect();
        entries.sort_by_key(|stored| stored.seq);
        let pending = entries.len() > limit;
        entries.truncate(limit);

        let changes: Vec<Change> = entries
            .iter()
            .map(|stored| Change {
                seq: stored.seq,
                id: stored.doc.id().to_string(),
                doc: stored.doc.clone(),
                deleted: stored.deleted,
            })
            .collect();
        let last_seq = changes.last().map(|c| c.seq.to_string());
        Ok(ChangesPage {
            changes,
            last_seq,
            pending,
        })
    }

    async fn find_by_index(&self, doctype: &str, field: &str, value: &str) -> Result<Vec<JsonDoc>> {
        let inner = self.inner.read();
        let Some(docs) = inner.get(doctype) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<JsonDoc> = docs
            .values()
            .filter(|stored| !stored.deleted)
            .filter(|stored| stored.doc.get_str(field) == Some(value))
            .map(|stored| stored.doc.clone())
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(out)
    }

    async fn all_docs(&self, doctype: &str) -> Result<Vec<JsonDoc>> {
        let inner = self.inner.read();
        let Some(docs) = inner.get(doctype) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<JsonDoc> = docs
            .values()
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.doc.clone())
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(out)
    }

    async fn add_conflict(
        &self,
        doctype: &str,
        id: &str,
        rev: String,
        doc: Option<JsonDoc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .get_mut(doctype)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", doctype, id)))?;
        if !stored.conflicts.iter().any(|c| c.rev == rev) {
            stored.conflicts.push(ConflictEntry { rev, doc });
        }
        Ok(())
    }

    async fn conflicts(&self, doctype: &str, id: &str) -> Result<Vec<ConflictEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .get(doctype)
            .and_then(|docs| docs.get(id))
            .map(|stored| stored.conflicts.clone())
            .unwrap_or_default())
    }
}
