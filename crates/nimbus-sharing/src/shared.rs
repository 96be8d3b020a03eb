//! The shared log (`io.cozy.shared`).
//!
//! One record per locally-known document, tracking which sharings cover it
//! and the revisions it went through. Every local mutation of a tracked
//! doctype upserts its record, which makes the `io.cozy.shared` changes
//! feed the single, resumable source the replicator works from.
//!
//! The tracker never fails the application write that triggered it: CAS
//! contention is retried a few times, anything else is logged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use nimbus_core::types::{consts, shared_id};
use nimbus_core::{Error, JsonDoc, Result};

use crate::context::Context;
use crate::sharing::Sharing;

/// Revisions kept per record.
pub const MAX_SHARED_REVISIONS: usize = 100;

/// CAS attempts before an update is abandoned.
const MAX_TRACK_ATTEMPTS: u32 = 3;

/// Per-sharing scope flags of one document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedInfo {
    /// Index of the matching rule inside the sharing.
    pub rule: usize,
    /// The document is a file whose content must be synchronized.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary: bool,
    /// The document left the sharing's scope.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

/// One row of the shared log, keyed `"<doctype>/<docid>"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Known revisions of the document, newest first, capped.
    pub revisions: Vec<String>,
    /// Every sharing that currently covers (or covered) the document.
    pub infos: HashMap<String, SharedInfo>,
}

impl SharedRecord {
    pub fn from_json(doc: &JsonDoc) -> Result<Self> {
        doc.deserialize().map_err(Error::from)
    }

    pub fn to_json(&self) -> Result<JsonDoc> {
        JsonDoc::from_serialize(self).map_err(Error::from)
    }

    /// The doctype and document id this record tracks.
    pub fn target(&self) -> Result<(&str, &str)> {
        nimbus_core::types::split_shared_id(&self.id)
            .ok_or_else(|| Error::Store(format!("malformed shared id {}", self.id)))
    }
}

/// A local mutation, as seen by the tracker.
#[derive(Clone, Debug)]
pub struct DocEvent {
    pub doctype: String,
    pub doc: JsonDoc,
    /// Revision the mutation produced.
    pub rev: String,
    pub deleted: bool,
    /// Whether the content digest changed (files only).
    pub md5_changed: bool,
    /// Directory ids above a file document, nearest first.
    pub ancestors: Vec<String>,
}

/// Project a local mutation onto the shared log.
///
/// Errors never propagate to the caller; the write that triggered the
/// update has already succeeded.
pub async fn track(ctx: &Context, event: &DocEvent) {
    for attempt in 0..MAX_TRACK_ATTEMPTS {
        match track_once(ctx, event).await {
            Ok(()) => return,
            Err(Error::Conflict(_)) if attempt + 1 < MAX_TRACK_ATTEMPTS => {
                trace!(
                    "Shared log contention: doc={}/{}, attempt={}",
                    event.doctype,
                    event.doc.id(),
                    attempt + 1
                );
            }
            Err(e) => {
                error!(
                    "Shared log update failed: doc={}/{}, error={}",
                    event.doctype,
                    event.doc.id(),
                    e
                );
                return;
            }
        }
    }
}

async fn track_once(ctx: &Context, event: &DocEvent) -> Result<()> {
    let sharing_ids = ctx.triggers.sharings_for(&event.doctype);
    if sharing_ids.is_empty() {
        return Ok(());
    }

    let key = shared_id(&event.doctype, event.doc.id());
    let mut record = match ctx.store.get(consts::SHARED, &key).await {
        Ok(doc) => SharedRecord::from_json(&doc)?,
        Err(Error::NotFound(_)) => SharedRecord {
            id: key.clone(),
            rev: None,
            revisions: Vec::new(),
            infos: HashMap::new(),
        },
        Err(e) => return Err(e),
    };

    // Prepend the new revision, capped.
    if record.revisions.first().map(String::as_str) != Some(event.rev.as_str()) {
        record.revisions.insert(0, event.rev.clone());
        record.revisions.truncate(MAX_SHARED_REVISIONS);
    }

    let mut touched = false;
    for sid in &sharing_ids {
        let sharing = match Sharing::load(ctx.store.as_ref(), sid).await {
            Ok(s) => s,
            Err(Error::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        if !sharing.active {
            continue;
        }
        let matched = if event.deleted {
            None
        } else {
            sharing.matching_rule(&event.doctype, &event.doc, &event.ancestors)
        };
        match matched {
            Some((rule, _)) => {
                let is_file = event.doc.get_str("type") == Some("file");
                // The content obligation is sticky: a rename landing before
                // the upload pass ran must not cancel a pending byte sync.
                // A stale flag costs one metadata round-trip, never data.
                let pending_binary = record
                    .infos
                    .get(sid)
                    .map(|info| info.binary && !info.removed)
                    .unwrap_or(false);
                record.infos.insert(
                    sid.clone(),
                    SharedInfo {
                        rule,
                        binary: is_file && (event.md5_changed || pending_binary),
                        removed: false,
                    },
                );
                touched = true;
            }
            None => {
                // Only flip to removed when the sharing used to cover it.
                if let Some(info) = record.infos.get_mut(sid) {
                    if !info.removed {
                        info.removed = true;
                        info.binary = false;
                    }
                    touched = true;
                }
            }
        }
    }

    if !touched && record.infos.is_empty() {
        // Nothing covers this document; no record is created for it.
        return Ok(());
    }

    let json = record.to_json()?;
    ctx.store.put(consts::SHARED, json).await?;
    debug!(
        "Shared log updated: doc={}, revisions={}, sharings={}",
        key,
        record.revisions.len(),
        record.infos.len()
    );
    Ok(())
}
