//! The replicator, peer -> local direction.
//!
//! A peer pushes a bulk update; each document is reconciled against local
//! history through the revision tree: fast-forwards and winning divergent
//! revisions are written at exactly the revision the peer names, losing
//! revisions land in the conflicts list, nothing is silently discarded.
//! File documents are delegated to the upload path, which knows how to
//! move things around the VFS.

use std::collections::HashMap;

use tracing::{debug, warn};

use nimbus_core::protocol::{BulkDocsRequest, RevsDiffRequest, RevsDiffResponse};
use nimbus_core::revision::{classify, ConflictKind, Revision};
use nimbus_core::types::consts;
use nimbus_core::{Error, JsonDoc, Result, RevChain};

use crate::context::Context;
use crate::replicator::{wire_id, xor_identifiers};
use crate::shared::DocEvent;
use crate::sharing::Sharing;
use crate::upload;

/// Answer a peer's bulk diff: which of these revisions are we missing?
///
/// The reply is keyed by the identifiers exactly as they appeared in the
/// request, so the sender can match them without knowing our pad.
pub async fn revs_diff(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    req: &RevsDiffRequest,
) -> Result<RevsDiffResponse> {
    let key = sharing.xor_key_for(member_index).cloned();
    let mut missing: HashMap<String, Vec<String>> = HashMap::new();
    for item in &req.docs {
        // The pad is an involution: the same transform recovers local ids.
        let local_id = wire_id(&item.doc_type, &item.id, key.as_ref());
        let chain = ctx.store.revisions_of(&item.doc_type, &local_id).await?;
        let wanted: Vec<String> = item
            .revisions
            .iter()
            .filter(|rev| match (&chain, Revision::parse(rev)) {
                (Some(local), Ok(parsed)) => !local.contains(&parsed),
                (None, Ok(_)) => true,
                // Unparseable revisions are not worth requesting.
                (_, Err(_)) => false,
            })
            .cloned()
            .collect();
        if !wanted.is_empty() {
            missing.insert(format!("{}/{}", item.doc_type, item.id), wanted);
        }
    }
    Ok(RevsDiffResponse { missing })
}

/// Apply a bulk update received from a member of the sharing.
///
/// Per-document failures are aggregated; the call only fails as a whole
/// when every document failed.
pub async fn apply_bulk_docs(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    req: BulkDocsRequest,
) -> Result<()> {
    let total = req.docs.len();
    let mut errors: Vec<Error> = Vec::new();

    for payload in req.docs {
        let outcome = apply_one(ctx, sharing, member_index, payload.doc_type, payload.doc, payload.revisions).await;
        if let Err(e) = outcome {
            warn!(
                "Incoming document rejected: sharing={}, member={}, error={}",
                sharing.id, member_index, e
            );
            errors.push(e);
        }
    }

    if !errors.is_empty() && errors.len() == total {
        return Err(Error::aggregate(errors).expect("errors is non-empty"));
    }
    Ok(())
}

async fn apply_one(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    doctype: String,
    mut doc: JsonDoc,
    chain: RevChain,
) -> Result<()> {
    if !sharing.covers_doctype(&doctype) {
        return Err(Error::Safety(format!(
            "{}/{} is outside every rule of sharing {}",
            doctype,
            doc.id(),
            sharing.id
        )));
    }

    if doctype == consts::FILES {
        if let Some(key) = sharing.xor_key_for(member_index) {
            xor_identifiers(&mut doc, key);
        }
        return match doc.get_str("type") {
            Some("directory") => {
                let dir = nimbus_vfs::DirDoc::from_json(&doc)?;
                upload::apply_dir_metadata(ctx, sharing, dir, chain).await
            }
            _ => {
                let file = nimbus_vfs::FileDoc::from_json(&doc)?;
                upload::apply_file_metadata(ctx, sharing, file, chain).await
            }
        };
    }

    apply_doc(ctx, &doctype, doc, chain).await
}

/// Reconcile one generic document with local history.
pub(crate) async fn apply_doc(
    ctx: &Context,
    doctype: &str,
    doc: JsonDoc,
    chain: RevChain,
) -> Result<()> {
    let local = ctx.store.revisions_of(doctype, doc.id()).await?;
    match classify(local.as_ref(), &chain)? {
        ConflictKind::NoConflict => {
            write_remote(ctx, doctype, doc, chain, None).await
        }
        ConflictKind::WonConflict => {
            // The local head loses; capture it before the winner lands.
            let losing_rev = local.map(|c| c.head_str());
            let losing_doc = ctx.store.get(doctype, doc.id()).await.ok();
            write_remote(ctx, doctype, doc, chain, losing_rev.map(|r| (r, losing_doc))).await
        }
        ConflictKind::LostConflict => {
            let local = local.expect("LostConflict implies local history");
            if local.contains(&chain.head()) {
                // Nothing new: the peer re-sent revisions we already have.
                debug!("Ignoring known revision {} of {}/{}", chain.head_str(), doctype, doc.id());
                return Ok(());
            }
            // Divergent loser: record it, do not touch the winner.
            ctx.store
                .add_conflict(doctype, doc.id(), chain.head_str(), Some(doc.clone()))
                .await
        }
    }
}

async fn write_remote(
    ctx: &Context,
    doctype: &str,
    doc: JsonDoc,
    chain: RevChain,
    losing_local: Option<(String, Option<JsonDoc>)>,
) -> Result<()> {
    let id = doc.id().to_string();
    let deleted = doc.is_deleted();
    ctx.store
        .put_existing_rev(doctype, doc.clone(), chain.clone())
        .await?;
    if let Some((rev, body)) = losing_local {
        ctx.store.add_conflict(doctype, &id, rev, body).await?;
    }

    // Keep the shared log in step so our own replications converge.
    let mut tracked = doc;
    tracked.set_rev(chain.head_str());
    crate::shared::track(
        ctx,
        &DocEvent {
            doctype: doctype.to_string(),
            doc: tracked,
            rev: chain.head_str(),
            deleted,
            md5_changed: false,
            ancestors: Vec::new(),
        },
    )
    .await;
    Ok(())
}
