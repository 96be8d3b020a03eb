//! The replicator, local -> peer direction.
//!
//! One pass reads the `io.cozy.shared` changes feed since the member's
//! checkpoint, asks the peer which revisions it is missing, pushes a bulk
//! update, and advances the checkpoint. Binary entries are left to the
//! upload pass. Per-document failures are aggregated; the checkpoint only
//! moves past the contiguous successful prefix of the batch, so a crashed
//! or failed pass re-sends documents instead of skipping them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nimbus_core::protocol::{BulkDocsRequest, DocRevisions, DocumentPayload, RevsDiffRequest};
use nimbus_core::types::consts;
use nimbus_core::{Error, JsonDoc, Result, XorKey};

use crate::checkpoint::{self, Direction};
use crate::context::Context;
use crate::peer::PeerClient;
use crate::shared::SharedRecord;
use crate::sharing::Sharing;

/// Run one replication pass toward a member.
///
/// Returns whether more work remains (a full batch, or documents that
/// failed and will be retried). Runs under the sharing's replicate lock.
pub async fn replicate(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let lease = ctx
        .locker
        .lock(&sharing.lock_name(&ctx.domain, Direction::Replicate))
        .await?;
    let outcome = replicate_batch(ctx, sharing, member_index, cancel).await;
    ctx.locker.unlock(lease).await;
    outcome
}

pub(crate) struct PlannedChange {
    pub seq: u64,
    /// What to offer the peer; `None` when this entry is skipped.
    pub item: Option<DocRevisions>,
    pub error: Option<Error>,
}

async fn replicate_batch(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let sid = &sharing.id;
    let last_seq = checkpoint::get(ctx.store.as_ref(), sid, member_index, Direction::Replicate).await?;
    let page = ctx
        .store
        .changes_since(
            consts::SHARED,
            last_seq.as_deref(),
            ctx.config.replicator.batch_size,
        )
        .await?;
    if page.changes.is_empty() {
        return Ok(false);
    }
    debug!(
        "Replication batch: sharing={}, member={}, changes={}, since={:?}",
        sid,
        member_index,
        page.changes.len(),
        last_seq
    );

    let mut planned: Vec<PlannedChange> = Vec::with_capacity(page.changes.len());
    for change in &page.changes {
        let plan = match SharedRecord::from_json(&change.doc) {
            Ok(record) => match plan_record(sid, &record) {
                Ok(item) => PlannedChange {
                    seq: change.seq,
                    item,
                    error: None,
                },
                Err(e) => PlannedChange {
                    seq: change.seq,
                    item: None,
                    error: Some(e),
                },
            },
            Err(e) => PlannedChange {
                seq: change.seq,
                item: None,
                error: Some(e),
            },
        };
        planned.push(plan);
    }

    let xor_key = sharing.xor_key_for(member_index).cloned();
    // File identifiers never cross the link in the clear, the diff
    // request included.
    let items: Vec<DocRevisions> = planned
        .iter()
        .filter_map(|p| p.item.as_ref())
        .map(|item| DocRevisions {
            doc_type: item.doc_type.clone(),
            id: wire_id(&item.doc_type, &item.id, xor_key.as_ref()),
            revisions: item.revisions.clone(),
        })
        .collect();

    if items.is_empty() {
        return finish_batch(
            ctx,
            sid,
            member_index,
            Direction::Replicate,
            planned,
            page.pending,
        )
        .await;
    }
    if cancel.is_cancelled() {
        return Ok(true);
    }

    let peer = ctx.peers.client_for(sharing, member_index)?;
    let diff = {
        let op_peer = peer.clone();
        let op_sid = sid.clone();
        let req = RevsDiffRequest { docs: items };
        with_retry(ctx, &peer, move || {
            let peer = op_peer.clone();
            let sid = op_sid.clone();
            let req = req.clone();
            async move { peer.revs_diff(&sid, &req).await }
        })
        .await?
    };

    if !diff.is_empty() {
        let payloads =
            build_payloads(ctx, &diff.missing, xor_key.as_ref(), cancel, &mut planned).await;
        if cancel.is_cancelled() {
            return Ok(true);
        }
        if !payloads.is_empty() {
            let op_peer = peer.clone();
            let op_sid = sid.clone();
            let req = BulkDocsRequest { docs: payloads };
            with_retry(ctx, &peer, move || {
                let peer = op_peer.clone();
                let sid = op_sid.clone();
                let req = req.clone();
                async move { peer.bulk_docs(&sid, &req).await }
            })
            .await?;
        }
    }

    finish_batch(
        ctx,
        sid,
        member_index,
        Direction::Replicate,
        planned,
        page.pending,
    )
    .await
}

/// Decide what a shared-log record contributes to this batch.
fn plan_record(sid: &str, record: &SharedRecord) -> Result<Option<DocRevisions>> {
    let Some(info) = record.infos.get(sid) else {
        return Ok(None);
    };
    // Binary content is owned by the upload pass; the replicator advances
    // past the entry without touching it.
    if info.binary && !info.removed {
        return Ok(None);
    }
    let (doctype, id) = record.target()?;
    Ok(Some(DocRevisions {
        doc_type: doctype.to_string(),
        id: id.to_string(),
        revisions: record.revisions.clone(),
    }))
}

async fn build_payloads(
    ctx: &Context,
    missing: &HashMap<String, Vec<String>>,
    xor_key: Option<&XorKey>,
    cancel: &CancellationToken,
    planned: &mut [PlannedChange],
) -> Vec<DocumentPayload> {
    let mut payloads = Vec::new();
    for plan in planned.iter_mut() {
        if cancel.is_cancelled() {
            break;
        }
        let Some(item) = &plan.item else { continue };
        // The peer keyed its reply by the identifiers it saw on the wire.
        let key = format!(
            "{}/{}",
            item.doc_type,
            wire_id(&item.doc_type, &item.id, xor_key)
        );
        let Some(wanted) = missing.get(&key) else {
            continue;
        };
        if wanted.is_empty() {
            continue;
        }
        match fetch_payload(ctx, item, xor_key).await {
            Ok(Some(payload)) => payloads.push(payload),
            Ok(None) => {}
            Err(e) => plan.error = Some(e),
        }
    }
    payloads
}

async fn fetch_payload(
    ctx: &Context,
    item: &DocRevisions,
    xor_key: Option<&XorKey>,
) -> Result<Option<DocumentPayload>> {
    let docs = ctx
        .store
        .bulk_get(&item.doc_type, std::slice::from_ref(&item.id))
        .await?;
    let Some(found) = docs.into_iter().next() else {
        // The document vanished since the feed entry; nothing to send.
        return Ok(None);
    };
    let mut doc = found.doc;
    let chain = found.chain;
    if item.doc_type == consts::FILES {
        if let Some(key) = xor_key {
            xor_identifiers(&mut doc, key);
        }
    }
    Ok(Some(DocumentPayload {
        doc_type: item.doc_type.clone(),
        doc,
        revisions: chain,
    }))
}

/// The identifier a document travels under: file ids go through the pad,
/// everything else is already opaque.
pub(crate) fn wire_id(doctype: &str, id: &str, key: Option<&XorKey>) -> String {
    match key {
        Some(key) if doctype == consts::FILES => key.apply(id),
        _ => id.to_string(),
    }
}

/// Apply the link pad to the identifier fields of a file document. The
/// transform is an involution, so the same call decodes on the way in.
pub(crate) fn xor_identifiers(doc: &mut JsonDoc, key: &XorKey) {
    if let Some(id) = doc.get_str("_id").map(str::to_string) {
        doc.set_id(key.apply(&id));
    }
    if let Some(dir_id) = doc.get_str("dirId").map(str::to_string) {
        doc.insert("dirId", serde_json::Value::String(key.apply(&dir_id)));
    }
}

pub(crate) async fn finish_batch(
    ctx: &Context,
    sid: &str,
    member_index: usize,
    direction: Direction,
    planned: Vec<PlannedChange>,
    feed_pending: bool,
) -> Result<bool> {
    // The checkpoint may only move past changes that are either skipped or
    // fully sent; the first failure pins it.
    let mut advance_to: Option<u64> = None;
    let mut errors: Vec<Error> = Vec::new();
    let mut sent = 0usize;
    let mut blocked = false;
    for plan in planned {
        match plan.error {
            None => {
                if !blocked {
                    advance_to = Some(plan.seq);
                }
                if plan.item.is_some() {
                    sent += 1;
                }
            }
            Some(e) => {
                blocked = true;
                errors.push(e);
            }
        }
    }
    if let Some(seq) = advance_to {
        checkpoint::advance(
            ctx.store.as_ref(),
            sid,
            member_index,
            direction,
            &seq.to_string(),
        )
        .await?;
    }

    let failed = errors.len();
    if failed > 0 {
        let all_failed = sent == 0;
        let aggregated = Error::aggregate(errors).expect("failed > 0");
        if all_failed {
            return Err(aggregated);
        }
        warn!(
            "Batch partially failed: sharing={}, member={}, direction={}, sent={}, failed={}, error={}",
            sid, member_index, direction, sent, failed, aggregated
        );
        return Ok(true);
    }

    if sent > 0 {
        info!(
            "Batch done: sharing={}, member={}, direction={}, docs={}",
            sid, member_index, direction, sent
        );
    }
    Ok(feed_pending)
}

/// Retry policy for peer calls: one token refresh on an auth failure, then
/// exponential backoff (capped attempts) on retryable errors.
pub(crate) async fn with_retry<T, F, Fut>(
    ctx: &Context,
    peer: &Arc<dyn PeerClient>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retries = ctx.config.replicator.retries.max(1);
    let base = ctx.config.replicator.backoff_base_ms;
    let mut refreshed = false;
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_auth_retryable() && !refreshed => {
                refreshed = true;
                debug!("Refreshing access token after {}", e);
                peer.refresh_token().await?;
            }
            Err(e) if e.is_retryable() && attempt + 1 < retries => {
                let delay = base.saturating_mul(1u64 << attempt.min(10));
                debug!("Retrying after {}ms: {}", delay, e);
                sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
