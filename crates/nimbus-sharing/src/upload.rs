//! File synchronization.
//!
//! Revision-only replication is not enough for files: when the content
//! digest diverges, bytes must travel. The exchange is two-phase:
//!
//! 1. The sender PUTs the file metadata (with its revision chain). The
//!    receiver answers `204` when its content already matches (metadata is
//!    applied in place) or `200 {key}` when bytes must follow.
//! 2. The sender PUTs the raw body under the key. The receiver verifies
//!    length and MD5, then routes to the new-file or existing-file path.
//!
//! An existing file gets its content written under the old name first and
//! is renamed in a second step: a content-and-rename conflict is easier to
//! reconcile as a name conflict than as a silent content fork. Name
//! collisions are resolved deterministically, the loser by revision order
//! taking a `- conflict -` name.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nimbus_core::protocol::{DocRevisions, FileMetadataPayload, MetadataOutcome};
use nimbus_core::revision::{classify, ConflictKind, Revision};
use nimbus_core::types::consts;
use nimbus_core::{random_hex, Error, Result, RevChain};
use nimbus_vfs::blob::md5_hex;
use nimbus_vfs::{conflict_name, DirDoc, DocKind, FileDoc, ROOT_DIR_ID};

use crate::checkpoint::{self, Direction};
use crate::context::Context;
use crate::replicator::{finish_batch, with_retry, xor_identifiers, PlannedChange};
use crate::shared::{DocEvent, SharedRecord};
use crate::sharing::Sharing;

// === Upload keys ===

/// A negotiated upload waiting for its bytes.
pub struct PendingUpload {
    pub sharing_id: String,
    pub member_index: usize,
    pub file: FileDoc,
    pub chain: RevChain,
    expires: Instant,
}

/// Short-lived map from opaque keys to pending uploads.
pub struct UploadKeyStore {
    entries: DashMap<String, PendingUpload>,
    ttl: Duration,
}

impl UploadKeyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Stash a pending upload, returning its key.
    pub fn insert(
        &self,
        sharing_id: String,
        member_index: usize,
        file: FileDoc,
        chain: RevChain,
    ) -> String {
        let key = random_hex(16);
        self.entries.insert(
            key.clone(),
            PendingUpload {
                sharing_id,
                member_index,
                file,
                chain,
                expires: Instant::now() + self.ttl,
            },
        );
        key
    }

    /// Redeem a key. Expired entries are gone.
    pub fn take(&self, key: &str) -> Option<PendingUpload> {
        let (_, pending) = self.entries.remove(key)?;
        if pending.expires <= Instant::now() {
            return None;
        }
        Some(pending)
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, pending| pending.expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// === Initiator side ===

/// Run one upload pass toward a member: push the content of every file
/// whose `binary` flag is set since the upload checkpoint.
pub async fn upload(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let lease = ctx
        .locker
        .lock(&sharing.lock_name(&ctx.domain, Direction::Upload))
        .await?;
    let outcome = upload_batch(ctx, sharing, member_index, cancel).await;
    ctx.locker.unlock(lease).await;
    outcome
}

async fn upload_batch(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let sid = &sharing.id;
    let last_seq =
        checkpoint::get(ctx.store.as_ref(), sid, member_index, Direction::Upload).await?;
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

    let mut planned: Vec<PlannedChange> = Vec::with_capacity(page.changes.len());
    let mut interrupted = false;
    for change in &page.changes {
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        let plan = match SharedRecord::from_json(&change.doc) {
            Ok(record) => match plan_upload(sid, &record) {
                Some(item) => match sync_one(ctx, sharing, member_index, &item.id).await {
                    Ok(()) => PlannedChange {
                        seq: change.seq,
                        item: Some(item),
                        error: None,
                    },
                    Err(e) => PlannedChange {
                        seq: change.seq,
                        item: Some(item),
                        error: Some(e),
                    },
                },
                None => PlannedChange {
                    seq: change.seq,
                    item: None,
                    error: None,
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

    finish_batch(
        ctx,
        sid,
        member_index,
        Direction::Upload,
        planned,
        page.pending || interrupted,
    )
    .await
}

/// Only non-removed binary file entries belong to the upload pass.
fn plan_upload(sid: &str, record: &SharedRecord) -> Option<DocRevisions> {
    let info = record.infos.get(sid)?;
    if !info.binary || info.removed {
        return None;
    }
    let (doctype, id) = record.target().ok()?;
    if doctype != consts::FILES {
        return None;
    }
    Some(DocRevisions {
        doc_type: doctype.to_string(),
        id: id.to_string(),
        revisions: record.revisions.clone(),
    })
}

async fn sync_one(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    file_id: &str,
) -> Result<()> {
    let docs = ctx
        .store
        .bulk_get(consts::FILES, std::slice::from_ref(&file_id.to_string()))
        .await?;
    let Some(found) = docs.into_iter().next() else {
        return Ok(());
    };
    let file = FileDoc::from_json(&found.doc)?;
    if file.trashed || found.doc.is_deleted() {
        // Removal travels through the document path.
        return Ok(());
    }

    let key = sharing
        .xor_key_for(member_index)
        .ok_or(Error::NoOAuthClient)?;
    let mut wire_doc = found.doc.clone();
    xor_identifiers(&mut wire_doc, key);
    let xored_id = wire_doc.id().to_string();
    let payload = FileMetadataPayload {
        file: wire_doc,
        revisions: found.chain.clone(),
    };

    let peer = ctx.peers.client_for(sharing, member_index)?;
    let outcome = {
        let op_peer = peer.clone();
        let op_sid = sharing.id.clone();
        let op_xored = xored_id.clone();
        let op_payload = payload.clone();
        with_retry(ctx, &peer, move || {
            let peer = op_peer.clone();
            let sid = op_sid.clone();
            let xored = op_xored.clone();
            let payload = op_payload.clone();
            async move { peer.put_file_metadata(&sid, &xored, &payload).await }
        })
        .await?
    };

    match outcome {
        MetadataOutcome::InSync => {
            debug!("File already in sync: id={}, rev={}", file.id, found.chain.head_str());
            Ok(())
        }
        MetadataOutcome::NeedsContent(upload_key) => {
            let bytes = bytes::Bytes::from(ctx.vfs.content(&file.id)?);
            let op_peer = peer.clone();
            let op_sid = sharing.id.clone();
            with_retry(ctx, &peer, move || {
                let peer = op_peer.clone();
                let sid = op_sid.clone();
                let key = upload_key.clone();
                let bytes = bytes.clone();
                async move { peer.put_file_body(&sid, &key, bytes).await }
            })
            .await?;
            info!(
                "File content uploaded: id={}, size={}, sharing={}",
                file.id, file.size, sharing.id
            );
            Ok(())
        }
    }
}

// === Receiver side, phase A ===

/// Handle `PUT /sharings/{sid}/io.cozy.files/{xoredId}/metadata`.
pub async fn sync_file(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    xored_id: &str,
    payload: FileMetadataPayload,
) -> Result<MetadataOutcome> {
    let key = sharing
        .xor_key_for(member_index)
        .ok_or(Error::NoOAuthClient)?;
    let mut doc = payload.file.clone();
    xor_identifiers(&mut doc, key);
    let file = FileDoc::from_json(&doc)?;
    if key.apply(xored_id) != file.id {
        return Err(Error::Safety(format!(
            "metadata route and body identifiers disagree for {}",
            file.id
        )));
    }
    let chain = payload.revisions;

    if let Some(local_chain) = ctx.store.revisions_of(consts::FILES, &file.id).await? {
        if local_chain.contains(&chain.head()) {
            // Nothing new to pull from this revision.
            return Ok(MetadataOutcome::InSync);
        }
    }

    match ctx.vfs.index().file(&file.id) {
        None => {
            // A file we have never seen: it must be covered by a rule, or
            // the peer is trying to push outside the sharing's scope.
            let mut ancestors = ctx.vfs.index().ancestors(&file.dir_id);
            if ancestors.is_empty() {
                ancestors = vec![file.dir_id.clone()];
            }
            if sharing.matching_rule(consts::FILES, &doc, &ancestors).is_none() {
                return Err(Error::Safety(format!(
                    "file {} matches no rule of sharing {}",
                    file.id, sharing.id
                )));
            }
            let upload_key =
                ctx.uploads
                    .insert(sharing.id.clone(), member_index, file, chain);
            Ok(MetadataOutcome::NeedsContent(upload_key))
        }
        Some(local) if local.md5 == file.md5 => {
            // Content already matches: metadata-only update.
            apply_file_metadata(ctx, sharing, file, chain).await?;
            Ok(MetadataOutcome::InSync)
        }
        Some(_) => {
            let upload_key =
                ctx.uploads
                    .insert(sharing.id.clone(), member_index, file, chain);
            Ok(MetadataOutcome::NeedsContent(upload_key))
        }
    }
}

// === Receiver side, phase B ===

/// Handle `PUT /sharings/{sid}/io.cozy.files/{key}`: the raw body.
pub async fn receive_file_body(ctx: &Context, key: &str, body: &[u8]) -> Result<()> {
    ctx.uploads.sweep();
    let pending = ctx
        .uploads
        .take(key)
        .ok_or_else(|| Error::NotFound(format!("upload key {}", key)))?;

    if body.len() as u64 > ctx.config.uploads.max_file_size_bytes {
        return Err(Error::FileTooBig);
    }
    if body.len() as u64 != pending.file.size {
        return Err(Error::ContentLengthMismatch {
            expected: pending.file.size,
            actual: body.len() as u64,
        });
    }
    if md5_hex(body) != pending.file.md5 {
        return Err(Error::InvalidHash);
    }

    let sharing = Sharing::load(ctx.store.as_ref(), &pending.sharing_id).await?;
    match ctx.vfs.index().file(&pending.file.id) {
        Some(local) => upload_existing_file(ctx, &sharing, local, pending, body).await,
        None => upload_new_file(ctx, &sharing, pending, body).await,
    }
}

async fn upload_new_file(
    ctx: &Context,
    sharing: &Sharing,
    pending: PendingUpload,
    body: &[u8],
) -> Result<()> {
    let mut file = pending.file;
    let chain = pending.chain;
    recreate_parent(ctx, sharing, &file.dir_id).await?;
    resolve_conflict_same_path(ctx, &mut file, &chain.head()).await?;

    file.rev = Some(chain.head_str());
    match ctx.vfs.create_file(file.clone(), body) {
        Ok(created) => file = created,
        Err(Error::PathExists(_)) => {
            // Lost a race since the resolution above; take a conflict name.
            file.name = conflict_name(&file.name, ctx.clock.now());
            file = ctx.vfs.create_file(file, body)?;
        }
        Err(e) => return Err(e),
    }

    ctx.store
        .put_existing_rev(consts::FILES, file.to_json()?, chain.clone())
        .await?;
    ctx.vfs.index().update_file(file.clone())?;
    track_remote_file(ctx, &file, &chain, true).await;
    info!("File created from upload: id={}, name={}", file.id, file.name);
    Ok(())
}

async fn upload_existing_file(
    ctx: &Context,
    sharing: &Sharing,
    local: FileDoc,
    pending: PendingUpload,
    body: &[u8],
) -> Result<()> {
    let mut target = pending.file;
    let chain = pending.chain;

    // Step one: the bytes land under the current name and directory.
    let refreshed = ctx.vfs.update_content(&local.id, body)?;

    // Step two: rename/move to the target location.
    target.md5 = refreshed.md5;
    target.size = refreshed.size;
    target.rev = Some(chain.head_str());
    if target.dir_id != local.dir_id || target.name != local.name {
        recreate_parent(ctx, sharing, &target.dir_id).await?;
        resolve_conflict_same_path(ctx, &mut target, &chain.head()).await?;
    }
    target.updated_at = ctx.clock.now();
    ctx.vfs.index().update_file(target.clone())?;

    ctx.store
        .put_existing_rev(consts::FILES, target.to_json()?, chain.clone())
        .await?;
    track_remote_file(ctx, &target, &chain, true).await;
    info!(
        "File content replaced: id={}, name={}, size={}",
        target.id, target.name, target.size
    );
    Ok(())
}

// === Metadata application (shared with the document path) ===

/// Apply a file document received without content: rename/move/trash and
/// bookkeeping, the bytes are either already right or not here yet.
pub(crate) async fn apply_file_metadata(
    ctx: &Context,
    sharing: &Sharing,
    file: FileDoc,
    chain: RevChain,
) -> Result<()> {
    let local_chain = ctx.store.revisions_of(consts::FILES, &file.id).await?;
    match classify(local_chain.as_ref(), &chain)? {
        ConflictKind::NoConflict | ConflictKind::WonConflict => {}
        ConflictKind::LostConflict => {
            let local = local_chain.expect("LostConflict implies local history");
            if local.contains(&chain.head()) {
                return Ok(());
            }
            return ctx
                .store
                .add_conflict(consts::FILES, &file.id, chain.head_str(), Some(file.to_json()?))
                .await;
        }
    }

    match ctx.vfs.index().file(&file.id) {
        None => {
            // Metadata ahead of content: remember the history, the bytes
            // will follow through the upload route.
            ctx.store
                .put_existing_rev(consts::FILES, file.to_json()?, chain.clone())
                .await?;
            track_remote_file(ctx, &file, &chain, false).await;
        }
        Some(local) => {
            let mut merged = file;
            // The content did not travel with this update.
            merged.md5 = local.md5.clone();
            merged.size = local.size;
            merged.rev = Some(chain.head_str());
            if merged.dir_id != local.dir_id || merged.name != local.name {
                recreate_parent(ctx, sharing, &merged.dir_id).await?;
                resolve_conflict_same_path(ctx, &mut merged, &chain.head()).await?;
            }
            ctx.vfs.index().update_file(merged.clone())?;
            ctx.store
                .put_existing_rev(consts::FILES, merged.to_json()?, chain.clone())
                .await?;
            track_remote_file(ctx, &merged, &chain, false).await;
        }
    }
    Ok(())
}

/// Apply a replicated directory document: create it, or rename/move it,
/// resolving path collisions like any other name conflict.
pub(crate) async fn apply_dir_metadata(
    ctx: &Context,
    sharing: &Sharing,
    dir: DirDoc,
    chain: RevChain,
) -> Result<()> {
    let local_chain = ctx.store.revisions_of(consts::FILES, &dir.id).await?;
    match classify(local_chain.as_ref(), &chain)? {
        ConflictKind::NoConflict | ConflictKind::WonConflict => {}
        ConflictKind::LostConflict => {
            let local = local_chain.expect("LostConflict implies local history");
            if local.contains(&chain.head()) {
                return Ok(());
            }
            return ctx
                .store
                .add_conflict(consts::FILES, &dir.id, chain.head_str(), Some(dir.to_json()?))
                .await;
        }
    }

    let mut incoming = dir;
    incoming.rev = Some(chain.head_str());
    if ctx.vfs.index().dir(&incoming.dir_id).is_none() {
        recreate_parent(ctx, sharing, &incoming.dir_id).await?;
    }
    if let Some(collider) = ctx
        .vfs
        .index()
        .child_by_name(&incoming.dir_id, &incoming.name)
    {
        if collider.id() != incoming.id {
            incoming.name = conflict_name(&incoming.name, ctx.clock.now());
        }
    }

    match ctx.vfs.index().dir(&incoming.id) {
        None => ctx.vfs.index().add_dir(incoming.clone())?,
        Some(_) => ctx.vfs.index().update_dir(incoming.clone())?,
    }
    // add_dir/update_dir recompute the full path.
    let indexed = ctx
        .vfs
        .index()
        .dir(&incoming.id)
        .ok_or_else(|| Error::NotFound(format!("directory {}", incoming.id)))?;
    ctx.store
        .put_existing_rev(consts::FILES, indexed.to_json()?, chain.clone())
        .await?;

    let ancestors = ctx.vfs.index().ancestors(&indexed.dir_id);
    let doc = indexed.to_json()?;
    crate::shared::track(
        ctx,
        &DocEvent {
            doctype: consts::FILES.to_string(),
            doc,
            rev: chain.head_str(),
            deleted: false,
            md5_changed: false,
            ancestors,
        },
    )
    .await;
    debug!("Directory applied: id={}, path={}", indexed.id, indexed.fullpath);
    Ok(())
}

// === Conflict plumbing ===

/// Make room for a file landing at `(dir_id, name)`.
///
/// A collision with a *different* document is decided by revision order:
/// the loser takes a deterministic `- conflict - <timestamp>` name. When
/// the incoming file loses, its name is rewritten in place; when the local
/// collider loses, it is renamed first.
async fn resolve_conflict_same_path(
    ctx: &Context,
    file: &mut FileDoc,
    incoming: &Revision,
) -> Result<()> {
    let Some(collider) = ctx.vfs.index().child_by_name(&file.dir_id, &file.name) else {
        return Ok(());
    };
    if collider.id() == file.id {
        return Ok(());
    }

    let collider_rev = match &collider {
        DocKind::File(f) => f.rev.clone(),
        DocKind::Dir(d) => d.rev.clone(),
    };
    let incoming_wins = match collider_rev.as_deref().map(Revision::parse) {
        Some(Ok(rev)) => *incoming > rev,
        // An unversioned local entry never outranks a replicated one.
        _ => true,
    };

    let now = ctx.clock.now();
    if incoming_wins {
        let renamed = conflict_name(collider.name(), now);
        warn!(
            "Path conflict: renaming local {} to {:?}",
            collider.id(),
            renamed
        );
        match collider {
            DocKind::File(mut f) => {
                f.name = renamed;
                ctx.write_file(f, None).await?;
            }
            DocKind::Dir(mut d) => {
                d.name = renamed;
                d.updated_at = now;
                ctx.vfs.index().update_dir(d.clone())?;
                let rev = ctx.store.put(consts::FILES, d.to_json()?).await?;
                d.rev = Some(rev);
                ctx.vfs.index().update_dir(d)?;
            }
        }
    } else {
        let renamed = conflict_name(&file.name, now);
        warn!(
            "Path conflict: incoming {} takes name {:?}",
            file.id, renamed
        );
        file.name = renamed;
    }
    Ok(())
}

/// Resolve a parent directory, creating a stand-in when the directory
/// document has not replicated yet.
async fn recreate_parent(ctx: &Context, sharing: &Sharing, dir_id: &str) -> Result<DirDoc> {
    if let Some(dir) = ctx.vfs.index().dir(dir_id) {
        return Ok(dir);
    }
    // Hang the stand-in under the first shared directory root we know,
    // falling back to the filesystem root.
    let anchor = sharing
        .rules
        .iter()
        .filter(|rule| rule.doc_type == consts::FILES)
        .flat_map(|rule| rule.values.iter())
        .find_map(|value| ctx.vfs.index().dir(value))
        .map(|dir| dir.id)
        .unwrap_or_else(|| ROOT_DIR_ID.to_string());

    let dir = DirDoc::new(dir_id, anchor, dir_id, "", ctx.clock.now());
    ctx.vfs.index().add_dir(dir)?;
    let mut created = ctx
        .vfs
        .index()
        .dir(dir_id)
        .ok_or_else(|| Error::NotFound(format!("directory {}", dir_id)))?;
    let rev = ctx.store.put(consts::FILES, created.to_json()?).await?;
    created.rev = Some(rev);
    ctx.vfs.index().update_dir(created.clone())?;
    debug!("Recreated missing parent: id={}, path={}", created.id, created.fullpath);
    Ok(created)
}

async fn track_remote_file(ctx: &Context, file: &FileDoc, chain: &RevChain, md5_changed: bool) {
    let doc = match file.to_json() {
        Ok(doc) => doc,
        Err(e) => {
            warn!("File document serialization failed: id={}, error={}", file.id, e);
            return;
        }
    };
    let ancestors = ctx.vfs.index().ancestors(&file.dir_id);
    crate::shared::track(
        ctx,
        &DocEvent {
            doctype: consts::FILES.to_string(),
            doc,
            rev: chain.head_str(),
            deleted: false,
            md5_changed,
            ancestors,
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestInstance;
    use nimbus_core::rules::Rule;

    #[test]
    fn test_upload_key_store_round_trip() {
        let store = UploadKeyStore::new(Duration::from_secs(300));
        let file = FileDoc::new("f1", ROOT_DIR_ID, "a.txt", chrono::Utc::now());
        let chain = RevChain::single("1-aaa").unwrap();
        let key = store.insert("s1".to_string(), 1, file, chain);

        let pending = store.take(&key).unwrap();
        assert_eq!(pending.sharing_id, "s1");
        assert_eq!(pending.file.id, "f1");
        // A key redeems once.
        assert!(store.take(&key).is_none());
    }

    #[test]
    fn test_upload_key_expiry() {
        let store = UploadKeyStore::new(Duration::from_millis(0));
        let file = FileDoc::new("f1", ROOT_DIR_ID, "a.txt", chrono::Utc::now());
        let chain = RevChain::single("1-aaa").unwrap();
        let key = store.insert("s1".to_string(), 1, file, chain);

        assert!(store.take(&key).is_none());

        let file = FileDoc::new("f2", ROOT_DIR_ID, "b.txt", chrono::Utc::now());
        let chain = RevChain::single("1-bbb").unwrap();
        store.insert("s1".to_string(), 1, file, chain);
        store.sweep();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sync_file_outside_rules_is_safety() {
        let b = TestInstance::new("bob.example.net").await;
        let photos = b.ctx.vfs.mkdir_p("/Photos").unwrap();
        let sharing = b
            .create_sharing(vec![Rule::for_directories("Photos", vec![photos.id.clone()])])
            .await;
        let key = sharing.xor_key_for(1).unwrap().clone();

        // A file under an unrelated directory.
        let mut file = FileDoc::new("deadbeef01", "d0c4", "rogue.txt", b.ctx.clock.now());
        file.md5 = md5_hex(b"x");
        file.size = 1;
        let mut wire = file.to_json().unwrap();
        xor_identifiers(&mut wire, &key);
        let payload = FileMetadataPayload {
            file: wire,
            revisions: RevChain::single("1-aaa").unwrap(),
        };

        let result = sync_file(&b.ctx, &sharing, 1, &key.apply("deadbeef01"), payload).await;
        assert!(matches!(result, Err(Error::Safety(_))));
    }

    #[tokio::test]
    async fn test_matching_md5_is_metadata_only() {
        let b = TestInstance::new("bob.example.net").await;
        let photos = b.ctx.vfs.mkdir_p("/Photos").unwrap();
        let sharing = b
            .create_sharing(vec![Rule::for_directories("Photos", vec![photos.id.clone()])])
            .await;
        let key = sharing.xor_key_for(1).unwrap().clone();

        let local = b.new_file(&photos.id, "photo.jpg", b"same bytes").await;

        // The peer announces a rename of the same content at a higher
        // revision: no upload key, the metadata lands in place.
        let mut remote = local.clone();
        remote.name = "renamed.jpg".to_string();
        let head = Revision::parse(local.rev.as_deref().unwrap()).unwrap();
        let chain = RevChain {
            start: head.generation + 1,
            ids: vec!["ffff".to_string(), head.hash.clone()],
        };
        remote.rev = Some(chain.head_str());
        let mut wire = remote.to_json().unwrap();
        xor_identifiers(&mut wire, &key);
        let payload = FileMetadataPayload {
            file: wire,
            revisions: chain,
        };

        let outcome = sync_file(&b.ctx, &sharing, 1, &key.apply(&local.id), payload)
            .await
            .unwrap();
        assert_eq!(outcome, MetadataOutcome::InSync);
        assert!(b.ctx.uploads.is_empty());

        let on_b = b.ctx.vfs.index().file(&local.id).unwrap();
        assert_eq!(on_b.name, "renamed.jpg");
        assert_eq!(on_b.md5, md5_hex(b"same bytes"));
        assert_eq!(b.ctx.vfs.content(&local.id).unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn test_receive_body_verifies_digest_and_length() {
        let b = TestInstance::new("bob.example.net").await;
        let photos = b.ctx.vfs.mkdir_p("/Photos").unwrap();
        let sharing = b
            .create_sharing(vec![Rule::for_directories("Photos", vec![photos.id.clone()])])
            .await;

        let mut file = FileDoc::new("abc123", photos.id.clone(), "photo.jpg", b.ctx.clock.now());
        file.md5 = md5_hex(b"right bytes");
        file.size = 11;
        let chain = RevChain::single("1-aaa").unwrap();

        let key = b
            .ctx
            .uploads
            .insert(sharing.id.clone(), 0, file.clone(), chain.clone());
        assert!(matches!(
            receive_file_body(&b.ctx, &key, b"wrong length").await,
            Err(Error::ContentLengthMismatch { .. })
        ));

        let key = b
            .ctx
            .uploads
            .insert(sharing.id.clone(), 0, file.clone(), chain.clone());
        assert!(matches!(
            receive_file_body(&b.ctx, &key, b"wrong bytes").await,
            Err(Error::InvalidHash)
        ));

        let key = b.ctx.uploads.insert(sharing.id.clone(), 0, file, chain);
        receive_file_body(&b.ctx, &key, b"right bytes").await.unwrap();
        assert_eq!(b.ctx.vfs.content("abc123").unwrap(), b"right bytes");

        assert!(matches!(
            receive_file_body(&b.ctx, &key, b"right bytes").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_content_change_syncs_end_to_end() {
        use crate::orchestrator::{answer_sharing, create_sharing, send_invitation};
        use crate::testutil::TestNetwork;
        use crate::worker;
        use nimbus_core::protocol::Member;

        let net = TestNetwork::new();
        let a = net.instance("alice.example.net").await;
        let b = net.instance("bob.example.net").await;

        let photos = a.ctx.mkdir_p("/Photos").await.unwrap();
        let mut sharing = create_sharing(
            &a.ctx,
            "Photos",
            vec![Member::new("https://bob.example.net", "Bob")],
            vec![Rule::for_directories("Photos", vec![photos.id.clone()])],
        )
        .await
        .unwrap();
        send_invitation(&a.ctx, &mut sharing, 1).await.unwrap();
        answer_sharing(&b.ctx, &sharing.id).await.unwrap();

        let file = a.new_file(&photos.id, "photo.jpg", b"version one").await;

        let sharing_a = Sharing::load(a.ctx.store.as_ref(), &sharing.id).await.unwrap();
        let cancel = CancellationToken::new();
        worker::run_once(&a.ctx, &sharing_a, 1, &cancel).await.unwrap();

        // B holds the file, same name, same directory layout, same bytes.
        let on_b = b.ctx.vfs.index().file(&file.id).unwrap();
        assert_eq!(on_b.name, "photo.jpg");
        assert_eq!(on_b.md5, md5_hex(b"version one"));
        assert_eq!(b.ctx.vfs.content(&file.id).unwrap(), b"version one");
        let parent = b.ctx.vfs.index().dir(&on_b.dir_id).unwrap();
        assert_eq!(parent.fullpath, "/Photos");

        // Content change flows as metadata negotiation plus body upload.
        a.update_file_content(&file.id, b"version two!").await;
        worker::run_once(&a.ctx, &sharing_a, 1, &cancel).await.unwrap();

        let on_b = b.ctx.vfs.index().file(&file.id).unwrap();
        assert_eq!(on_b.md5, md5_hex(b"version two!"));
        assert_eq!(on_b.name, "photo.jpg");
        assert_eq!(b.ctx.vfs.content(&file.id).unwrap(), b"version two!");
    }

    #[tokio::test]
    async fn test_rename_and_content_change_resolves_as_name_conflict() {
        use crate::orchestrator::{answer_sharing, create_sharing, send_invitation};
        use crate::testutil::TestNetwork;
        use crate::worker;
        use nimbus_core::protocol::Member;

        let net = TestNetwork::new();
        let a = net.instance("alice.example.net").await;
        let b = net.instance("bob.example.net").await;

        let photos = a.ctx.mkdir_p("/Photos").await.unwrap();
        let mut sharing = create_sharing(
            &a.ctx,
            "Photos",
            vec![Member::new("https://bob.example.net", "Bob")],
            vec![Rule::for_directories("Photos", vec![photos.id.clone()])],
        )
        .await
        .unwrap();
        send_invitation(&a.ctx, &mut sharing, 1).await.unwrap();
        answer_sharing(&b.ctx, &sharing.id).await.unwrap();

        let file = a.new_file(&photos.id, "photo.jpg", b"version one").await;
        let sharing_a = Sharing::load(a.ctx.store.as_ref(), &sharing.id).await.unwrap();
        let cancel = CancellationToken::new();
        worker::run_once(&a.ctx, &sharing_a, 1, &cancel).await.unwrap();

        // B grows a local pic.jpg in the shared folder before A's rename
        // lands.
        let photos_on_b = b.ctx.vfs.index().dir(&photos.id).unwrap();
        let local = FileDoc::new("local-pic", photos_on_b.id.clone(), "pic.jpg", b.ctx.clock.now());
        b.ctx.write_file(local, Some(b"unrelated")).await.unwrap();

        // A renames AND changes content in one go.
        let mut renamed = a.ctx.vfs.index().file(&file.id).unwrap();
        renamed.name = "pic.jpg".to_string();
        a.ctx.write_file(renamed, Some(b"version two!")).await.unwrap();
        worker::run_once(&a.ctx, &sharing_a, 1, &cancel).await.unwrap();

        // The replicated file took the target name; the local upstart was
        // moved to a deterministic conflict name.
        let on_b = b.ctx.vfs.index().file(&file.id).unwrap();
        assert_eq!(on_b.name, "pic.jpg");
        assert_eq!(on_b.md5, md5_hex(b"version two!"));
        let moved = b.ctx.vfs.index().file("local-pic").unwrap();
        assert!(
            moved.name.starts_with("pic - conflict - ") && moved.name.ends_with(".jpg"),
            "got {}",
            moved.name
        );
    }

    #[tokio::test]
    async fn test_upload_new_file_resolves_name_conflict() {
        let b = TestInstance::new("bob.example.net").await;
        let photos = b.ctx.vfs.mkdir_p("/Photos").unwrap();
        let sharing = b
            .create_sharing(vec![Rule::for_directories("Photos", vec![photos.id.clone()])])
            .await;

        // A local file already sits at /Photos/pic.jpg.
        let local = FileDoc::new("local1", photos.id.clone(), "pic.jpg", b.ctx.clock.now());
        b.ctx.write_file(local, Some(b"local")).await.unwrap();

        // An unrelated replicated file wants the same path with a higher
        // revision: the local one must yield.
        let mut incoming = FileDoc::new("remote1", photos.id.clone(), "pic.jpg", b.ctx.clock.now());
        incoming.md5 = md5_hex(b"remote");
        incoming.size = 6;
        let chain = RevChain::from_revisions(&["9-fff".to_string()]).unwrap();
        let key = b
            .ctx
            .uploads
            .insert(sharing.id.clone(), 0, incoming, chain);
        receive_file_body(&b.ctx, &key, b"remote").await.unwrap();

        let winner = b.ctx.vfs.index().child_by_name(&photos.id, "pic.jpg").unwrap();
        assert_eq!(winner.id(), "remote1");
        let moved = b.ctx.vfs.index().file("local1").unwrap();
        assert!(moved.name.contains(" - conflict - "), "got {}", moved.name);
    }
}
