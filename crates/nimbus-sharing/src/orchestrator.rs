//! Sharing lifecycle.
//!
//! Create (owner), invite, receive (recipient), answer, initial copy, and
//! revocation. Credentials are minted per link: the owner generates the
//! state and the identifier pad at creation, the recipient mints the token
//! pair when it accepts and hands it back in its answer. Revocation drops
//! credentials and triggers, never user data.

use tracing::{info, warn};

use nimbus_core::protocol::{AnswerPayload, CreateSharingRequest, Member, MemberStatus};
use nimbus_core::rules::Rule;
use nimbus_core::types::{consts, shared_id};
use nimbus_core::{random_hex, Error, JsonDoc, Result, XorKey};

use nimbus_vfs::DocKind;

use crate::context::Context;
use crate::shared::{self, DocEvent};
use crate::sharing::Sharing;

/// Create a sharing on the owner instance and install its triggers.
pub async fn create_sharing(
    ctx: &Context,
    description: impl Into<String>,
    recipients: Vec<Member>,
    rules: Vec<Rule>,
) -> Result<Sharing> {
    let owner = Member {
        instance: format!("https://{}", ctx.domain),
        public_name: ctx.domain.clone(),
        email: String::new(),
        status: MemberStatus::Ready,
    };
    let mut sharing = Sharing::create(description, owner, recipients, rules, ctx.clock.now())?;
    sharing.save(ctx.store.as_ref()).await?;
    ctx.triggers.install(&sharing);
    info!("Sharing created: id={}, members={}", sharing.id, sharing.members.len());
    Ok(sharing)
}

/// Send the create-sharing request to one recipient.
///
/// File identifiers inside the rules are XORed with the member's pad
/// before they leave the instance.
pub async fn send_invitation(ctx: &Context, sharing: &mut Sharing, member_index: usize) -> Result<()> {
    let member = sharing
        .members
        .get(member_index)
        .ok_or(Error::InvalidSharing)?
        .clone();
    let credentials = sharing
        .credentials_for(member_index)
        .ok_or(Error::InvalidSharing)?;

    let request = CreateSharingRequest {
        description: sharing.description.clone(),
        members: sharing.members.clone(),
        rules: wire_rules(&sharing.rules, &credentials.xor_key),
        state: credentials.state.clone(),
        xor_key: credentials.xor_key.clone(),
    };

    let peer = ctx.peers.invite_client(&member.instance)?;
    peer.create_sharing(&sharing.id, &request).await?;

    sharing.members[member_index].status = MemberStatus::MailSent;
    sharing.updated_at = ctx.clock.now();
    sharing.save(ctx.store.as_ref()).await?;
    info!(
        "Invitation sent: sharing={}, member={}",
        sharing.id, member.instance
    );
    Ok(())
}

/// Handle `PUT /sharings/{sid}` on the recipient instance.
pub async fn receive_sharing(
    ctx: &Context,
    sid: &str,
    req: &CreateSharingRequest,
) -> Result<Sharing> {
    let mut localized = req.clone();
    // Un-pad the rule values so they designate our future local documents.
    localized.rules = wire_rules(&req.rules, &req.xor_key);
    let mut sharing = Sharing::from_request(sid, &localized, ctx.clock.now())?;
    sharing.save(ctx.store.as_ref()).await?;
    info!("Sharing received: id={}, owner={}", sid, sharing.members[0].instance);
    Ok(sharing)
}

/// Accept a sharing on the recipient instance: mint the token pair, mark
/// ourselves active, send the credentials back, install triggers.
pub async fn answer_sharing(ctx: &Context, sid: &str) -> Result<()> {
    let mut sharing = Sharing::load(ctx.store.as_ref(), sid).await?;
    if sharing.owner {
        return Err(Error::InvalidSharing);
    }

    let self_index = member_index_for_instance(&sharing, &ctx.domain)
        .ok_or(Error::InvalidSharing)?;

    let owner_instance = sharing.members[0].instance.clone();
    let payload = {
        let credentials = sharing
            .credentials_for_mut(0)
            .ok_or(Error::NoOAuthClient)?;
        credentials.access_token = random_hex(32);
        credentials.refresh_token = random_hex(32);
        AnswerPayload {
            state: credentials.state.clone(),
            access_token: credentials.access_token.clone(),
            refresh_token: credentials.refresh_token.clone(),
            xor_key: credentials.xor_key.clone(),
        }
    };

    let peer = ctx.peers.invite_client(&owner_instance)?;
    peer.answer(sid, &payload).await?;

    sharing.members[self_index].status = MemberStatus::Ready;
    sharing.active = true;
    sharing.updated_at = ctx.clock.now();
    sharing.save(ctx.store.as_ref()).await?;
    ctx.triggers.install(&sharing);
    info!("Sharing accepted: id={}", sid);
    Ok(())
}

/// Handle `POST /sharings/{sid}/answer` on the owner instance.
///
/// Stores the returned credentials, marks the member ready, and seeds the
/// shared log so the first replication pass covers the existing documents.
pub async fn receive_answer(ctx: &Context, sid: &str, payload: &AnswerPayload) -> Result<()> {
    let mut sharing = Sharing::load(ctx.store.as_ref(), sid).await?;
    if !sharing.owner {
        return Err(Error::InvalidSharing);
    }
    let member_index = sharing
        .member_index_by_state(&payload.state)
        .ok_or(Error::InvalidSharing)?;

    {
        let credentials = sharing
            .credentials_for_mut(member_index)
            .ok_or(Error::NoOAuthClient)?;
        credentials.access_token = payload.access_token.clone();
        credentials.refresh_token = payload.refresh_token.clone();
    }
    sharing.members[member_index].status = MemberStatus::Ready;
    sharing.updated_at = ctx.clock.now();
    sharing.save(ctx.store.as_ref()).await?;

    initial_copy(ctx, &sharing).await?;
    info!(
        "Answer received: sharing={}, member={}",
        sid, sharing.members[member_index].instance
    );
    Ok(())
}

/// Walk every document matching a non-local rule and seed the shared log,
/// so the changes feed replays the whole current state.
pub async fn initial_copy(ctx: &Context, sharing: &Sharing) -> Result<()> {
    let mut seeded = 0usize;
    for rule in &sharing.rules {
        if rule.local {
            continue;
        }
        let docs = collect_rule_docs(ctx, rule).await?;
        for doc in docs {
            let Some(rev) = doc.rev().map(str::to_string) else {
                continue;
            };
            let is_file = doc.get_str("type") == Some("file");
            let ancestors = match doc.get_str("dirId") {
                Some(dir_id) if rule.doc_type == consts::FILES => {
                    ctx.vfs.index().ancestors(dir_id)
                }
                _ => Vec::new(),
            };
            shared::track(
                ctx,
                &DocEvent {
                    doctype: rule.doc_type.clone(),
                    doc: doc.clone(),
                    rev,
                    deleted: false,
                    // Existing file content must travel on first sync.
                    md5_changed: is_file,
                    ancestors,
                },
            )
            .await;
            seeded += 1;
        }
    }
    info!("Initial copy seeded: sharing={}, docs={}", sharing.id, seeded);
    Ok(())
}

async fn collect_rule_docs(ctx: &Context, rule: &Rule) -> Result<Vec<JsonDoc>> {
    match rule.selector.as_str() {
        "" | "id" => {
            if rule.doc_type == consts::FILES {
                return Ok(collect_file_trees(ctx, &rule.values));
            }
            let mut docs = Vec::new();
            for id in &rule.values {
                match ctx.store.get(&rule.doc_type, id).await {
                    Ok(doc) => docs.push(doc),
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(docs)
        }
        "referenced_by" => {
            let all = ctx.store.all_docs(&rule.doc_type).await?;
            Ok(all
                .into_iter()
                .filter(|doc| rule.matches(&rule.doc_type, doc, &[]))
                .collect())
        }
        attribute => {
            let mut docs = Vec::new();
            for value in &rule.values {
                docs.extend(ctx.store.find_by_index(&rule.doc_type, attribute, value).await?);
            }
            Ok(docs)
        }
    }
}

/// Every file and directory document under the given roots.
fn collect_file_trees(ctx: &Context, roots: &[String]) -> Vec<JsonDoc> {
    let index = ctx.vfs.index();
    let mut out = Vec::new();
    let mut queue: Vec<String> = Vec::new();
    for root in roots {
        match index.doc(root) {
            Some(DocKind::Dir(dir)) => {
                if let Ok(doc) = dir.to_json() {
                    out.push(doc);
                }
                queue.push(dir.id);
            }
            Some(DocKind::File(file)) => {
                if let Ok(doc) = file.to_json() {
                    out.push(doc);
                }
            }
            None => {}
        }
    }
    while let Some(dir_id) = queue.pop() {
        for child in index.children(&dir_id) {
            match child {
                DocKind::Dir(dir) => {
                    if let Ok(doc) = dir.to_json() {
                        out.push(doc);
                    }
                    queue.push(dir.id);
                }
                DocKind::File(file) => {
                    if let Ok(doc) = file.to_json() {
                        out.push(doc);
                    }
                }
            }
        }
    }
    out
}

/// Revoke one member (owner side): notify the peer, drop its credentials,
/// mark it revoked. The member's data stays where it is, on both sides.
pub async fn revoke_member(ctx: &Context, sid: &str, member_index: usize) -> Result<()> {
    let mut sharing = Sharing::load(ctx.store.as_ref(), sid).await?;
    if !sharing.owner || member_index == 0 {
        return Err(Error::InvalidSharing);
    }
    if let Ok(peer) = ctx.peers.client_for(&sharing, member_index) {
        if let Err(e) = peer.revoke_sharing(sid).await {
            warn!("Peer revocation notification failed: sharing={}, error={}", sid, e);
        }
    }
    if let Some(credentials) = sharing.credentials_for_mut(member_index) {
        credentials.access_token.clear();
        credentials.refresh_token.clear();
        credentials.client_id.clear();
        credentials.inbound_client_id.clear();
    }
    sharing.members[member_index].status = MemberStatus::Revoked;
    let any_ready = sharing
        .members
        .iter()
        .skip(1)
        .any(|m| m.status == MemberStatus::Ready);
    if !any_ready {
        sharing.active = false;
        ctx.triggers.remove(&sharing.id);
    }
    sharing.updated_at = ctx.clock.now();
    sharing.save(ctx.store.as_ref()).await?;
    info!("Member revoked: sharing={}, member={}", sid, member_index);
    Ok(())
}

/// Handle `DELETE /sharings/{sid}` on a recipient: the owner revoked us.
/// Credentials and triggers go away; local copies of shared documents are
/// retained.
pub async fn revoke_sharing_local(ctx: &Context, sid: &str) -> Result<()> {
    let mut sharing = Sharing::load(ctx.store.as_ref(), sid).await?;
    for credentials in &mut sharing.credentials {
        credentials.access_token.clear();
        credentials.refresh_token.clear();
        credentials.client_id.clear();
        credentials.inbound_client_id.clear();
    }
    if let Some(self_index) = member_index_for_instance(&sharing, &ctx.domain) {
        sharing.members[self_index].status = MemberStatus::Revoked;
    }
    sharing.active = false;
    ctx.triggers.remove(sid);
    sharing.updated_at = ctx.clock.now();
    sharing.save(ctx.store.as_ref()).await?;
    info!("Sharing revoked locally: id={}", sid);
    Ok(())
}

/// Mark a member as errored after a terminal replication failure, so the
/// state is visible to the user.
pub async fn mark_member_errored(ctx: &Context, sid: &str, member_index: usize) -> Result<()> {
    let mut sharing = Sharing::load(ctx.store.as_ref(), sid).await?;
    if let Some(member) = sharing.members.get_mut(member_index) {
        member.status = MemberStatus::Errored;
        sharing.updated_at = ctx.clock.now();
        sharing.save(ctx.store.as_ref()).await?;
    }
    Ok(())
}

/// Whether a document is still covered by an active sharing, per the
/// shared log. Used by tests and the UI to audit scope.
pub async fn is_shared(ctx: &Context, doctype: &str, id: &str) -> Result<bool> {
    match ctx.store.get(consts::SHARED, &shared_id(doctype, id)).await {
        Ok(doc) => {
            let record = crate::shared::SharedRecord::from_json(&doc)?;
            Ok(record.infos.values().any(|info| !info.removed))
        }
        Err(Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn member_index_for_instance(sharing: &Sharing, domain: &str) -> Option<usize> {
    sharing
        .members
        .iter()
        .position(|m| m.instance.contains(domain))
}

fn wire_rules(rules: &[Rule], key: &XorKey) -> Vec<Rule> {
    rules
        .iter()
        .map(|rule| {
            let mut out = rule.clone();
            if out.doc_type == consts::FILES {
                out.values = out.values.iter().map(|v| key.apply(v)).collect();
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestNetwork;
    use crate::worker;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_two_instance_create_and_sync() {
        let net = TestNetwork::new();
        let a = net.instance("alice.example.net").await;
        let b = net.instance("bob.example.net").await;

        // Owner A creates a sharing over note n1 with member B.
        let mut sharing = create_sharing(
            &a.ctx,
            "Notes",
            vec![Member::new("https://bob.example.net", "Bob")],
            vec![{
                let mut rule = Rule::by_ids("notes", vec!["n1".to_string()]);
                rule.selector = "id".to_string();
                rule
            }],
        )
        .await
        .unwrap();

        send_invitation(&a.ctx, &mut sharing, 1).await.unwrap();
        answer_sharing(&b.ctx, &sharing.id).await.unwrap();

        // A writes the covered document and replicates.
        let mut doc = JsonDoc::with_id("n1");
        doc.insert("title", json!("hi"));
        a.ctx.write_doc("notes", doc).await.unwrap();

        let sharing = Sharing::load(a.ctx.store.as_ref(), &sharing.id).await.unwrap();
        let cancel = CancellationToken::new();
        worker::run_once(&a.ctx, &sharing, 1, &cancel).await.unwrap();

        // B sees the document under its original id and title.
        let on_b = b.ctx.store.get("notes", "n1").await.unwrap();
        assert_eq!(on_b.get_str("title"), Some("hi"));
        assert!(on_b.rev().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_edits_converge_on_winner() {
        let net = TestNetwork::new();
        let a = net.instance("alice.example.net").await;
        let b = net.instance("bob.example.net").await;

        let mut sharing = create_sharing(
            &a.ctx,
            "Notes",
            vec![Member::new("https://bob.example.net", "Bob")],
            vec![Rule::by_ids("notes", vec!["n1".to_string()])],
        )
        .await
        .unwrap();
        send_invitation(&a.ctx, &mut sharing, 1).await.unwrap();
        answer_sharing(&b.ctx, &sharing.id).await.unwrap();
        let sid = sharing.id.clone();

        // Divergent histories on both sides, seeded through the replicated
        // write path so the revisions are exactly the contested ones.
        let base = RevChainFixture::base();
        crate::apply::apply_doc(&a.ctx, "notes", base.doc("A"), base.chain_a()).await.unwrap();
        crate::apply::apply_doc(&b.ctx, "notes", base.doc("B"), base.chain_b()).await.unwrap();

        // Replicate both directions.
        let on_a = Sharing::load(a.ctx.store.as_ref(), &sid).await.unwrap();
        let on_b = Sharing::load(b.ctx.store.as_ref(), &sid).await.unwrap();
        let cancel = CancellationToken::new();
        worker::run_once(&a.ctx, &on_a, 1, &cancel).await.unwrap();
        worker::run_once(&b.ctx, &on_b, 0, &cancel).await.unwrap();
        worker::run_once(&a.ctx, &on_a, 1, &cancel).await.unwrap();

        // Both sides settle on the higher revision hash ("ca2" > "b1a").
        let doc_a = a.ctx.store.get("notes", "n1").await.unwrap();
        let doc_b = b.ctx.store.get("notes", "n1").await.unwrap();
        assert_eq!(doc_a.rev(), Some("2-ca2"));
        assert_eq!(doc_b.rev(), Some("2-ca2"));
        assert_eq!(doc_a.get_str("title"), Some("B"));
        assert_eq!(doc_b.get_str("title"), Some("B"));

        // The losing instance keeps a pointer to its own revision.
        let conflicts = a.ctx.store.conflicts("notes", "n1").await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].rev, "2-b1a");
    }

    struct RevChainFixture;

    impl RevChainFixture {
        fn base() -> Self {
            Self
        }

        fn doc(&self, title: &str) -> JsonDoc {
            let mut doc = JsonDoc::with_id("n1");
            doc.insert("title", json!(title));
            doc
        }

        fn chain_a(&self) -> nimbus_core::RevChain {
            nimbus_core::RevChain::from_revisions(&[
                "2-b1a".to_string(),
                "1-aaa".to_string(),
            ])
            .unwrap()
        }

        fn chain_b(&self) -> nimbus_core::RevChain {
            nimbus_core::RevChain::from_revisions(&[
                "2-ca2".to_string(),
                "1-aaa".to_string(),
            ])
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_initial_copy_seeds_existing_docs() {
        let net = TestNetwork::new();
        let a = net.instance("alice.example.net").await;
        let b = net.instance("bob.example.net").await;

        // The document exists before the sharing is answered.
        let mut doc = JsonDoc::with_id("n1");
        doc.insert("title", json!("pre-existing"));
        a.ctx.store.put("notes", doc).await.unwrap();

        let mut sharing = create_sharing(
            &a.ctx,
            "Notes",
            vec![Member::new("https://bob.example.net", "Bob")],
            vec![Rule::by_ids("notes", vec!["n1".to_string()])],
        )
        .await
        .unwrap();
        send_invitation(&a.ctx, &mut sharing, 1).await.unwrap();
        answer_sharing(&b.ctx, &sharing.id).await.unwrap();

        let sharing = Sharing::load(a.ctx.store.as_ref(), &sharing.id).await.unwrap();
        let cancel = CancellationToken::new();
        worker::run_once(&a.ctx, &sharing, 1, &cancel).await.unwrap();

        let on_b = b.ctx.store.get("notes", "n1").await.unwrap();
        assert_eq!(on_b.get_str("title"), Some("pre-existing"));
    }

    #[tokio::test]
    async fn test_revoke_keeps_data() {
        let net = TestNetwork::new();
        let a = net.instance("alice.example.net").await;
        let b = net.instance("bob.example.net").await;

        let mut sharing = create_sharing(
            &a.ctx,
            "Notes",
            vec![Member::new("https://bob.example.net", "Bob")],
            vec![Rule::by_ids("notes", vec!["n1".to_string()])],
        )
        .await
        .unwrap();
        send_invitation(&a.ctx, &mut sharing, 1).await.unwrap();
        answer_sharing(&b.ctx, &sharing.id).await.unwrap();

        let mut doc = JsonDoc::with_id("n1");
        doc.insert("title", json!("hi"));
        a.ctx.write_doc("notes", doc).await.unwrap();
        let sharing_a = Sharing::load(a.ctx.store.as_ref(), &sharing.id).await.unwrap();
        let cancel = CancellationToken::new();
        worker::run_once(&a.ctx, &sharing_a, 1, &cancel).await.unwrap();
        assert!(b.ctx.store.get("notes", "n1").await.is_ok());

        revoke_member(&a.ctx, &sharing.id, 1).await.unwrap();

        // Owner side: member revoked, credentials emptied, triggers gone.
        let on_a = Sharing::load(a.ctx.store.as_ref(), &sharing.id).await.unwrap();
        assert_eq!(on_a.members[1].status, MemberStatus::Revoked);
        assert!(!on_a.credentials[0].usable());
        assert!(!on_a.active);
        assert!(!a.ctx.triggers.is_tracked("notes"));

        // Recipient side: revoked and inert, but the copy survives.
        let on_b = Sharing::load(b.ctx.store.as_ref(), &sharing.id).await.unwrap();
        assert!(!on_b.active);
        assert!(!on_b.credentials[0].usable());
        assert!(!b.ctx.triggers.is_tracked("notes"));
        assert!(b.ctx.store.get("notes", "n1").await.is_ok());
    }
}
