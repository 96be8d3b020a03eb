//! Test harness: in-process instances wired through an in-memory peer
//! transport, so end-to-end scenarios run without HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use nimbus_core::config::Config;
use nimbus_core::protocol::{
    AnswerPayload, BulkDocsRequest, CreateSharingRequest, FileMetadataPayload, MetadataOutcome,
    Member, RevsDiffRequest, RevsDiffResponse,
};
use nimbus_core::rules::Rule;
use nimbus_core::{random_hex, Clock, Error, Result, SystemClock};
use nimbus_vfs::{FileDoc, Vfs};

use crate::apply;
use crate::context::Context;
use crate::lock::InProcessLocker;
use crate::orchestrator;
use crate::peer::{PeerClient, PeerFactory};
use crate::sharing::Sharing;
use crate::store::MemoryStore;
use crate::trigger::TriggerRegistry;
use crate::upload::{self, UploadKeyStore};

/// Instance registry, keyed by instance URL.
#[derive(Default)]
pub(crate) struct LocalNetwork {
    instances: RwLock<HashMap<String, Arc<Context>>>,
}

impl LocalNetwork {
    fn register(&self, url: String, ctx: Arc<Context>) {
        self.instances.write().insert(url, ctx);
    }

    fn resolve(&self, url: &str) -> Result<Arc<Context>> {
        self.instances
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))
    }
}

/// Peer factory handing out in-process clients.
struct LocalPeerFactory {
    network: Arc<LocalNetwork>,
    caller: String,
}

impl PeerFactory for LocalPeerFactory {
    fn client_for(&self, sharing: &Sharing, member_index: usize) -> Result<Arc<dyn PeerClient>> {
        let member = sharing
            .members
            .get(member_index)
            .ok_or(Error::InvalidSharing)?;
        Ok(Arc::new(LocalPeer {
            network: self.network.clone(),
            target: member.instance.clone(),
            caller: self.caller.clone(),
        }))
    }

    fn invite_client(&self, instance: &str) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(LocalPeer {
            network: self.network.clone(),
            target: instance.to_string(),
            caller: self.caller.clone(),
        }))
    }
}

/// A peer client that calls the receive-side handlers directly.
struct LocalPeer {
    network: Arc<LocalNetwork>,
    target: String,
    caller: String,
}

impl LocalPeer {
    fn ctx(&self) -> Result<Arc<Context>> {
        self.network.resolve(&self.target)
    }

    /// The caller's member index, as seen by the target instance.
    async fn caller_index(&self, ctx: &Context, sid: &str) -> Result<(Sharing, usize)> {
        let sharing = Sharing::load(ctx.store.as_ref(), sid).await?;
        let index = sharing
            .members
            .iter()
            .position(|m| m.instance == self.caller)
            .ok_or(Error::InvalidSharing)?;
        Ok((sharing, index))
    }
}

#[async_trait]
impl PeerClient for LocalPeer {
    async fn create_sharing(&self, sid: &str, req: &CreateSharingRequest) -> Result<()> {
        let ctx = self.ctx()?;
        orchestrator::receive_sharing(&ctx, sid, req).await.map(|_| ())
    }

    async fn answer(&self, sid: &str, payload: &AnswerPayload) -> Result<()> {
        let ctx = self.ctx()?;
        orchestrator::receive_answer(&ctx, sid, payload).await
    }

    async fn revs_diff(&self, sid: &str, req: &RevsDiffRequest) -> Result<RevsDiffResponse> {
        let ctx = self.ctx()?;
        let (sharing, index) = self.caller_index(&ctx, sid).await?;
        apply::revs_diff(&ctx, &sharing, index, req).await
    }

    async fn bulk_docs(&self, sid: &str, req: &BulkDocsRequest) -> Result<()> {
        let ctx = self.ctx()?;
        let (sharing, index) = self.caller_index(&ctx, sid).await?;
        apply::apply_bulk_docs(&ctx, &sharing, index, req.clone()).await
    }

    async fn put_file_metadata(
        &self,
        sid: &str,
        xored_id: &str,
        payload: &FileMetadataPayload,
    ) -> Result<MetadataOutcome> {
        let ctx = self.ctx()?;
        let (sharing, index) = self.caller_index(&ctx, sid).await?;
        upload::sync_file(&ctx, &sharing, index, xored_id, payload.clone()).await
    }

    async fn put_file_body(&self, sid: &str, key: &str, body: bytes::Bytes) -> Result<()> {
        let ctx = self.ctx()?;
        let _ = sid;
        upload::receive_file_body(&ctx, key, &body).await
    }

    async fn revoke_sharing(&self, sid: &str) -> Result<()> {
        let ctx = self.ctx()?;
        orchestrator::revoke_sharing_local(&ctx, sid).await
    }

    async fn revoke_recipient(&self, sid: &str, member_id: &str) -> Result<()> {
        let ctx = self.ctx()?;
        let index: usize = member_id
            .parse()
            .map_err(|_| Error::InvalidSharing)?;
        orchestrator::revoke_member(&ctx, sid, index).await
    }

    async fn refresh_token(&self) -> Result<()> {
        Ok(())
    }
}

/// A set of instances sharing one in-memory transport.
pub(crate) struct TestNetwork {
    network: Arc<LocalNetwork>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            network: Arc::new(LocalNetwork::default()),
        }
    }

    /// Spin up a fresh instance and register it on the network.
    pub async fn instance(&self, domain: &str) -> TestInstance {
        let tmp = tempfile::tempdir().expect("tempdir");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let vfs = Arc::new(Vfs::new(tmp.path(), clock.clone()).expect("vfs"));
        let url = format!("https://{}", domain);
        let config = Config::default();
        let ctx = Arc::new(Context {
            domain: domain.to_string(),
            store: Arc::new(MemoryStore::new()),
            vfs,
            locker: Arc::new(InProcessLocker::new(Duration::from_secs(5))),
            peers: Arc::new(LocalPeerFactory {
                network: self.network.clone(),
                caller: url.clone(),
            }),
            clock,
            config,
            triggers: Arc::new(TriggerRegistry::new()),
            uploads: Arc::new(UploadKeyStore::new(Duration::from_secs(300))),
        });
        self.network.register(url, ctx.clone());
        TestInstance {
            ctx,
            domain: domain.to_string(),
            _tmp: tmp,
        }
    }
}

/// One in-process instance.
pub(crate) struct TestInstance {
    pub ctx: Arc<Context>,
    #[allow(dead_code)]
    pub domain: String,
    _tmp: tempfile::TempDir,
}

impl TestInstance {
    /// A lone instance on its own network.
    pub async fn new(domain: &str) -> Self {
        TestNetwork::new().instance(domain).await
    }

    /// Owner-side sharing over the given rules, with one pending recipient.
    pub async fn create_sharing(&self, rules: Vec<Rule>) -> Sharing {
        orchestrator::create_sharing(
            &self.ctx,
            "test sharing",
            vec![Member::new("https://peer.example.net", "Peer")],
            rules,
        )
        .await
        .expect("create sharing")
    }

    /// Create a file through the tracked write path.
    pub async fn new_file(&self, dir_id: &str, name: &str, content: &[u8]) -> FileDoc {
        let file = FileDoc::new(random_hex(8), dir_id, name, self.ctx.clock.now());
        self.ctx
            .write_file(file, Some(content))
            .await
            .expect("write file")
    }

    /// Replace a file's content through the tracked write path.
    pub async fn update_file_content(&self, id: &str, content: &[u8]) -> FileDoc {
        let file = self.ctx.vfs.index().file(id).expect("file exists");
        self.ctx
            .write_file(file, Some(content))
            .await
            .expect("update file")
    }
}
