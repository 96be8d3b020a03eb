//! Per-sharing workers.
//!
//! Each (sharing, member) pair gets at most `concurrency.max_per_sharing`
//! active workers (default one); a worker drains the replicate pass, then
//! the upload pass, re-invoking itself while batches stay full. Retryable
//! failures back off exponentially up to the configured attempts, then the
//! member is marked errored and the worker stops. Cancellation is honored
//! between batches and between documents.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use nimbus_core::Result;

use crate::context::Context;
use crate::orchestrator;
use crate::replicator;
use crate::sharing::Sharing;
use crate::upload;

/// Batches drained in a single invocation before yielding back to the
/// scheduler.
const MAX_BATCHES_PER_RUN: usize = 32;

/// Drain both directions toward one member: documents first, then binary
/// content.
pub async fn run_once(
    ctx: &Context,
    sharing: &Sharing,
    member_index: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut rounds = 0;
    while replicator::replicate(ctx, sharing, member_index, cancel).await? {
        rounds += 1;
        if rounds >= MAX_BATCHES_PER_RUN || cancel.is_cancelled() {
            break;
        }
    }
    let mut rounds = 0;
    while upload::upload(ctx, sharing, member_index, cancel).await? {
        rounds += 1;
        if rounds >= MAX_BATCHES_PER_RUN || cancel.is_cancelled() {
            break;
        }
    }
    Ok(())
}

/// Spawns and bounds the per-sharing worker tasks of one process.
pub struct SharingScheduler {
    ctx: Arc<Context>,
    active: Arc<DashMap<(String, usize), usize>>,
    cancel: CancellationToken,
}

impl SharingScheduler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            active: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Kick the workers of a sharing, one per peer member. Members whose
    /// worker slot is already taken are skipped.
    pub async fn poke(&self, sid: &str) -> Result<()> {
        let sharing = Sharing::load(self.ctx.store.as_ref(), sid).await?;
        for member_index in sharing.peer_members() {
            self.spawn(sid.to_string(), member_index);
        }
        Ok(())
    }

    fn spawn(&self, sid: String, member_index: usize) {
        let key = (sid.clone(), member_index);
        let max = self.ctx.config.concurrency.max_per_sharing.max(1);
        {
            let mut slot = self.active.entry(key.clone()).or_insert(0);
            if *slot >= max {
                debug!(
                    "Worker already active: sharing={}, member={}",
                    sid, member_index
                );
                return;
            }
            *slot += 1;
        }

        let ctx = self.ctx.clone();
        let active = self.active.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            run_worker(&ctx, &sid, member_index, &cancel).await;
            if let Some(mut slot) = active.get_mut(&(sid, member_index)) {
                *slot = slot.saturating_sub(1);
            }
        });
    }

    /// Number of live workers, for observability and tests.
    pub fn active_workers(&self) -> usize {
        self.active.iter().map(|entry| *entry.value()).sum()
    }

    /// Cancel every worker and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for _ in 0..100 {
            if self.active_workers() == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn run_worker(ctx: &Context, sid: &str, member_index: usize, cancel: &CancellationToken) {
    let retries = ctx.config.replicator.retries.max(1);
    let base = ctx.config.replicator.backoff_base_ms;
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let sharing = match Sharing::load(ctx.store.as_ref(), sid).await {
            Ok(sharing) => sharing,
            Err(e) => {
                error!("Worker cannot load sharing {}: {}", sid, e);
                return;
            }
        };
        if !sharing.active {
            return;
        }
        match run_once(ctx, &sharing, member_index, cancel).await {
            Ok(()) => {
                info!(
                    "Worker drained: sharing={}, member={}",
                    sid, member_index
                );
                return;
            }
            Err(e) if e.is_retryable() && attempt + 1 < retries => {
                let delay = base.saturating_mul(1u64 << attempt.min(10));
                debug!(
                    "Worker backing off {}ms: sharing={}, member={}, error={}",
                    delay, sid, member_index, e
                );
                sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    "Replication failed terminally: sharing={}, member={}, direction=both, error={}",
                    sid, member_index, e
                );
                if let Err(mark) = orchestrator::mark_member_errored(ctx, sid, member_index).await {
                    error!("Could not mark member errored: {}", mark);
                }
                return;
            }
        }
    }
}
