//! Replication checkpoints.
//!
//! One record per sharing (`sequences/{sid}`) maps `(member, direction)` to
//! the last applied position of the local changes feed. Checkpoints only
//! ever move forward; a crashed worker resumes from its last persisted
//! position and re-sends at most one batch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use nimbus_core::types::consts;
use nimbus_core::{Error, JsonDoc, Result};

use crate::store::DocumentStore;

/// Direction of a replication pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Document replication (bulk diffs and updates).
    Replicate,
    /// Binary content synchronization.
    Upload,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Replicate => "replicate",
            Direction::Upload => "upload",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SequencesDoc {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    /// `"<member>/<direction>"` -> last applied sequence.
    #[serde(default)]
    sequences: HashMap<String, String>,
}

fn record_id(sharing_id: &str) -> String {
    format!("sequences/{}", sharing_id)
}

fn entry_key(member_index: usize, direction: Direction) -> String {
    format!("{}/{}", member_index, direction.as_str())
}

/// Read the checkpoint of one (sharing, member, direction).
pub async fn get(
    store: &dyn DocumentStore,
    sharing_id: &str,
    member_index: usize,
    direction: Direction,
) -> Result<Option<String>> {
    match store.get(consts::SEQUENCES, &record_id(sharing_id)).await {
        Ok(doc) => {
            let parsed: SequencesDoc = doc.deserialize()?;
            Ok(parsed.sequences.get(&entry_key(member_index, direction)).cloned())
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Advance a checkpoint. Stale writes retry on contention; a sequence that
/// does not move forward is ignored.
pub async fn advance(
    store: &dyn DocumentStore,
    sharing_id: &str,
    member_index: usize,
    direction: Direction,
    seq: &str,
) -> Result<()> {
    let id = record_id(sharing_id);
    let key = entry_key(member_index, direction);
    for _ in 0..4 {
        let mut doc = match store.get(consts::SEQUENCES, &id).await {
            Ok(existing) => existing.deserialize::<SequencesDoc>()?,
            Err(Error::NotFound(_)) => SequencesDoc {
                id: id.clone(),
                ..SequencesDoc::default()
            },
            Err(e) => return Err(e),
        };
        if let Some(current) = doc.sequences.get(&key) {
            if !moves_forward(current, seq) {
                return Ok(());
            }
        }
        doc.sequences.insert(key.clone(), seq.to_string());
        let json = JsonDoc::from_serialize(&doc)?;
        match store.put(consts::SEQUENCES, json).await {
            Ok(_) => return Ok(()),
            Err(Error::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    warn!(
        "Checkpoint contention: sharing={}, member={}, direction={}",
        sharing_id, member_index, direction
    );
    Err(Error::Conflict(format!(
        "checkpoint {}/{}",
        sharing_id, key
    )))
}

fn moves_forward(current: &str, candidate: &str) -> bool {
    match (current.parse::<u64>(), candidate.parse::<u64>()) {
        (Ok(a), Ok(b)) => b > a,
        // Opaque sequences: accept anything that differs.
        _ => current != candidate,
    }
}
