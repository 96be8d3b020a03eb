//! Trigger registry.
//!
//! Accepting a sharing installs one trigger per rule doctype; the local
//! write path consults the registry to know whether a mutation must be
//! projected onto the shared log. Revoking removes the sharing's triggers
//! without touching any data.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::info;

use crate::sharing::Sharing;

/// Doctype -> sharings tracking it.
#[derive(Default)]
pub struct TriggerRegistry {
    by_doctype: DashMap<String, HashSet<String>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install triggers for every rule of the sharing.
    pub fn install(&self, sharing: &Sharing) {
        for rule in &sharing.rules {
            self.by_doctype
                .entry(rule.doc_type.clone())
                .or_default()
                .insert(sharing.id.clone());
        }
        info!("Installed triggers: sharing={}", sharing.id);
    }

    /// Remove every trigger of a sharing.
    pub fn remove(&self, sharing_id: &str) {
        self.by_doctype.retain(|_, sharings| {
            sharings.remove(sharing_id);
            !sharings.is_empty()
        });
        info!("Removed triggers: sharing={}", sharing_id);
    }

    /// Whether any sharing tracks this doctype.
    pub fn is_tracked(&self, doctype: &str) -> bool {
        self.by_doctype.contains_key(doctype)
    }

    /// Sharings holding a trigger on this doctype.
    pub fn sharings_for(&self, doctype: &str) -> Vec<String> {
        match self.by_doctype.get(doctype) {
            Some(sharings) => {
                let mut out: Vec<String> = sharings.iter().cloned().collect();
                out.sort();
                out
            }
            None => Vec::new(),
        }
    }
}
