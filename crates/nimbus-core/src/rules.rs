//! Sharing rules.
//!
//! A rule is a predicate over documents of one doctype. The tracker uses
//! rules to decide which documents are in a sharing's scope; the sharing
//! descriptor carries them on the wire, so the type lives here with the
//! other payload shapes.

use serde::{Deserialize, Serialize};

use crate::types::{consts, JsonDoc};

/// What a matching document does when it changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopePolicy {
    /// Changes flow both ways.
    #[default]
    Sync,
    /// Changes flow from the owner only.
    Push,
    /// Changes stay local after the initial copy.
    None,
}

/// A predicate over documents of one doctype.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Human-readable label shown in invitations.
    #[serde(default)]
    pub title: String,
    pub doc_type: String,
    /// `""` or `"id"` selects by identifier, `"referenced_by"` by
    /// back-reference, anything else by attribute equality.
    #[serde(default)]
    pub selector: String,
    pub values: Vec<String>,
    /// Local rules feed the shared log but never leave the instance.
    #[serde(default)]
    pub local: bool,
    /// HTTP verbs the remote side may use on matching documents.
    /// Empty means all.
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub add: ScopePolicy,
    #[serde(default)]
    pub update: ScopePolicy,
    #[serde(default)]
    pub remove: ScopePolicy,
}

impl Rule {
    /// Rule selecting explicit document ids.
    pub fn by_ids(doc_type: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            title: String::new(),
            doc_type: doc_type.into(),
            selector: String::new(),
            values,
            local: false,
            verbs: Vec::new(),
            add: ScopePolicy::Sync,
            update: ScopePolicy::Sync,
            remove: ScopePolicy::Sync,
        }
    }

    /// Rule sharing the files under the given directory roots.
    pub fn for_directories(title: impl Into<String>, roots: Vec<String>) -> Self {
        let mut rule = Self::by_ids(consts::FILES, roots);
        rule.title = title.into();
        rule
    }

    /// Basic shape validation. A rule with no values matches nothing and is
    /// rejected at sharing creation.
    pub fn validate(&self) -> bool {
        !self.doc_type.is_empty() && !self.values.is_empty()
    }

    /// Whether updates flow back from recipients.
    pub fn two_way(&self) -> bool {
        self.update == ScopePolicy::Sync
    }

    /// Evaluate the predicate.
    ///
    /// `ancestors` lists the directory ids above a file document (nearest
    /// first); it is empty for every other doctype. A files rule whose
    /// values name directory roots matches any document below one of them.
    pub fn matches(&self, doctype: &str, doc: &JsonDoc, ancestors: &[String]) -> bool {
        if self.doc_type != doctype {
            return false;
        }
        match self.selector.as_str() {
            "" | "id" => {
                let id = doc.id();
                self.values.iter().any(|v| v == id)
                    || ancestors.iter().any(|a| self.values.iter().any(|v| v == a))
            }
            "referenced_by" => match doc.get("referenced_by") {
                Some(serde_json::Value::Array(refs)) => refs.iter().any(|r| {
                    let typ = r.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    let id = r.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    self.values.iter().any(|v| v == &format!("{}/{}", typ, id))
                }),
                _ => false,
            },
            attribute => match doc.get(attribute) {
                Some(serde_json::Value::String(s)) => self.values.iter().any(|v| v == s),
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .any(|s| self.values.iter().any(|v| v == s)),
                _ => false,
            },
        }
    }
}
