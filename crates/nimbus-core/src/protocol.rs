//! Wire payloads of the peer-to-peer sharing protocol.
//!
//! Every body exchanged between instances is defined here. The transport is
//! plain HTTPS + JSON; the routes are:
//!
//! - `PUT    /sharings/{sid}` - create-sharing request
//! - `POST   /sharings/{sid}/answer` - recipient returns credentials
//! - `POST   /sharings/{sid}/revs_diff` - which revisions is the peer missing
//! - `POST   /sharings/{sid}/bulk_docs` - bulk document apply
//! - `PUT    /sharings/{sid}/io.cozy.files/{xoredId}/metadata` - file metadata sync
//! - `PUT    /sharings/{sid}/io.cozy.files/{key}` - raw file body upload
//! - `DELETE /sharings/{sid}` and `DELETE /sharings/{sid}/recipients/{id}` - revoke
//!
//! Identifiers inside file payloads are XORed with the recipient's pad
//! before serialization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::revision::RevChain;
use crate::rules::Rule;
use crate::types::JsonDoc;
use crate::xor::XorKey;

// === Members ===

/// Lifecycle state of a sharing member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberStatus {
    Pending,
    MailSent,
    Ready,
    Revoked,
    Refused,
    /// Replication to this member failed terminally; surfaced to the UI.
    Errored,
}

/// One instance participating in a sharing. `members[0]` is the owner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Base URL of the member's instance.
    pub instance: String,
    #[serde(default)]
    pub public_name: String,
    #[serde(default)]
    pub email: String,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(instance: impl Into<String>, public_name: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            public_name: public_name.into(),
            email: String::new(),
            status: MemberStatus::Pending,
        }
    }
}

// === Sharing lifecycle ===

/// Body of `PUT /sharings/{sid}`.
///
/// File identifiers inside `rules` are already XORed with `xor_key`: the
/// pad is generated per member at creation and shared by both directions
/// of the link.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSharingRequest {
    #[serde(default)]
    pub description: String,
    /// All members, owner first.
    pub members: Vec<Member>,
    pub rules: Vec<Rule>,
    /// Opaque state the recipient echoes back in its answer.
    pub state: String,
    /// The identifier pad for this link.
    pub xor_key: XorKey,
}

/// Body of `POST /sharings/{sid}/answer`: the credentials a recipient hands
/// back once it accepts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub state: String,
    pub access_token: String,
    pub refresh_token: String,
    pub xor_key: XorKey,
}

// === Replication ===

/// The revisions this instance knows for one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRevisions {
    pub doc_type: String,
    pub id: String,
    /// Newest first.
    pub revisions: Vec<String>,
}

/// Body of `POST /sharings/{sid}/revs_diff`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevsDiffRequest {
    pub docs: Vec<DocRevisions>,
}

/// Reply to `revs_diff`: revisions the peer is missing, keyed by
/// `"<doctype>/<docid>"`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevsDiffResponse {
    pub missing: HashMap<String, Vec<String>>,
}

impl RevsDiffResponse {
    /// Whether the peer misses nothing at all.
    pub fn is_empty(&self) -> bool {
        self.missing.values().all(|revs| revs.is_empty())
    }
}

/// One document in a bulk update: the JSON body at its newest revision plus
/// the compressed chain leading to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    pub doc_type: String,
    pub doc: JsonDoc,
    pub revisions: RevChain,
}

/// Body of `POST /sharings/{sid}/bulk_docs`. The reply is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    pub docs: Vec<DocumentPayload>,
}

// === File synchronization ===

/// Body of `PUT /sharings/{sid}/io.cozy.files/{xoredId}/metadata`.
///
/// The revision chain rides along here: the content route carries raw bytes
/// and has no place for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataPayload {
    /// The file document, identifiers already XORed for the recipient.
    pub file: JsonDoc,
    pub revisions: RevChain,
}

/// `200` reply to the metadata route when content must follow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadKeyResponse {
    pub key: String,
}

/// Receiver decision after a metadata sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataOutcome {
    /// Content already matches; the metadata was applied. Maps to `204`.
    InSync,
    /// The peer must PUT the file body under this key. Maps to `200 {key}`.
    NeedsContent(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_member_status_wire_names() {
        let status = serde_json::to_value(MemberStatus::MailSent).unwrap();
        assert_eq!(status, json!("mail-sent"));
        let back: MemberStatus = serde_json::from_value(json!("ready")).unwrap();
        assert_eq!(back, MemberStatus::Ready);
    }

    #[test]
    fn test_answer_payload_round_trip() {
        let payload = AnswerPayload {
            state: "st4te".to_string(),
            access_token: "acc".to_string(),
            refresh_token: "ref".to_string(),
            xor_key: XorKey::from_bytes(vec![1, 2, 3, 4]),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["accessToken"], "acc");
        assert_eq!(json["xorKey"], "01020304");

        let back: AnswerPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.xor_key, payload.xor_key);
    }

    #[test]
    fn test_revs_diff_response_empty() {
        let mut response = RevsDiffResponse::default();
        assert!(response.is_empty());
        response.missing.insert("notes/n1".to_string(), Vec::new());
        assert!(response.is_empty());
        response
            .missing
            .insert("notes/n2".to_string(), vec!["2-bbb".to_string()]);
        assert!(!response.is_empty());
    }

    #[test]
    fn test_bulk_docs_shape() {
        let request = BulkDocsRequest {
            docs: vec![DocumentPayload {
                doc_type: "notes".to_string(),
                doc: JsonDoc::with_id("n1"),
                revisions: RevChain::single("1-aaa").unwrap(),
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json["docs"].is_array());
        assert_eq!(json["docs"][0]["docType"], "notes");
        assert_eq!(json["docs"][0]["revisions"]["start"], 1);
    }
}
