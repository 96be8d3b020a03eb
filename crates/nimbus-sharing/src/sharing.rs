//! The sharing document.
//!
//! A sharing owns its members and their credentials as same-length arrays
//! indexed by position: `members[0]` is the owner and `credentials[i-1]`
//! belongs to `members[i]` on the owner's instance. A recipient keeps a
//! single credentials entry, the one for its link back to the owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nimbus_core::protocol::{CreateSharingRequest, Member, MemberStatus};
use nimbus_core::rules::Rule;
use nimbus_core::types::consts;
use nimbus_core::{random_hex, Error, JsonDoc, Result, XorKey};

use crate::checkpoint::Direction;
use crate::store::DocumentStore;

/// Credentials for one link of a sharing.
///
/// The `xor_key` is the per-link pad applied to file identifiers crossing
/// this link; it lives here and nowhere else.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub state: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub xor_key: XorKey,
    /// OAuth client this instance registered on the peer.
    #[serde(default)]
    pub client_id: String,
    /// OAuth client the peer registered here.
    #[serde(default)]
    pub inbound_client_id: String,
}

impl Credentials {
    /// Fresh credentials for a new link: a state, a pad, no tokens yet.
    pub fn generate() -> Self {
        Self {
            state: random_hex(16),
            access_token: String::new(),
            refresh_token: String::new(),
            xor_key: XorKey::generate(),
            client_id: String::new(),
            inbound_client_id: String::new(),
        }
    }

    /// Whether this link can authenticate against the peer.
    pub fn usable(&self) -> bool {
        !self.access_token.is_empty()
    }
}

/// A sharing descriptor, as persisted in `io.cozy.sharings`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sharing {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Whether this instance created the sharing.
    pub owner: bool,
    pub active: bool,
    #[serde(default)]
    pub read_only: bool,
    /// All members, owner first.
    pub members: Vec<Member>,
    /// Owner: one entry per recipient. Recipient: one entry, for the owner.
    #[serde(default)]
    pub credentials: Vec<Credentials>,
    pub rules: Vec<Rule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sharing {
    /// Build an owner-side sharing with fresh per-member credentials.
    pub fn create(
        description: impl Into<String>,
        owner: Member,
        recipients: Vec<Member>,
        rules: Vec<Rule>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let credentials = recipients.iter().map(|_| Credentials::generate()).collect();
        let mut members = vec![owner];
        members.extend(recipients);
        let sharing = Self {
            id: random_hex(16),
            rev: None,
            description: description.into(),
            owner: true,
            active: true,
            read_only: false,
            members,
            credentials,
            rules,
            created_at: now,
            updated_at: now,
        };
        sharing.validate()?;
        Ok(sharing)
    }

    /// Build the recipient-side sharing from a create request.
    pub fn from_request(sid: &str, req: &CreateSharingRequest, now: DateTime<Utc>) -> Result<Self> {
        let sharing = Self {
            id: sid.to_string(),
            rev: None,
            description: req.description.clone(),
            owner: false,
            active: false,
            read_only: false,
            members: req.members.clone(),
            credentials: vec![Credentials {
                state: req.state.clone(),
                access_token: String::new(),
                refresh_token: String::new(),
                xor_key: req.xor_key.clone(),
                client_id: String::new(),
                inbound_client_id: String::new(),
            }],
            rules: req.rules.clone(),
            created_at: now,
            updated_at: now,
        };
        sharing.validate()?;
        Ok(sharing)
    }

    /// Check the structural invariants of the document.
    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() || self.rules.is_empty() {
            return Err(Error::InvalidSharing);
        }
        if !self.rules.iter().all(Rule::validate) {
            return Err(Error::InvalidSharing);
        }
        if self.owner && self.credentials.len() != self.members.len() - 1 {
            return Err(Error::InvalidSharing);
        }
        if !self.owner && self.credentials.len() != 1 {
            return Err(Error::InvalidSharing);
        }
        Ok(())
    }

    /// Indexes of the members this instance replicates to.
    ///
    /// The owner talks to every ready recipient; a recipient talks to the
    /// owner only, and not at all when the sharing is read-only.
    pub fn peer_members(&self) -> Vec<usize> {
        if self.owner {
            self.members
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, m)| m.status == MemberStatus::Ready)
                .map(|(i, _)| i)
                .collect()
        } else if self.active && !self.read_only {
            vec![0]
        } else {
            Vec::new()
        }
    }

    /// Credentials of the link to the given member.
    pub fn credentials_for(&self, member_index: usize) -> Option<&Credentials> {
        if self.owner {
            member_index
                .checked_sub(1)
                .and_then(|i| self.credentials.get(i))
        } else if member_index == 0 {
            self.credentials.first()
        } else {
            None
        }
    }

    pub fn credentials_for_mut(&mut self, member_index: usize) -> Option<&mut Credentials> {
        if self.owner {
            member_index
                .checked_sub(1)
                .and_then(move |i| self.credentials.get_mut(i))
        } else if member_index == 0 {
            self.credentials.first_mut()
        } else {
            None
        }
    }

    /// The pad of the link to the given member, if credentials exist.
    pub fn xor_key_for(&self, member_index: usize) -> Option<&XorKey> {
        self.credentials_for(member_index).map(|c| &c.xor_key)
    }

    /// Find the member whose answer carries the given state.
    pub fn member_index_by_state(&self, state: &str) -> Option<usize> {
        if self.owner {
            self.credentials
                .iter()
                .position(|c| c.state == state)
                .map(|i| i + 1)
        } else {
            self.credentials
                .first()
                .filter(|c| c.state == state)
                .map(|_| 0)
        }
    }

    /// First rule matching the document, with its index.
    pub fn matching_rule(
        &self,
        doctype: &str,
        doc: &JsonDoc,
        ancestors: &[String],
    ) -> Option<(usize, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(doctype, doc, ancestors))
    }

    /// Whether any rule covers the given doctype at all.
    pub fn covers_doctype(&self, doctype: &str) -> bool {
        self.rules.iter().any(|rule| rule.doc_type == doctype)
    }

    /// Name of the advisory lock serializing one direction of this sharing.
    pub fn lock_name(&self, domain: &str, direction: Direction) -> String {
        format!("{}/sharings/{}/{}", domain, self.id, direction.as_str())
    }

    /// Load a sharing from the document store.
    pub async fn load(store: &dyn DocumentStore, sid: &str) -> Result<Self> {
        let doc = store.get(consts::SHARINGS, sid).await?;
        doc.deserialize().map_err(Error::from)
    }

    /// Persist this sharing, updating `rev` in place.
    pub async fn save(&mut self, store: &dyn DocumentStore) -> Result<()> {
        let doc = JsonDoc::from_serialize(self)?;
        let rev = store.put(consts::SHARINGS, doc).await?;
        self.rev = Some(rev);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn sharing() -> Sharing {
        let owner = Member {
            instance: "https://alice.example.net".to_string(),
            public_name: "Alice".to_string(),
            email: String::new(),
            status: MemberStatus::Ready,
        };
        let bob = Member::new("https://bob.example.net", "Bob");
        Sharing::create(
            "Notes",
            owner,
            vec![bob],
            vec![Rule::by_ids("notes", vec!["n1".to_string()])],
            now(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_invariants() {
        let s = sharing();
        assert!(s.owner);
        assert_eq!(s.members.len(), 2);
        assert_eq!(s.credentials.len(), 1);
        assert!(!s.credentials[0].state.is_empty());
        assert!(!s.credentials[0].usable());
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let mut s = sharing();
        s.rules.clear();
        assert!(matches!(s.validate(), Err(Error::InvalidSharing)));

        let mut s = sharing();
        s.credentials.clear();
        assert!(matches!(s.validate(), Err(Error::InvalidSharing)));
    }

    #[test]
    fn test_credentials_indexing() {
        let s = sharing();
        assert!(s.credentials_for(0).is_none(), "owner has no link to itself");
        assert!(s.credentials_for(1).is_some());
        assert!(s.credentials_for(2).is_none());

        let state = s.credentials[0].state.clone();
        assert_eq!(s.member_index_by_state(&state), Some(1));
        assert_eq!(s.member_index_by_state("nope"), None);
    }

    #[test]
    fn test_peer_members() {
        let mut s = sharing();
        assert!(s.peer_members().is_empty(), "pending members are skipped");
        s.members[1].status = MemberStatus::Ready;
        assert_eq!(s.peer_members(), vec![1]);
    }

    #[test]
    fn test_recipient_side_from_request() {
        let s = sharing();
        let req = CreateSharingRequest {
            description: s.description.clone(),
            members: s.members.clone(),
            rules: s.rules.clone(),
            state: s.credentials[0].state.clone(),
            xor_key: s.credentials[0].xor_key.clone(),
        };
        let r = Sharing::from_request(&s.id, &req, now()).unwrap();
        assert!(!r.owner);
        assert!(!r.active);
        assert_eq!(r.credentials.len(), 1);
        assert_eq!(r.credentials[0].xor_key, s.credentials[0].xor_key);
        assert_eq!(r.peer_members(), Vec::<usize>::new());

        // An accepted recipient replicates to the owner, unless read-only.
        let mut accepted = r.clone();
        accepted.active = true;
        assert_eq!(accepted.peer_members(), vec![0]);
        accepted.read_only = true;
        assert!(accepted.peer_members().is_empty());
    }

    #[test]
    fn test_lock_name() {
        let s = sharing();
        assert_eq!(
            s.lock_name("alice.example.net", Direction::Replicate),
            format!("alice.example.net/sharings/{}/replicate", s.id)
        );
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::new();
        let mut s = sharing();
        s.save(&store).await.unwrap();
        assert!(s.rev.is_some());

        let loaded = Sharing::load(&store, &s.id).await.unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.members.len(), 2);
        assert_eq!(loaded.credentials[0].xor_key, s.credentials[0].xor_key);
    }
}
