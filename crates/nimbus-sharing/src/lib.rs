//! Cross-instance document sharing for Nimbus.
//!
//! A sharing names a set of rules under which documents (including opaque
//! binary files) flow between a designated owner instance and one or more
//! member instances. This crate holds the whole engine:
//!
//! - the shared-log tracker projecting local writes onto a resumable
//!   change log (`io.cozy.shared`)
//! - the replicator exchanging revision diffs and bulk updates with peers
//! - the two-phase file uploader for binary content
//! - the locking model guaranteeing at-most-one replication per
//!   (sharing, direction)
//! - the sharing lifecycle (create, answer, initial copy, revoke)
//!
//! Storage backends, HTTP routing, and authentication stay behind the
//! [`store::DocumentStore`], [`lock::KvCache`], and [`peer::PeerClient`]
//! seams.

pub mod apply;
pub mod checkpoint;
pub mod context;
pub mod lock;
pub mod orchestrator;
pub mod peer;
pub mod replicator;
pub mod shared;
pub mod sharing;
pub mod store;
pub mod trigger;
pub mod upload;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::Context;
pub use sharing::{Credentials, Sharing};

// The rule types live next to the wire payloads they travel in.
pub use nimbus_core::protocol::{Member, MemberStatus};
pub use nimbus_core::rules::{Rule, ScopePolicy};
