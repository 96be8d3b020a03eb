//! Core types for the Nimbus sharing engine.
//!
//! This crate holds everything the storage and sharing layers agree on:
//! document identifiers and doctype names, revision parsing and the revision
//! tree, the XOR identifier pad, the error taxonomy, the configuration layer,
//! and the payload types of the peer-to-peer protocol.

pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod revision;
pub mod rules;
pub mod types;
pub mod xor;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, Result};
pub use revision::{ConflictKind, RevChain, RevTree, Revision};
pub use rules::{Rule, ScopePolicy};
pub use types::{consts, random_hex, JsonDoc};
pub use xor::XorKey;
