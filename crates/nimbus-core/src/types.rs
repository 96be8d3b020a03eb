//! Shared identifiers and the generic JSON document wrapper.
//!
//! Documents move between instances as plain JSON objects; the typed layers
//! (files, sharings) are views over them. This module owns the doctype names
//! and the small helpers every layer uses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known doctype names.
pub mod consts {
    /// Files and directories of the virtual filesystem.
    pub const FILES: &str = "io.cozy.files";
    /// Per-document sharing bookkeeping (the shared log).
    pub const SHARED: &str = "io.cozy.shared";
    /// Sharing descriptors.
    pub const SHARINGS: &str = "io.cozy.sharings";
    /// Replication checkpoints, one record per sharing.
    pub const SEQUENCES: &str = "io.cozy.sharings.sequences";
}

/// A JSON document as stored in the document database.
///
/// The wrapper keeps the raw object intact (unknown fields included, since
/// peers may run newer versions) and exposes the `_id`/`_rev` bookkeeping
/// fields through accessors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonDoc(pub Map<String, Value>);

impl JsonDoc {
    /// Create an empty document with the given identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("_id".to_string(), Value::String(id.into()));
        Self(map)
    }

    /// Document identifier, or `""` when unset.
    pub fn id(&self) -> &str {
        self.get_str("_id").unwrap_or("")
    }

    /// Current revision, or `None` for a document never stored.
    pub fn rev(&self) -> Option<&str> {
        self.get_str("_rev")
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("_id".to_string(), Value::String(id.into()));
    }

    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.0.insert("_rev".to_string(), Value::String(rev.into()));
    }

    /// Whether the document carries a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self.0.get("_deleted"), Some(Value::Bool(true)))
    }

    pub fn mark_deleted(&mut self) {
        self.0.insert("_deleted".to_string(), Value::Bool(true));
    }

    /// Fetch a top-level string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Fetch an arbitrary top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Build from any serializable value. Fails if it is not a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(serde::ser::Error::custom(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Deserialize into a typed view.
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key of a shared-log record: `"<doctype>/<docid>"`.
pub fn shared_id(doctype: &str, id: &str) -> String {
    format!("{}/{}", doctype, id)
}

/// Split a shared-log key back into `(doctype, docid)`.
///
/// Doctypes never contain `/`, so the first separator is the boundary.
pub fn split_shared_id(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

/// Random lowercase-hex string of `2 * n` characters.
///
/// Used for sharing states, access tokens, and upload keys.
///
/// # Panics
/// Panics if the system random number generator fails (extremely rare).
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    getrandom::getrandom(&mut bytes).expect("RNG failed - system entropy source unavailable");
    hex::encode(bytes)
}
