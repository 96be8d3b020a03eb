//! XOR identifier pad.
//!
//! Each member of a sharing gets a random pad. File identifiers crossing the
//! link to that member are passed nibble-wise through the pad, so a peer
//! cannot correlate the same file across two sharings. The transform is an
//! involution: applying it twice restores the original identifier.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Length of a generated pad, in bytes.
pub const XOR_KEY_LEN: usize = 16;

/// A per-member identifier pad.
///
/// Serialized as a lowercase hex string, which is how it travels inside the
/// answer payload.
#[derive(Clone, PartialEq, Eq)]
pub struct XorKey(Vec<u8>);

impl XorKey {
    /// Generate a fresh random pad.
    ///
    /// # Panics
    /// Panics if the system random number generator fails (extremely rare).
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; XOR_KEY_LEN];
        getrandom::getrandom(&mut bytes)
            .expect("RNG failed - system entropy source unavailable");
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Apply the pad to an identifier.
    ///
    /// Hex digits are mapped through the pad (low nibble, indexed by byte
    /// position); every other character passes through untouched, so
    /// separators in composite identifiers survive.
    pub fn apply(&self, id: &str) -> String {
        if self.0.is_empty() {
            return id.to_string();
        }
        let mut buf = id.as_bytes().to_vec();
        for (i, c) in buf.iter_mut().enumerate() {
            let nibble = match *c {
                b'0'..=b'9' => *c - b'0',
                b'a'..=b'f' => *c - b'a' + 10,
                _ => continue,
            };
            let x = nibble ^ (self.0[i % self.0.len()] & 0xf);
            *c = if x < 10 { x + b'0' } else { x - 10 + b'a' };
        }
        // All bytes stay in the ASCII hex alphabet.
        String::from_utf8(buf).expect("xor keeps identifiers ASCII")
    }
}

impl fmt::Debug for XorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The pad is a credential: keep it out of logs.
        write!(f, "XorKey(…)")
    }
}

impl Serialize for XorKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for XorKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;
        impl Visitor<'_> for HexVisitor {
            type Value = XorKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hex-encoded xor key")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<XorKey, E> {
                hex::decode(v)
                    .map(XorKey::from_bytes)
                    .map_err(|e| E::custom(format!("invalid xor key: {}", e)))
            }
        }
        deserializer.deserialize_str(HexVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_involution() {
        let key = XorKey::generate();
        let id = "4ab07f1d9c02-33d5";
        let once = key.apply(id);
        assert_ne!(once, id);
        assert_eq!(key.apply(&once), id);
    }

    #[test]
    fn test_non_hex_chars_pass_through() {
        let key = XorKey::from_bytes(vec![0xff; 4]);
        let out = key.apply("xyz-_9");
        // Only '9' is a hex digit here; the rest survives as-is.
        assert_eq!(&out[..5], "xyz-_");
        assert_ne!(out.chars().last(), Some('9'));
    }

    #[test]
    fn test_empty_key_is_identity() {
        let key = XorKey::from_bytes(Vec::new());
        assert_eq!(key.apply("abc123"), "abc123");
    }

    #[test]
    fn test_keys_do_not_collide() {
        let a = XorKey::generate();
        let b = XorKey::generate();
        assert_ne!(a.apply("deadbeef"), b.apply("deadbeef"));
    }

    #[test]
    fn test_serde_round_trip() {
        let key = XorKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        let back: XorKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
