use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for task names.
pub type ArcStr = std::sync::Arc<str>;

/// A single field value yielded by a task body or used as a parameter.
///
/// This is the CBOR data model, so anything `serde` can describe fits in it,
/// and it round-trips through the on-disk format without loss.
pub type Value = ciborium::Value;

/// One incremental result: a mapping from field names to values.
pub type Record = BTreeMap<String, Value>;

/// A 32-byte BLAKE3 hash used as a parameter fingerprint.
///
/// In `stratum` this serves two purposes:
/// 1. It distinguishes the instances of a task family, so that two parameter
///    sets that are equal produce the same identity.
/// 2. It names the on-disk partition an instance writes its records into.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            // writing into a String cannot fail
            let _ = write!(acc, "{byte:02x}");
        }

        acc
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Hash32(bytes))
    }

    /// Short prefix for log lines and labels.
    pub fn short(self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"power=2");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert_eq!(Hash32::from_hex("abc"), None);
        assert_eq!(Hash32::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(Hash32::hash("a"), Hash32::hash("a"));
        assert_ne!(Hash32::hash("a"), Hash32::hash("b"));
    }
}
