use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `tsumiki`, this serves two primary purposes:
/// 1. It fingerprints task arguments and outputs, so that a dependent task
///    can tell whether the output it observed last time is still the same.
/// 2. It names persisted trace records on disk, one file per task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
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

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First eight hex characters, enough to tell hashes apart in logs.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
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

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn update(&mut self, bytes: &[u8]) -> &mut Self {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// A serialized task argument or output.
///
/// Every task kind has its own Rust types for arguments and outputs, but the
/// engine only ever sees them as canonical CBOR bytes paired with their
/// BLAKE3 fingerprint. Two payloads are equal exactly when their bytes are
/// equal, so a payload can stand in for the value as a cache key.
///
/// Encoding is deterministic for structs, enums, sequences and `BTreeMap`s.
/// Arguments containing a `HashMap` do not have a stable byte form and should
/// not be used as task arguments.
#[derive(Clone, Serialize, Deserialize)]
pub struct Payload {
    bytes: Arc<[u8]>,
    hash: Hash32,
}

impl Payload {
    /// Serializes `value` into a payload.
    pub fn encode<T>(value: &T) -> Result<Self, PayloadError>
    where
        T: Serialize + ?Sized,
    {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| PayloadError::Encode(e.to_string()))?;

        Ok(Self::from_bytes(bytes))
    }

    /// Deserializes the payload back into a concrete value.
    pub fn decode<T>(&self) -> Result<T, PayloadError>
    where
        T: DeserializeOwned,
    {
        ciborium::from_reader(self.bytes.as_ref()).map_err(|e| PayloadError::Decode {
            target: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let hash = Hash32::hash(&bytes);
        Self { bytes, hash }
    }

    /// The fingerprint of the encoded value.
    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Recomputes the fingerprint and compares it with the stored one. Used
    /// when a payload was read back from disk.
    pub(crate) fn is_intact(&self) -> bool {
        Hash32::hash(&self.bytes) == self.hash
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for Payload {}

impl std::hash::Hash for Payload {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({}, {} bytes)", self.hash.short(), self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_hex() {
        let hash = Hash32::from([0xABu8; 32]);
        assert_eq!(hash.to_hex(), "ab".repeat(32));
        assert_eq!(hash.short(), "abababab");
    }

    #[test]
    fn test_payload_structural_equality() {
        let a = Payload::encode(&("square", 4u32)).unwrap();
        let b = Payload::encode(&("square", 4u32)).unwrap();
        let c = Payload::encode(&("square", 5u32)).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, c);
    }

    #[test]
    fn test_payload_decode() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), vec![1u8, 2]);
        map.insert("a".to_string(), vec![3u8]);

        let payload = Payload::encode(&map).unwrap();
        let back: BTreeMap<String, Vec<u8>> = payload.decode().unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_payload_decode_wrong_shape() {
        let payload = Payload::encode("text").unwrap();
        let err = payload.decode::<u64>().unwrap_err();
        assert!(matches!(err, PayloadError::Decode { .. }));
    }

    #[test]
    fn test_hasher_length_prefix() {
        let mut a = Blake3Hasher::default();
        a.update(b"ab").update(b"c");
        let mut b = Blake3Hasher::default();
        b.update(b"a").update(b"bc");

        assert_ne!(Hash32::from(a), Hash32::from(b));
    }
}
