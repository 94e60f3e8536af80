//! Content digests and the pool of hashing contexts.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Digest size in bytes (SHA-1 produces 160-bit hashes).
pub const HASH_SIZE: usize = 20;

/// Number of hex digits used for the shard bucket.
pub const PREFIX_LEN: usize = 3;

/// Hash algorithm name written to the store config.
pub const ALGORITHM: &str = "sha1-160";

/// What a digest identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// File content.
    File = 1,
    /// A directory's serialized child list.
    Directory = 2,
}

impl Kind {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Kind::File),
            2 => Ok(Kind::Directory),
            _ => Err(Error::invalid_tree_entry(format!(
                "Invalid entry kind: {}",
                value
            ))),
        }
    }

    /// The store segment holding objects of this kind (`f` or `d`).
    pub fn segment(self) -> &'static str {
        match self {
            Kind::File => "f",
            Kind::Directory => "d",
        }
    }

    /// Parse a store segment.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "f" => Some(Kind::File),
            "d" => Some(Kind::Directory),
            _ => None,
        }
    }

    /// Get the string name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::File => "file",
            Kind::Directory => "directory",
        }
    }
}

/// A 160-bit SHA-1 digest tagged with the kind of object it identifies.
///
/// Digests of different kinds never compare equal, even when the bits match.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest {
    kind: Kind,
    bytes: [u8; HASH_SIZE],
}

impl ContentDigest {
    /// Create a digest from raw bytes.
    pub fn from_bytes(kind: Kind, bytes: [u8; HASH_SIZE]) -> Self {
        Self { kind, bytes }
    }

    /// Create a digest from a hex string (40 hex characters).
    pub fn from_hex(kind: Kind, hex_str: &str) -> Result<Self> {
        if hex_str.len() != HASH_SIZE * 2 {
            return Err(Error::malformed_identifier(
                hex_str,
                format!(
                    "Expected {} hex characters, got {}",
                    HASH_SIZE * 2,
                    hex_str.len()
                ),
            ));
        }

        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| Error::malformed_identifier(hex_str, format!("Invalid hex: {}", e)))?;
        Ok(Self { kind, bytes })
    }

    /// Hash raw bytes.
    pub fn hash_bytes(kind: Kind, data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        Self {
            kind,
            bytes: digest.into(),
        }
    }

    /// Hash data from a reader with a caller-provided context.
    ///
    /// Returns the digest and the number of bytes read. The context is left
    /// reset and ready for reuse.
    pub fn hash_reader<R: Read>(
        kind: Kind,
        mut reader: R,
        hasher: &mut Sha1,
    ) -> Result<(Self, u64)> {
        Digest::reset(hasher);
        let len = std::io::copy(&mut reader, hasher)?;
        let digest = hasher.finalize_reset();
        Ok((
            Self {
                kind,
                bytes: digest.into(),
            },
            len,
        ))
    }

    /// The kind of object this digest identifies.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Convert to hex string (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// The first 3 hex digits (shard bucket).
    pub fn prefix(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(PREFIX_LEN);
        hex
    }

    /// The remaining 37 hex digits (entry name).
    pub fn suffix(&self) -> String {
        self.to_hex().split_off(PREFIX_LEN)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.bytes
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.as_str(), self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ContentDigest", 2)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("digest", &self.to_hex())?;
        state.end()
    }
}

/// A fixed-size pool of hashing contexts.
///
/// Checkout blocks (sleeping with a short, growing backoff) until a context
/// is free, so the pool size bounds how many files are hashed at once.
#[derive(Debug)]
pub struct HasherPool {
    slots: Mutex<Vec<Sha1>>,
    size: usize,
}

impl HasherPool {
    /// Create a pool with `size` contexts (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Mutex::new((0..size).map(|_| Sha1::new()).collect()),
            size,
        }
    }

    /// Number of contexts owned by the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of contexts currently checked in.
    pub fn available(&self) -> usize {
        self.slots.lock().len()
    }

    /// Take a context out of the pool, waiting for one if all are in use.
    pub fn checkout(&self) -> PooledHasher<'_> {
        let mut backoff = Duration::from_micros(50);
        loop {
            if let Some(hasher) = self.slots.lock().pop() {
                return PooledHasher {
                    pool: self,
                    hasher: Some(hasher),
                };
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(5));
        }
    }
}

/// A hashing context on loan from a [`HasherPool`]; returned on drop.
pub struct PooledHasher<'a> {
    pool: &'a HasherPool,
    hasher: Option<Sha1>,
}

impl Deref for PooledHasher<'_> {
    type Target = Sha1;

    fn deref(&self) -> &Sha1 {
        // Only taken in Drop.
        self.hasher.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledHasher<'_> {
    fn deref_mut(&mut self) -> &mut Sha1 {
        self.hasher.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledHasher<'_> {
    fn drop(&mut self) {
        if let Some(mut hasher) = self.hasher.take() {
            Digest::reset(&mut hasher);
            self.pool.slots.lock().push(hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_hash_empty() {
        let digest = ContentDigest::hash_bytes(Kind::File, b"");
        assert_eq!(digest.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_hash_hello_world() {
        let digest = ContentDigest::hash_bytes(Kind::File, b"hello world");
        assert_eq!(digest.to_hex(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn test_kind_distinguishes_digests() {
        let file = ContentDigest::hash_bytes(Kind::File, b"same");
        let dir = ContentDigest::hash_bytes(Kind::Directory, b"same");

        assert_eq!(file.as_bytes(), dir.as_bytes());
        assert_ne!(file, dir);
    }

    #[test]
    fn test_from_hex_invalid() {
        assert!(ContentDigest::from_hex(Kind::File, "abcd").is_err());
        assert!(ContentDigest::from_hex(Kind::File, "").is_err());
        assert!(ContentDigest::from_hex(Kind::File, &"z".repeat(40)).is_err());
    }

    #[test]
    fn test_prefix_suffix() {
        let digest = ContentDigest::hash_bytes(Kind::File, b"test");
        assert_eq!(digest.prefix().len(), 3);
        assert_eq!(digest.suffix().len(), 37);
        assert_eq!(
            format!("{}{}", digest.prefix(), digest.suffix()),
            digest.to_hex()
        );
    }

    #[test]
    fn test_hash_reader_matches_hash_bytes() {
        let data = vec![7u8; 100_000];
        let mut hasher = Sha1::new();

        let (digest, len) =
            ContentDigest::hash_reader(Kind::File, data.as_slice(), &mut hasher).unwrap();
        assert_eq!(len, 100_000);
        assert_eq!(digest, ContentDigest::hash_bytes(Kind::File, &data));

        // Context is reusable.
        let (again, _) =
            ContentDigest::hash_reader(Kind::File, data.as_slice(), &mut hasher).unwrap();
        assert_eq!(again, digest);
    }

    #[test]
    fn test_kind_conversions() {
        assert_eq!(Kind::from_u8(1).unwrap(), Kind::File);
        assert_eq!(Kind::from_u8(2).unwrap(), Kind::Directory);
        assert!(Kind::from_u8(3).is_err());

        assert_eq!(Kind::from_segment("f"), Some(Kind::File));
        assert_eq!(Kind::from_segment("d"), Some(Kind::Directory));
        assert_eq!(Kind::from_segment("t"), None);
    }

    #[test]
    fn test_serialize() {
        let digest = ContentDigest::hash_bytes(Kind::Directory, b"");
        let json = serde_json::to_value(digest).unwrap();
        assert_eq!(json["kind"], "directory");
        assert_eq!(json["digest"], "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_pool_returns_contexts() {
        let pool = HasherPool::new(2);
        {
            let _a = pool.checkout();
            let _b = pool.checkout();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_checkout_waits_for_release() {
        let pool = Arc::new(HasherPool::new(1));
        let held = pool.checkout();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let mut hasher = pool.checkout();
                ContentDigest::hash_reader(Kind::File, &b"x"[..], &mut hasher)
                    .unwrap()
                    .0
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(held);

        let digest = waiter.join().unwrap();
        assert_eq!(digest, ContentDigest::hash_bytes(Kind::File, b"x"));
        assert_eq!(pool.available(), 1);
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Hashing the same data always produces the same digest
        #[test]
        fn prop_hash_deterministic(data: Vec<u8>) {
            let a = ContentDigest::hash_bytes(Kind::File, &data);
            let b = ContentDigest::hash_bytes(Kind::File, &data);
            prop_assert_eq!(a, b);
        }

        /// Prefix and suffix reconstruct the full hex and parse back
        #[test]
        fn prop_hex_roundtrip(bytes in prop::array::uniform20(any::<u8>())) {
            let digest = ContentDigest::from_bytes(Kind::Directory, bytes);
            let joined = format!("{}{}", digest.prefix(), digest.suffix());
            prop_assert_eq!(&joined, &digest.to_hex());
            prop_assert_eq!(ContentDigest::from_hex(Kind::Directory, &joined)?, digest);
        }

        /// Invalid hex length always fails
        #[test]
        fn prop_invalid_hex_length_fails(s in "[0-9a-f]{0,39}|[0-9a-f]{41,80}") {
            prop_assert!(ContentDigest::from_hex(Kind::File, &s).is_err());
        }
    }
}
