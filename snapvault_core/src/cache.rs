//! File digests with a sidecar cache.
//!
//! Large files carry their last computed digest in an extended attribute,
//! together with the size and modification time it was computed for. The
//! record is only trusted while both still match; anything else (absent,
//! stale, truncated, unsupported filesystem) falls back to hashing. Writing
//! the record is best-effort and never changes the file's modification time.

use crate::error::{Error, Result};
use crate::hash::{ContentDigest, HASH_SIZE, Kind};
use filetime::FileTime;
use sha1::Sha1;
use std::fs;
use std::path::Path;
use tracing::{debug, trace};

/// Extended attribute holding the cache record.
pub const XATTR_NAME: &str = "user.snapvault.digest";

/// Encoded record size: mtime (8) + length (8) + digest (20).
pub const RECORD_SIZE: usize = 16 + HASH_SIZE;

/// Files of at least this many bytes use the cache by default.
pub const DEFAULT_CACHE_THRESHOLD: u64 = 1024 * 1024;

/// A persisted (mtime, length, digest) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRecord {
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_nanos: i64,
    /// File length in bytes.
    pub len: u64,
    /// File content digest.
    pub digest: [u8; HASH_SIZE],
}

impl CacheRecord {
    /// Encode the record (little-endian integers).
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.mtime_nanos.to_le_bytes());
        buf[8..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16..].copy_from_slice(&self.digest);
        buf
    }

    /// Decode a record; anything of the wrong size is a miss.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != RECORD_SIZE {
            return None;
        }

        let mtime_nanos = i64::from_le_bytes(buf[0..8].try_into().ok()?);
        let len = u64::from_le_bytes(buf[8..16].try_into().ok()?);
        let digest = buf[16..].try_into().ok()?;
        Some(Self {
            mtime_nanos,
            len,
            digest,
        })
    }

    /// Whether the record describes a file with this metadata.
    pub fn matches(&self, metadata: &fs::Metadata) -> bool {
        self.len == metadata.len() && self.mtime_nanos == mtime_nanos(metadata)
    }
}

/// Modification time of `metadata` in nanoseconds since the Unix epoch.
pub fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
    let mtime = FileTime::from_last_modification_time(metadata);
    mtime
        .unix_seconds()
        .saturating_mul(1_000_000_000)
        .saturating_add(i64::from(mtime.nanoseconds()))
}

/// Outcome of digesting one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDigest {
    pub digest: ContentDigest,
    pub len: u64,
    pub cache_hit: bool,
    pub bytes_hashed: u64,
}

/// Computes file digests, consulting the sidecar cache for large files.
#[derive(Debug, Clone, Copy)]
pub struct DigestCache {
    threshold: Option<u64>,
}

impl Default for DigestCache {
    fn default() -> Self {
        Self::new(Some(DEFAULT_CACHE_THRESHOLD))
    }
}

impl DigestCache {
    /// Use the cache for files of at least `threshold` bytes; `None` disables it.
    pub fn new(threshold: Option<u64>) -> Self {
        Self { threshold }
    }

    /// A cache that always hashes.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// The configured threshold.
    pub fn threshold(&self) -> Option<u64> {
        self.threshold
    }

    fn applies_to(&self, len: u64) -> bool {
        self.threshold.is_some_and(|t| len >= t)
    }

    /// Digest the file at `path` using the supplied hashing context.
    pub fn digest_file(&self, path: &Path, hasher: &mut Sha1) -> Result<FileDigest> {
        let before = fs::metadata(path).map_err(|e| Error::source_access(path, e))?;
        let cached = self.applies_to(before.len());

        if cached && let Some(record) = read_record(path) {
            if record.matches(&before) {
                trace!("Digest cache hit for {}", path.display());
                return Ok(FileDigest {
                    digest: ContentDigest::from_bytes(Kind::File, record.digest),
                    len: before.len(),
                    cache_hit: true,
                    bytes_hashed: 0,
                });
            }
            debug!("Stale digest cache record for {}", path.display());
        }

        let file = fs::File::open(path).map_err(|e| Error::source_access(path, e))?;
        let (digest, bytes_hashed) =
            ContentDigest::hash_reader(Kind::File, file, hasher).map_err(|e| match e {
                Error::Io { source } => Error::source_access(path, source),
                other => other,
            })?;

        if cached {
            // Only persist if the file did not change underneath the hash.
            match fs::metadata(path) {
                Ok(after) if after.len() == before.len() && same_mtime(&before, &after) => {
                    let record = CacheRecord {
                        mtime_nanos: mtime_nanos(&before),
                        len: before.len(),
                        digest: *digest.as_bytes(),
                    };
                    write_record(path, &record, &before);
                }
                _ => debug!("{} changed while hashing; not caching", path.display()),
            }
        }

        Ok(FileDigest {
            digest,
            len: bytes_hashed,
            cache_hit: false,
            bytes_hashed,
        })
    }
}

fn same_mtime(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    mtime_nanos(a) == mtime_nanos(b)
}

/// Read the cache record of `path`, if any readable one exists.
pub fn read_record(path: &Path) -> Option<CacheRecord> {
    match xattr::get(path, XATTR_NAME) {
        Ok(Some(buf)) => CacheRecord::decode(&buf),
        Ok(None) => None,
        Err(e) => {
            trace!("Cannot read digest cache of {}: {}", path.display(), e);
            None
        }
    }
}

/// Persist a record, restoring the modification time if the write moved it.
fn write_record(path: &Path, record: &CacheRecord, before: &fs::Metadata) {
    if let Err(e) = xattr::set(path, XATTR_NAME, &record.encode()) {
        trace!("Cannot write digest cache of {}: {}", path.display(), e);
        return;
    }

    if let Ok(after) = fs::metadata(path)
        && !same_mtime(before, &after)
    {
        let mtime = FileTime::from_last_modification_time(before);
        if let Err(e) = filetime::set_file_mtime(path, mtime) {
            debug!("Cannot restore mtime of {}: {}", path.display(), e);
        }
    }
}
