//! Directory objects: child entries, canonical encoding and Merkle digests.

use crate::error::{Error, Result};
use crate::hash::{ContentDigest, Kind};
use std::ffi::{OsStr, OsString};

/// Longest child name accepted (bytes).
pub const MAX_NAME_LEN: usize = 255;

/// A child of a directory object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name of the child within its parent.
    pub name: OsString,
    /// Digest of the child; carries the child's kind.
    pub digest: ContentDigest,
}

impl DirEntry {
    /// Create a new entry, validating the name.
    pub fn new(name: impl Into<OsString>, digest: ContentDigest) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, digest })
    }

    /// Kind of the child.
    pub fn kind(&self) -> Kind {
        self.digest.kind()
    }

    /// Encode the entry to bytes.
    ///
    /// Format:
    /// - 1 byte: kind (1=file, 2=directory)
    /// - 20 bytes: digest
    /// - 1 byte: name_len
    /// - N bytes: name
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_encoded_bytes();
        let mut buf = Vec::with_capacity(22 + name.len());
        buf.push(self.kind().to_u8());
        buf.extend_from_slice(self.digest.as_bytes());
        // validate_name caps the length at 255
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf
    }
}

impl PartialOrd for DirEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DirEntry {
    /// Compare by name (bytewise) for canonical ordering.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name
            .as_encoded_bytes()
            .cmp(other.name.as_encoded_bytes())
    }
}

/// Check that a name can be a single path component in the store.
pub fn validate_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_encoded_bytes();

    if bytes.is_empty() {
        return Err(Error::invalid_tree_entry("Name cannot be empty"));
    }

    if bytes.len() > MAX_NAME_LEN {
        return Err(Error::invalid_tree_entry(format!(
            "Name too long: {} bytes (max {})",
            bytes.len(),
            MAX_NAME_LEN
        )));
    }

    if bytes.contains(&0) {
        return Err(Error::invalid_tree_entry("Name cannot contain null bytes"));
    }

    if bytes.contains(&b'/') || (cfg!(windows) && bytes.contains(&b'\\')) {
        return Err(Error::invalid_tree_entry(format!(
            "Name cannot contain a path separator: {}",
            name.to_string_lossy()
        )));
    }

    if bytes == b"." || bytes == b".." {
        return Err(Error::invalid_tree_entry("Name cannot be . or .."));
    }

    Ok(())
}

/// Encode a list of entries in canonical (sorted by name) order.
pub fn encode_tree(entries: &mut [DirEntry]) -> Vec<u8> {
    entries.sort();

    let mut buf = Vec::new();
    for entry in entries.iter() {
        buf.extend_from_slice(&entry.encode());
    }
    buf
}

/// The Merkle digest of a directory: the hash of its serialized child list.
///
/// Sorts `entries` in place as a side effect.
pub fn directory_digest(entries: &mut [DirEntry]) -> ContentDigest {
    ContentDigest::hash_bytes(Kind::Directory, &encode_tree(entries))
}

/// A fully resolved node produced by the snapshot walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashEntry {
    /// A file and its length.
    File { digest: ContentDigest, len: u64 },
    /// A directory and its sorted children.
    Directory {
        digest: ContentDigest,
        children: Vec<DirEntry>,
    },
}

impl HashEntry {
    /// Build a directory node, sorting the children and computing the digest.
    pub fn directory(mut children: Vec<DirEntry>) -> Self {
        let digest = directory_digest(&mut children);
        HashEntry::Directory { digest, children }
    }

    /// Digest of the node.
    pub fn digest(&self) -> ContentDigest {
        match self {
            HashEntry::File { digest, .. } | HashEntry::Directory { digest, .. } => *digest,
        }
    }
}

/// A reference recovered by parsing a link target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveLinkRef {
    pub digest: ContentDigest,
    pub kind: Kind,
}

impl From<ContentDigest> for LiveLinkRef {
    fn from(digest: ContentDigest) -> Self {
        Self {
            digest,
            kind: digest.kind(),
        }
    }
}
