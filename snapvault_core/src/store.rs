//! Store management and the atomic publish protocol.
//!
//! Layout:
//!
//! ```text
//! <root>/config            version, algorithm, cache threshold
//! <root>/roots             registered backup destinations (GC roots)
//! <root>/f/<xxx>/<rest>    file objects
//! <root>/d/<xxx>/<rest>    directory objects (one symlink per child)
//! <root>/t/<run>/          staging area of one open store
//! <root>/t/<run>.lock      held while that store is open; stale runs are purged
//! ```
//!
//! `<xxx>` is the first 3 hex digits of the digest and `<rest>` the remaining
//! 37, so every entry path can be decoded back into its digest by [`resolve`].

use crate::cache::{DEFAULT_CACHE_THRESHOLD, DigestCache};
use crate::error::{Error, Result};
use crate::fsops::{LinkFs, LinkOutcome, NativeFs};
use crate::hash::{ALGORITHM, ContentDigest, HASH_SIZE, Kind, PREFIX_LEN};
use crate::refs::RootRegistry;
use crate::tree::DirEntry;
use filetime::FileTime;
use fs2::FileExt;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

/// Directory holding transient staging areas.
pub const STAGING_DIR: &str = "t";

const RUN_LOCK_SUFFIX: &str = ".lock";
const RUN_CLAIM_ATTEMPTS: usize = 3;

/// Number of shard buckets per kind (16^3).
pub const SHARD_COUNT: usize = 4096;

/// Store settings persisted in the `config` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Files of at least this size use the sidecar digest cache; `None` disables it.
    pub hash_cache_threshold: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hash_cache_threshold: Some(DEFAULT_CACHE_THRESHOLD),
        }
    }
}

impl StoreConfig {
    fn render(&self) -> String {
        let threshold = match self.hash_cache_threshold {
            Some(bytes) => bytes.to_string(),
            None => "off".to_string(),
        };
        format!("version=1\nalgo={}\nhash_cache_threshold={}\n", ALGORITHM, threshold)
    }
}

/// The outcome of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Canonical path of the entry.
    pub path: PathBuf,
    /// Whether this call materialized the entry.
    pub created: bool,
    /// Bytes written to the store by this call.
    pub bytes_written: u64,
}

/// Publish locks keyed by canonical entry path.
///
/// Slots are created on demand and dropped once nobody waits on them, so the
/// map only ever holds digests that are being published right now.
#[derive(Debug, Default)]
struct DigestLocks {
    slots: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DigestLocks {
    fn with_lock<T>(&self, key: &Path, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.to_path_buf()).or_default())
        };

        let result = {
            let _guard = slot.lock();
            f()
        };

        let mut slots = self.slots.lock();
        // The map and this call hold the only references.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
        result
    }
}

/// A content-addressed object store.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    config: StoreConfig,
    staging: TempDir,
    // Dropped after `staging`, so the run directory is gone before the lock is released.
    _run_lock: NamedTempFile,
    link_fs: Arc<dyn LinkFs>,
    locks: DigestLocks,
}

impl Store {
    /// Initialize a new store at the given path with the default config.
    pub fn init<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::init_with_config(root, &StoreConfig::default())
    }

    /// Initialize a new store at the given path.
    ///
    /// Creates the `f/` and `d/` trees with all shard buckets, the staging
    /// area, the `config` file and an empty root registry.
    pub fn init_with_config<P: AsRef<Path>>(root: P, config: &StoreConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        for kind in [Kind::File, Kind::Directory] {
            let kind_dir = root.join(kind.segment());
            for bucket in 0..SHARD_COUNT {
                fs::create_dir_all(kind_dir.join(format!("{:03x}", bucket)))?;
            }
        }
        fs::create_dir_all(root.join(STAGING_DIR))?;

        fs::write(root.join("config"), config.render())?;

        let roots_path = root.join(crate::refs::ROOTS_FILE);
        if !roots_path.exists() {
            fs::write(&roots_path, "")?;
        }

        info!("Initialized store at {}", root.display());
        Self::open(root)
    }

    /// Open an existing store at the given path.
    ///
    /// Validates the layout, reads the configuration and purges whatever
    /// interrupted runs left in the staging area. Runs of stores that are
    /// still open elsewhere are left alone.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::invalid_store(root, "directory does not exist"));
        }
        // Live links point at absolute entry paths.
        let root = fs::canonicalize(root)?;

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }
        let config = Self::parse_config(&fs::read_to_string(&config_path)?)
            .map_err(|reason| Error::invalid_store(&root, reason))?;

        for segment in [Kind::File.segment(), Kind::Directory.segment(), STAGING_DIR] {
            if !root.join(segment).is_dir() {
                return Err(Error::invalid_store(
                    &root,
                    format!("{}/ directory missing", segment),
                ));
            }
        }

        let staging_root = root.join(STAGING_DIR);
        purge_staging(&staging_root);
        let (run_lock, staging) = claim_run(&staging_root)?;

        Ok(Self {
            root,
            config,
            staging,
            _run_lock: run_lock,
            link_fs: Arc::new(NativeFs),
            locks: DigestLocks::default(),
        })
    }

    /// Replace the filesystem link primitives.
    pub fn with_link_fs(mut self, link_fs: Arc<dyn LinkFs>) -> Self {
        self.link_fs = link_fs;
        self
    }

    /// Parse the config file.
    fn parse_config(content: &str) -> std::result::Result<StoreConfig, String> {
        let mut version = None;
        let mut algo = None;
        let mut config = StoreConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                match key.trim() {
                    "version" => version = Some(value),
                    "algo" => algo = Some(value),
                    "hash_cache_threshold" => {
                        config.hash_cache_threshold = match value {
                            "off" => None,
                            bytes => Some(bytes.parse().map_err(|_| {
                                format!("Invalid hash_cache_threshold: {}", bytes)
                            })?),
                        }
                    }
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(format!("Unsupported config version: {:?}", version));
        }

        match algo {
            Some(ALGORITHM) => Ok(config),
            Some(other) => Err(format!("Unsupported algorithm: {}", other)),
            None => Err("Missing algo in config".to_string()),
        }
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The digest cache configured for this store.
    pub fn digest_cache(&self) -> DigestCache {
        DigestCache::new(self.config.hash_cache_threshold)
    }

    /// The filesystem link primitives in use.
    pub fn link_fs(&self) -> &Arc<dyn LinkFs> {
        &self.link_fs
    }

    /// This run's private staging directory.
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Get the root registry for this store.
    pub fn roots(&self) -> RootRegistry<'_> {
        RootRegistry::new(self)
    }

    /// Path of a digest relative to the store root: `{f|d}/{prefix}/{suffix}`.
    pub fn relative_entry_path(digest: &ContentDigest) -> PathBuf {
        PathBuf::from(digest.kind().segment())
            .join(digest.prefix())
            .join(digest.suffix())
    }

    /// Canonical path of the entry for `digest`.
    pub fn entry_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root.join(Self::relative_entry_path(digest))
    }

    /// Target of a child link stored inside a directory entry.
    ///
    /// Directory entries sit three levels below the root, so the target is
    /// relative and survives moving the store as a whole.
    pub fn child_link_target(digest: &ContentDigest) -> PathBuf {
        Path::new("../../..").join(Self::relative_entry_path(digest))
    }

    /// Whether an entry for `digest` exists.
    pub fn contains(&self, digest: &ContentDigest) -> bool {
        fs::symlink_metadata(self.entry_path(digest)).is_ok()
    }

    /// Publish a file object.
    ///
    /// If the entry already exists the source is never opened. Otherwise the
    /// source is copied into the staging area, given the source's permissions
    /// and modification time, and moved into place without clobbering.
    ///
    /// The copy is hashed with `hasher` as it is written; if it does not
    /// match `digest` nothing is published and `SourceChanged` is returned.
    pub fn publish_file(
        &self,
        digest: &ContentDigest,
        source: &Path,
        hasher: &mut Sha1,
    ) -> Result<PublishReceipt> {
        debug_assert_eq!(digest.kind(), Kind::File);
        let path = self.entry_path(digest);

        self.locks.with_lock(&path, || {
            if fs::symlink_metadata(&path).is_ok() {
                return Ok(PublishReceipt {
                    path: path.clone(),
                    created: false,
                    bytes_written: 0,
                });
            }

            let mut source_file =
                fs::File::open(source).map_err(|e| Error::source_access(source, e))?;
            let metadata = source_file
                .metadata()
                .map_err(|e| Error::source_access(source, e))?;

            let mut temp_file = tempfile::NamedTempFile::new_in(self.staging.path())?;
            Digest::reset(&mut *hasher);
            let mut writer = HashingWriter {
                inner: temp_file.as_file_mut(),
                hasher: &mut *hasher,
            };
            let bytes_written = io::copy(&mut source_file, &mut writer)
                .map_err(|e| Error::source_access(source, e))?;

            let copied = ContentDigest::from_bytes(Kind::File, hasher.finalize_reset().into());
            if copied != *digest {
                return Err(Error::source_changed(source));
            }

            filetime::set_file_mtime(
                temp_file.path(),
                FileTime::from_last_modification_time(&metadata),
            )?;
            fs::set_permissions(temp_file.path(), metadata.permissions())?;

            match temp_file.persist_noclobber(&path) {
                Ok(_) => {
                    debug!("Published {:?} ({} bytes)", digest, bytes_written);
                    Ok(PublishReceipt {
                        path: path.clone(),
                        created: true,
                        bytes_written,
                    })
                }
                // Another process won the race.
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(PublishReceipt {
                    path: path.clone(),
                    created: false,
                    bytes_written: 0,
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Publish a directory object.
    ///
    /// If the entry already exists the children are ignored. Otherwise a
    /// directory is staged with one symlink per child and renamed into place
    /// once every link exists.
    pub fn publish_directory(
        &self,
        digest: &ContentDigest,
        children: &[DirEntry],
    ) -> Result<PublishReceipt> {
        debug_assert_eq!(digest.kind(), Kind::Directory);
        let path = self.entry_path(digest);

        self.locks.with_lock(&path, || {
            if fs::symlink_metadata(&path).is_ok() {
                return Ok(PublishReceipt {
                    path: path.clone(),
                    created: false,
                    bytes_written: 0,
                });
            }

            let staged = tempfile::Builder::new()
                .prefix("dir-")
                .tempdir_in(self.staging.path())?;

            for child in children {
                let link = staged.path().join(&child.name);
                let target = Self::child_link_target(&child.digest);
                match self.link_fs.create_symlink(&target, &link, child.kind())? {
                    LinkOutcome::Created => {}
                    LinkOutcome::AlreadyExists => {
                        return Err(Error::store_integrity(
                            &link,
                            "duplicate child name in directory object",
                        ));
                    }
                    LinkOutcome::LimitExceeded => {
                        return Err(Error::LinkLimitExceeded { path: link });
                    }
                }
            }

            // `staged` is removed on drop if the rename does not happen.
            match fs::rename(staged.path(), &path) {
                Ok(()) => {
                    debug!("Published {:?} ({} children)", digest, children.len());
                    Ok(PublishReceipt {
                        path: path.clone(),
                        created: true,
                        bytes_written: 0,
                    })
                }
                Err(_) if fs::symlink_metadata(&path).is_ok() => Ok(PublishReceipt {
                    path: path.clone(),
                    created: false,
                    bytes_written: 0,
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// List the children of a published directory object by parsing its links.
    pub fn read_directory(&self, digest: &ContentDigest) -> Result<Vec<DirEntry>> {
        let path = self.entry_path(digest);
        let mut children = Vec::new();

        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let target = self
                .link_fs
                .read_link(&entry.path())
                .map_err(|_| Error::store_integrity(entry.path(), "not a link"))?;
            children.push(DirEntry::new(entry.file_name(), resolve(&target)?)?);
        }

        children.sort();
        Ok(children)
    }

    /// Check that symbolic links can be created in the store.
    pub fn probe_symlinks(&self) -> Result<()> {
        let probe = self.staging.path().join("symlink-probe");
        let target = Path::new("probe-target");
        match self.link_fs.create_symlink(target, &probe, Kind::Directory) {
            Ok(_) => {
                let _ = fs::remove_file(&probe);
                Ok(())
            }
            Err(e) => Err(Error::privilege(self.staging.path(), e)),
        }
    }
}

/// Writer that feeds every byte it writes through a hasher.
struct HashingWriter<'a, W> {
    inner: W,
    hasher: &'a mut Sha1,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        Digest::update(&mut *self.hasher, &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Create a locked run lock file and its staging directory.
///
/// The lock file exists and is locked before the directory does, so a
/// directory without a lock file is always stale.
fn claim_run(staging_root: &Path) -> Result<(NamedTempFile, TempDir)> {
    for _ in 0..RUN_CLAIM_ATTEMPTS {
        let run_lock = tempfile::Builder::new()
            .prefix("run-")
            .suffix(RUN_LOCK_SUFFIX)
            .tempfile_in(staging_root)?;

        // A concurrent purge may have taken the fresh lock file for a stale one.
        if run_lock.as_file().try_lock_exclusive().is_err() || !run_lock.path().exists() {
            debug!("Lost staging claim {}, retrying", run_lock.path().display());
            continue;
        }

        let Some(stem) = run_lock
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(RUN_LOCK_SUFFIX))
            .map(str::to_string)
        else {
            continue;
        };

        let staging = tempfile::Builder::new()
            .prefix(&stem)
            .rand_bytes(0)
            .tempdir_in(staging_root)?;
        return Ok((run_lock, staging));
    }

    Err(Error::Io {
        source: io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("Cannot claim a staging area in {}", staging_root.display()),
        ),
    })
}

/// Remove the staging runs of stores that are no longer open.
fn purge_staging(staging_root: &Path) {
    let entries = match fs::read_dir(staging_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list staging area {}: {}", staging_root.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some(stem) = name.strip_suffix(RUN_LOCK_SUFFIX) {
            let Ok(lock) = fs::OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            if lock.try_lock_exclusive().is_err() {
                debug!("Staging run {} is in use", stem);
                continue;
            }
            remove_staging_entry(&staging_root.join(stem));
            remove_staging_entry(&path);
        } else if !staging_root
            .join(format!("{}{}", name, RUN_LOCK_SUFFIX))
            .exists()
        {
            remove_staging_entry(&path);
        }
    }
}

fn remove_staging_entry(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => debug!("Purged stale staging entry {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot purge {}: {}", path.display(), e),
    }
}

/// Recover a digest from a store path or link target.
///
/// Only the last three components are inspected (`{f|d}/<xxx>/<rest>`), so
/// absolute entry paths, relative child-link targets and live-link targets
/// all decode the same way. No filesystem access takes place.
pub fn resolve(path: &Path) -> Result<ContentDigest> {
    let malformed = |reason: &str| Error::malformed_identifier(path, reason);

    let mut components = path.components().rev().map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    });

    let rest = components.next().flatten().ok_or_else(|| malformed("missing entry name"))?;
    let bucket = components.next().flatten().ok_or_else(|| malformed("missing bucket"))?;
    let segment = components.next().flatten().ok_or_else(|| malformed("missing kind"))?;

    let kind = Kind::from_segment(segment).ok_or_else(|| malformed("unknown kind segment"))?;

    if bucket.len() != PREFIX_LEN || rest.len() != HASH_SIZE * 2 - PREFIX_LEN {
        return Err(malformed("wrong bucket or entry name length"));
    }

    let lower_hex = |s: &str| s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !lower_hex(bucket) || !lower_hex(rest) {
        return Err(malformed("not lowercase hex"));
    }

    ContentDigest::from_hex(kind, &format!("{}{}", bucket, rest))
        .map_err(|_| malformed("not a digest"))
}
