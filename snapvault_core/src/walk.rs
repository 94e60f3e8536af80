//! Snapshot building: walking sources, publishing objects and linking the
//! dated backup root.
//!
//! Directories are traversed depth-first on the calling thread; the regular
//! files of each directory are hashed and published on a worker pool. Every
//! directory's digest is computed from its children once all of them are
//! resolved, then the directory is published. Only when the whole tree is
//! in the store is the backup root materialized, so a failed or cancelled
//! run never leaves a partial snapshot behind.

use crate::cache::DigestCache;
use crate::error::{Error, Result};
use crate::fsops::{LinkOutcome, same_device};
use crate::hash::{ContentDigest, HasherPool, Kind};
use crate::previous::{PreviousBackup, PreviousRoot};
use crate::retention::DatePattern;
use crate::store::Store;
use crate::tree::{DirEntry, HashEntry, directory_digest, validate_name};
use chrono::{Local, NaiveDateTime};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use rayon::prelude::*;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Reserved name of the link from a backup root to its root directory object.
pub const ROOT_MARKER: &str = ".snapvault-root";

/// A source tree, optionally renamed inside the backup root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSource {
    pub path: PathBuf,
    pub alias: Option<String>,
}

impl BackupSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alias: None,
        }
    }

    pub fn with_alias(path: impl Into<PathBuf>, alias: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            alias: Some(alias.into()),
        }
    }

    /// Name under the virtual root: the alias, or the final path component.
    pub fn name(&self) -> Result<OsString> {
        let name = match &self.alias {
            Some(alias) => OsString::from(alias),
            None => self
                .path
                .file_name()
                .map(OsString::from)
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "Cannot derive a name for source {}; give it an alias",
                        self.path.display()
                    ))
                })?,
        };

        validate_name(&name).map_err(|e| Error::configuration(e.to_string()))?;
        if name == ROOT_MARKER {
            return Err(Error::configuration(format!(
                "{} is reserved and cannot name a source",
                ROOT_MARKER
            )));
        }
        Ok(name)
    }
}

impl FromStr for BackupSource {
    type Err = Error;

    /// Parse `PATH` or `ALIAS=PATH`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((alias, path)) if !alias.is_empty() && !path.is_empty() => {
                Ok(BackupSource::with_alias(path, alias))
            }
            Some(_) => Err(Error::configuration(format!("Invalid source: {}", s))),
            None if s.is_empty() => Err(Error::configuration("Source path cannot be empty")),
            None => Ok(BackupSource::new(s)),
        }
    }
}

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight file tasks finish; nothing new starts.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inputs of one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub sources: Vec<BackupSource>,
    /// Directory receiving the dated backup root.
    pub destination: PathBuf,
    /// Gitignore-style patterns, matched relative to each source.
    pub excludes: Vec<String>,
    /// Worker threads (and hashing contexts) for file processing.
    pub threads: usize,
    pub previous: PreviousBackup,
    pub date_format: DatePattern,
    /// Date used to name the backup root; the local time when `None`.
    pub timestamp: Option<NaiveDateTime>,
    /// Overrides the store's digest cache settings.
    pub digest_cache: Option<DigestCache>,
    pub cancel: CancelToken,
}

impl BackupOptions {
    pub fn new(sources: Vec<BackupSource>, destination: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            destination: destination.into(),
            excludes: Vec::new(),
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            previous: PreviousBackup::Auto,
            date_format: DatePattern::default(),
            timestamp: None,
            digest_cache: None,
            cancel: CancelToken::new(),
        }
    }
}

/// Counters accumulated over a backup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupCounters {
    pub files: u64,
    pub directories: u64,
    pub excluded: u64,
    pub source_errors: u64,
    pub missing_sources: u64,
    pub skipped_special: u64,
    pub cache_hits: u64,
    pub bytes_hashed: u64,
    pub files_published: u64,
    pub directories_published: u64,
    pub bytes_written: u64,
    pub fast_path_hits: u64,
    pub hardlinks_created: u64,
    pub private_copies: u64,
    pub hash_collisions: u64,
}

impl AddAssign for BackupCounters {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.directories += other.directories;
        self.excluded += other.excluded;
        self.source_errors += other.source_errors;
        self.missing_sources += other.missing_sources;
        self.skipped_special += other.skipped_special;
        self.cache_hits += other.cache_hits;
        self.bytes_hashed += other.bytes_hashed;
        self.files_published += other.files_published;
        self.directories_published += other.directories_published;
        self.bytes_written += other.bytes_written;
        self.fast_path_hits += other.fast_path_hits;
        self.hardlinks_created += other.hardlinks_created;
        self.private_copies += other.private_copies;
        self.hash_collisions += other.hash_collisions;
    }
}

/// Result of a backup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupReport {
    /// The backup root, absent when the run was cancelled.
    pub root: Option<PathBuf>,
    /// Digest of the root directory object.
    pub digest: Option<ContentDigest>,
    #[serde(flatten)]
    pub counters: BackupCounters,
    pub cancelled: bool,
}

/// What one file task produced.
#[derive(Debug, Default)]
struct FileOutcome {
    digest: Option<ContentDigest>,
    counters: BackupCounters,
}

impl FileOutcome {
    fn skipped(mut self, path: &Path, err: &Error) -> Self {
        warn!("Skipping {}: {}", path.display(), err);
        self.counters.source_errors += 1;
        self.digest = None;
        self
    }
}

/// State shared by every step of one run.
struct Builder<'a> {
    store: &'a Store,
    cache: DigestCache,
    hashers: HasherPool,
    pool: rayon::ThreadPool,
    previous: Option<PreviousRoot>,
    cancel: &'a CancelToken,
}

impl Store {
    /// Back up the configured sources into a new dated root under the
    /// destination.
    ///
    /// Configuration problems are reported before anything is hashed or
    /// written. Per-entry source errors are logged, counted and the entry
    /// is left out; errors on a source root abort the run.
    pub fn backup(&self, options: &BackupOptions) -> Result<BackupReport> {
        let virtual_names = preflight_sources(&options.sources)?;

        let timestamp = options
            .timestamp
            .unwrap_or_else(|| Local::now().naive_local());
        let root_name = options.date_format.format(timestamp);
        if validate_name(root_name.as_ref()).is_err() || root_name.starts_with('.') {
            return Err(Error::configuration(format!(
                "Date format {:?} produces an unusable folder name: {:?}",
                options.date_format.as_str(),
                root_name
            )));
        }

        let destination = &options.destination;
        if destination.exists() && !destination.is_dir() {
            return Err(Error::configuration(format!(
                "Destination {} is not a directory",
                destination.display()
            )));
        }
        let root_path = destination.join(&root_name);
        if fs::symlink_metadata(&root_path).is_ok() {
            return Err(Error::configuration(format!(
                "Backup root {} already exists",
                root_path.display()
            )));
        }

        let anchor = existing_ancestor(destination)?;
        if !same_device(self.root(), &anchor)? {
            return Err(Error::configuration(format!(
                "Store {} and destination {} are on different devices",
                self.root().display(),
                destination.display()
            )));
        }

        self.probe_symlinks()?;

        let matchers = options
            .sources
            .iter()
            .map(|source| build_matcher(&source.path, &options.excludes))
            .collect::<Result<Vec<_>>>()?;

        let threads = options.threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("snapvault-worker-{}", i))
            .build()
            .map_err(|e| Error::configuration(format!("Cannot start worker pool: {}", e)))?;

        let builder = Builder {
            store: self,
            cache: options.digest_cache.unwrap_or_else(|| self.digest_cache()),
            hashers: HasherPool::new(threads),
            pool,
            previous: PreviousRoot::locate(&options.previous, destination, &options.date_format),
            cancel: &options.cancel,
        };

        info!(
            "Backing up {} source(s) into {}",
            options.sources.len(),
            root_path.display()
        );

        let mut report = BackupReport::default();
        let counters = &mut report.counters;

        let root = match virtual_names {
            None => builder.walk_source(
                &options.sources[0],
                &matchers[0],
                Path::new(""),
                true,
                counters,
            )?,
            Some(names) => builder.walk_virtual_root(options, &matchers, names, counters)?,
        };

        let (digest, children) = match root {
            Some(HashEntry::Directory { digest, children }) if !options.cancel.is_cancelled() => {
                (digest, children)
            }
            _ => {
                info!("Backup cancelled; no backup root created");
                report.cancelled = true;
                return Ok(report);
            }
        };

        fs::create_dir_all(destination)?;
        let destination = fs::canonicalize(destination)?;
        let staged = tempfile::Builder::new()
            .prefix(".snapvault-staging-")
            .tempdir_in(&destination)?;

        for child in &children {
            builder.link_live(child, &staged.path().join(&child.name), counters)?;
        }

        let marker = staged.path().join(ROOT_MARKER);
        match self
            .link_fs()
            .create_symlink(&self.entry_path(&digest), &marker, Kind::Directory)?
        {
            LinkOutcome::Created => {}
            _ => return Err(Error::store_integrity(&marker, "cannot create root marker")),
        }

        let root_path = destination.join(&root_name);
        fs::rename(staged.path(), &root_path)?;

        self.roots().add(&destination)?;

        info!(
            "Backup {} complete: {} files, {} directories, {} bytes written, {} errors",
            root_path.display(),
            counters.files,
            counters.directories,
            counters.bytes_written,
            counters.source_errors
        );

        report.root = Some(root_path);
        report.digest = Some(digest);
        Ok(report)
    }
}

/// Validate sources; returns the virtual root's child names when one is needed.
fn preflight_sources(sources: &[BackupSource]) -> Result<Option<Vec<OsString>>> {
    if sources.is_empty() {
        return Err(Error::configuration("No sources given"));
    }

    if sources.len() == 1 && sources[0].alias.is_none() {
        return Ok(None);
    }

    let mut names: Vec<OsString> = Vec::with_capacity(sources.len());
    for source in sources {
        let name = source.name()?;
        if names.contains(&name) {
            return Err(Error::duplicate_alias(name.to_string_lossy()));
        }
        names.push(name);
    }
    Ok(Some(names))
}

/// Build the exclude matcher for one source.
fn build_matcher(root: &Path, excludes: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in excludes {
        builder.add_line(None, pattern)?;
    }
    Ok(builder.build()?)
}

/// The nearest ancestor of `path` (or `path` itself) that exists.
fn existing_ancestor(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    absolute
        .ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::configuration(format!("No existing parent of {}", path.display())))
}

impl Builder<'_> {
    /// Merge several sources under one unnamed directory.
    fn walk_virtual_root(
        &self,
        options: &BackupOptions,
        matchers: &[Gitignore],
        names: Vec<OsString>,
        counters: &mut BackupCounters,
    ) -> Result<Option<HashEntry>> {
        let mut children = Vec::with_capacity(names.len());

        for ((source, matcher), name) in options.sources.iter().zip(matchers).zip(names) {
            let relative = PathBuf::from(&name);
            match self.walk_source(source, matcher, &relative, false, counters)? {
                Some(entry) => children.push(DirEntry {
                    name,
                    digest: entry.digest(),
                }),
                None => return Ok(None),
            }
        }

        let digest = directory_digest(&mut children);
        let receipt = self.store.publish_directory(&digest, &children)?;
        counters.directories += 1;
        if receipt.created {
            counters.directories_published += 1;
        }
        Ok(Some(HashEntry::Directory { digest, children }))
    }

    /// Resolve a source root. A root that does not exist becomes an empty
    /// directory; any other failure is fatal.
    fn walk_source(
        &self,
        source: &BackupSource,
        matcher: &Gitignore,
        relative: &Path,
        top_level: bool,
        counters: &mut BackupCounters,
    ) -> Result<Option<HashEntry>> {
        let metadata = match fs::metadata(&source.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Source {} does not exist; recording an empty directory",
                    source.path.display()
                );
                counters.missing_sources += 1;
                return self.finish_directory(Vec::new(), counters).map(Some);
            }
            Err(e) => return Err(Error::source_access(&source.path, e)),
        };

        if metadata.is_dir() {
            return self.walk_dir(&source.path, relative, matcher, top_level, counters);
        }

        if metadata.is_file() && !top_level {
            let outcome = self.process_file(&source.path, relative)?;
            *counters += outcome.counters;
            return match outcome.digest {
                Some(digest) => Ok(Some(HashEntry::File {
                    digest,
                    len: metadata.len(),
                })),
                None if self.cancel.is_cancelled() => Ok(None),
                None => Err(Error::configuration(format!(
                    "Cannot back up source {}",
                    source.path.display()
                ))),
            };
        }

        Err(Error::configuration(format!(
            "Source {} is not a directory",
            source.path.display()
        )))
    }

    /// Walk one directory; `None` means the run was cancelled.
    ///
    /// `top_level` reserves the root marker name among the children.
    fn walk_dir(
        &self,
        dir: &Path,
        relative: &Path,
        matcher: &Gitignore,
        top_level: bool,
        counters: &mut BackupCounters,
    ) -> Result<Option<HashEntry>> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        for entry in fs::read_dir(dir).map_err(|e| Error::source_access(dir, e))? {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Cannot read entry in {}: {}", dir.display(), e);
                    counters.source_errors += 1;
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    counters.source_errors += 1;
                    continue;
                }
            };

            if matcher.matched(&path, file_type.is_dir()).is_ignore() {
                debug!("Excluded {}", path.display());
                counters.excluded += 1;
                continue;
            }

            let name = entry.file_name();
            if let Err(e) = validate_name(&name) {
                warn!("Skipping {}: {}", path.display(), e);
                counters.source_errors += 1;
                continue;
            }
            if top_level && name == ROOT_MARKER {
                warn!("Skipping {}: name is reserved", path.display());
                counters.source_errors += 1;
                continue;
            }

            if file_type.is_dir() {
                dirs.push(name);
            } else if file_type.is_file() {
                files.push(name);
            } else {
                debug!("Skipping special entry {}", path.display());
                counters.skipped_special += 1;
            }
        }

        let mut children = Vec::with_capacity(files.len() + dirs.len());

        for name in dirs {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let path = dir.join(&name);
            match self.walk_dir(&path, &relative.join(&name), matcher, false, counters) {
                Ok(Some(node)) => children.push(DirEntry {
                    name,
                    digest: node.digest(),
                }),
                Ok(None) => return Ok(None),
                Err(e) if e.is_per_entry() => {
                    warn!("Skipping {}: {}", path.display(), e);
                    counters.source_errors += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let outcomes = self.pool.install(|| {
            files
                .par_iter()
                .map(|name| self.process_file(&dir.join(name), &relative.join(name)))
                .collect::<Result<Vec<_>>>()
        })?;

        for (name, outcome) in files.into_iter().zip(outcomes) {
            *counters += outcome.counters;
            if let Some(digest) = outcome.digest {
                children.push(DirEntry { name, digest });
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        self.finish_directory(children, counters).map(Some)
    }

    /// Digest and publish a directory whose children are all resolved.
    fn finish_directory(
        &self,
        mut children: Vec<DirEntry>,
        counters: &mut BackupCounters,
    ) -> Result<HashEntry> {
        let digest = directory_digest(&mut children);
        let receipt = self.store.publish_directory(&digest, &children)?;

        counters.directories += 1;
        if receipt.created {
            counters.directories_published += 1;
        }
        Ok(HashEntry::Directory { digest, children })
    }

    /// Hash and publish one regular file. Runs on the worker pool.
    fn process_file(&self, path: &Path, relative: &Path) -> Result<FileOutcome> {
        let mut outcome = FileOutcome::default();
        if self.cancel.is_cancelled() {
            return Ok(outcome);
        }
        outcome.counters.files = 1;

        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => return Ok(outcome.skipped(path, &Error::source_access(path, e))),
        };

        if let Some(previous) = &self.previous
            && let Some(digest) = previous.lookup(self.store, relative, &metadata)
        {
            outcome.counters.fast_path_hits = 1;
            outcome.digest = Some(digest);
            return Ok(outcome);
        }

        // Held until publishing is done; the copy is hashed again on its way in.
        let mut hasher = self.hashers.checkout();
        let hashed = match self.cache.digest_file(path, &mut hasher) {
            Ok(hashed) => hashed,
            Err(e) if e.is_per_entry() => return Ok(outcome.skipped(path, &e)),
            Err(e) => return Err(e),
        };
        outcome.counters.bytes_hashed = hashed.bytes_hashed;
        if hashed.cache_hit {
            outcome.counters.cache_hits = 1;
        }

        let receipt = match self.store.publish_file(&hashed.digest, path, &mut hasher) {
            Ok(receipt) => receipt,
            Err(e) if e.is_per_entry() => return Ok(outcome.skipped(path, &e)),
            Err(e) => return Err(e),
        };
        if receipt.created {
            outcome.counters.files_published = 1;
            outcome.counters.bytes_written = receipt.bytes_written;
        }

        let stored = fs::metadata(&receipt.path)?.len();
        if stored != hashed.len {
            outcome.counters.hash_collisions = 1;
            warn!("{}", Error::hash_collision(path, hashed.len, stored));
            return Ok(outcome);
        }

        outcome.digest = Some(hashed.digest);
        Ok(outcome)
    }

    /// Create the live link for one child of the backup root.
    ///
    /// Files are hardlinked to their store entry, or copied when the entry
    /// has run out of links; directories are symlinked.
    fn link_live(&self, child: &DirEntry, link: &Path, counters: &mut BackupCounters) -> Result<()> {
        let link_fs = self.store.link_fs();
        let entry = self.store.entry_path(&child.digest);

        let outcome = match child.kind() {
            Kind::Directory => link_fs.create_symlink(&entry, link, Kind::Directory)?,
            Kind::File => link_fs.create_hardlink(&entry, link)?,
        };

        match (outcome, child.kind()) {
            (LinkOutcome::Created, Kind::File) => counters.hardlinks_created += 1,
            (LinkOutcome::Created, Kind::Directory) => {}
            (LinkOutcome::LimitExceeded, Kind::File) => {
                debug!("Link limit reached for {}; copying", entry.display());
                if let Err(e) = link_fs.copy_file(&entry, link) {
                    warn!("Cannot copy {} to {}: {}", entry.display(), link.display(), e);
                    counters.source_errors += 1;
                    return Ok(());
                }
                counters.private_copies += 1;
            }
            (LinkOutcome::LimitExceeded, Kind::Directory) => {
                return Err(Error::LinkLimitExceeded {
                    path: link.to_path_buf(),
                });
            }
            (LinkOutcome::AlreadyExists, _) => {
                return Err(Error::store_integrity(link, "duplicate name in backup root"));
            }
        }

        if child.kind() == Kind::File {
            let expected = fs::metadata(&entry)?.len();
            let actual = fs::metadata(link)?.len();
            if actual != expected {
                counters.hash_collisions += 1;
                warn!("{}", Error::hash_collision(link, expected, actual));
                fs::remove_file(link)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::{LinkFs, NativeFs};
    use crate::store::resolve;
    use chrono::{NaiveDate, NaiveTime, TimeDelta};
    use tempfile::TempDir;

    fn day(n: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_time(NaiveTime::MIN)
            + TimeDelta::days(n)
    }

    fn options(sources: Vec<BackupSource>, dest: &Path, n: i64) -> BackupOptions {
        let mut options = BackupOptions::new(sources, dest);
        options.threads = 4;
        options.timestamp = Some(day(n));
        options
    }

    fn count_entries(store: &Store, kind: Kind) -> usize {
        fs::read_dir(store.root().join(kind.segment()))
            .unwrap()
            .map(|bucket| fs::read_dir(bucket.unwrap().path()).unwrap().count())
            .sum()
    }

    fn setup() -> (TempDir, Store, PathBuf, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path().join("store")).unwrap();
        let source = temp_dir.path().join("source");
        let dest = temp_dir.path().join("backups");
        fs::create_dir_all(&source).unwrap();
        (temp_dir, store, source, dest)
    }

    #[test]
    fn test_parse_backup_source() {
        assert_eq!(
            "/data/docs".parse::<BackupSource>().unwrap(),
            BackupSource::new("/data/docs")
        );
        assert_eq!(
            "docs=/data/docs".parse::<BackupSource>().unwrap(),
            BackupSource::with_alias("/data/docs", "docs")
        );
        assert!("=/data".parse::<BackupSource>().is_err());
        assert!("docs=".parse::<BackupSource>().is_err());
        assert!("".parse::<BackupSource>().is_err());
    }

    #[test]
    fn test_source_name() {
        assert_eq!(BackupSource::new("/data/docs").name().unwrap(), "docs");
        assert_eq!(BackupSource::with_alias("/data/docs", "d").name().unwrap(), "d");
        assert!(BackupSource::new("/").name().is_err());
        assert!(BackupSource::with_alias("/x", ROOT_MARKER).name().is_err());
        assert!(BackupSource::with_alias("/x", "a/b").name().is_err());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(!token.is_cancelled());
        shared.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    #[cfg(unix)]
    fn test_backup_single_source() {
        let (_temp, store, source, dest) = setup();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::create_dir(source.join("sub")).unwrap();
        fs::write(source.join("sub/b.txt"), b"beta").unwrap();

        let report = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        let root = report.root.clone().unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.counters.files, 2);
        assert_eq!(report.counters.directories, 2);
        assert_eq!(report.counters.files_published, 2);
        assert_eq!(report.counters.hardlinks_created, 1);
        assert_eq!(root.file_name().unwrap(), "2024-06-01 00-00-00");

        // The mirror is readable at every depth.
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(root.join("sub/b.txt")).unwrap(), b"beta");

        let marker = fs::read_link(root.join(ROOT_MARKER)).unwrap();
        assert_eq!(Some(resolve(&marker).unwrap()), report.digest);
        let sub = fs::read_link(root.join("sub")).unwrap();
        assert_eq!(resolve(&sub).unwrap().kind(), Kind::Directory);

        // No staging leftovers in the destination.
        let names: Vec<_> = fs::read_dir(&dest).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![OsString::from("2024-06-01 00-00-00")]);
    }

    #[test]
    #[cfg(unix)]
    fn test_identical_files_stored_once() {
        let (_temp, store, source, dest) = setup();
        let data = vec![0x5au8; 10 * 1024 * 1024];
        for dir in ["a", "b"] {
            fs::create_dir(source.join(dir)).unwrap();
            fs::write(source.join(dir).join("x.bin"), &data).unwrap();
        }

        let report = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        let root = report.root.unwrap();

        assert_eq!(report.counters.files, 2);
        assert_eq!(report.counters.files_published, 1);
        assert_eq!(report.counters.bytes_written, data.len() as u64);
        assert_eq!(count_entries(&store, Kind::File), 1);

        // Identical subtrees collapse into one directory object.
        assert_eq!(
            fs::read_link(root.join("a")).unwrap(),
            fs::read_link(root.join("b")).unwrap()
        );
        assert_eq!(fs::read(root.join("b/x.bin")).unwrap().len(), data.len());
    }

    #[test]
    #[cfg(unix)]
    fn test_missing_source_matches_empty_directory() {
        let (_temp, store, source, dest) = setup();

        let first = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        assert_eq!(first.counters.missing_sources, 0);

        fs::remove_dir(&source).unwrap();
        let second = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 1))
            .unwrap();

        assert_eq!(second.counters.missing_sources, 1);
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.digest, Some(directory_digest(&mut [])));
    }

    #[test]
    #[cfg(unix)]
    fn test_virtual_root_with_aliases() {
        let (temp, store, _source, dest) = setup();
        let docs = temp.path().join("docs");
        let photos = temp.path().join("photos");
        fs::create_dir_all(&docs).unwrap();
        fs::create_dir_all(&photos).unwrap();
        fs::write(docs.join("cv.txt"), b"cv").unwrap();
        fs::write(photos.join("cat.jpg"), b"meow").unwrap();

        let sources = vec![BackupSource::new(&docs), BackupSource::with_alias(&photos, "pics")];
        let report = store.backup(&options(sources, &dest, 0)).unwrap();
        let root = report.root.unwrap();

        assert_eq!(fs::read(root.join("docs/cv.txt")).unwrap(), b"cv");
        assert_eq!(fs::read(root.join("pics/cat.jpg")).unwrap(), b"meow");
        assert_eq!(report.counters.directories, 3);
    }

    #[test]
    fn test_duplicate_alias_rejected_before_any_work() {
        let (temp, store, _source, dest) = setup();
        let a = temp.path().join("one/data");
        let b = temp.path().join("two/data");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("f"), b"f").unwrap();

        let result = store.backup(&options(
            vec![BackupSource::new(&a), BackupSource::new(&b)],
            &dest,
            0,
        ));

        assert!(matches!(result, Err(Error::DuplicateAlias { .. })));
        assert!(!dest.exists());
        assert_eq!(count_entries(&store, Kind::File), 0);
    }

    #[test]
    fn test_destination_is_file_rejected() {
        let (_temp, store, source, dest) = setup();
        fs::write(&dest, b"not a directory").unwrap();

        let result = store.backup(&options(vec![BackupSource::new(&source)], &dest, 0));
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn test_existing_backup_root_rejected() {
        let (_temp, store, source, dest) = setup();
        store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();

        let result = store.backup(&options(vec![BackupSource::new(&source)], &dest, 0));
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn test_excludes() {
        let (_temp, store, source, dest) = setup();
        fs::write(source.join("keep.txt"), b"keep").unwrap();
        fs::write(source.join("scratch.tmp"), b"tmp").unwrap();
        fs::create_dir(source.join("cache")).unwrap();
        fs::write(source.join("cache/blob"), b"blob").unwrap();

        let mut opts = options(vec![BackupSource::new(&source)], &dest, 0);
        opts.excludes = vec!["*.tmp".to_string(), "cache/".to_string()];
        let report = store.backup(&opts).unwrap();
        let root = report.root.unwrap();

        assert_eq!(report.counters.excluded, 2);
        assert_eq!(report.counters.files, 1);
        assert!(root.join("keep.txt").exists());
        assert!(!root.join("scratch.tmp").exists());
        assert!(!root.join("cache").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_special_entries_and_reserved_name_skipped() {
        let (_temp, store, source, dest) = setup();
        fs::write(source.join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("real.txt", source.join("alias.txt")).unwrap();
        fs::write(source.join(ROOT_MARKER), b"impostor").unwrap();

        let report = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        let root = report.root.unwrap();

        assert_eq!(report.counters.skipped_special, 1);
        assert_eq!(report.counters.source_errors, 1);
        assert!(!root.join("alias.txt").exists());
        // The marker still points into the store.
        assert!(resolve(&fs::read_link(root.join(ROOT_MARKER)).unwrap()).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_second_backup_uses_previous() {
        let (_temp, store, source, dest) = setup();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::create_dir(source.join("sub")).unwrap();
        fs::write(source.join("sub/b.txt"), b"beta").unwrap();

        let first = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        let second = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 1))
            .unwrap();

        assert_eq!(second.counters.fast_path_hits, 2);
        assert_eq!(second.counters.bytes_hashed, 0);
        assert_eq!(second.counters.files_published, 0);
        assert_eq!(first.digest, second.digest);

        let mut disabled = options(vec![BackupSource::new(&source)], &dest, 2);
        disabled.previous = PreviousBackup::Disabled;
        let third = store.backup(&disabled).unwrap();
        assert_eq!(third.counters.fast_path_hits, 0);
        assert_eq!(third.counters.bytes_hashed, 9);
    }

    #[test]
    fn test_cancelled_backup_creates_no_root() {
        let (_temp, store, source, dest) = setup();
        fs::write(source.join("a.txt"), b"alpha").unwrap();

        let opts = options(vec![BackupSource::new(&source)], &dest, 0);
        opts.cancel.cancel();
        let report = store.backup(&opts).unwrap();

        assert!(report.cancelled);
        assert!(report.root.is_none());
        assert!(!dest.exists());
        assert!(store.roots().list().unwrap().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_destination_registered() {
        let (_temp, store, source, dest) = setup();
        store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();

        assert_eq!(
            store.roots().list().unwrap(),
            vec![fs::canonicalize(&dest).unwrap()]
        );
    }

    /// Native links with a hardlink ceiling of one (the store entry itself).
    #[derive(Debug)]
    struct NoSpareLinks;

    impl LinkFs for NoSpareLinks {
        fn create_hardlink(&self, _original: &Path, _link: &Path) -> io::Result<LinkOutcome> {
            Ok(LinkOutcome::LimitExceeded)
        }

        fn create_symlink(&self, target: &Path, link: &Path, kind: Kind) -> io::Result<LinkOutcome> {
            NativeFs.create_symlink(target, link, kind)
        }

        fn read_link(&self, link: &Path) -> io::Result<PathBuf> {
            NativeFs.read_link(link)
        }

        fn hardlink_count(&self, path: &Path) -> io::Result<u64> {
            NativeFs.hardlink_count(path)
        }

        fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
            NativeFs.copy_file(from, to)
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_link_limit_falls_back_to_copy() {
        let (_temp, store, source, dest) = setup();
        let store = store.with_link_fs(Arc::new(NoSpareLinks));
        fs::write(source.join("a.txt"), b"alpha").unwrap();

        let report = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        let root = report.root.unwrap();

        assert_eq!(report.counters.private_copies, 1);
        assert_eq!(report.counters.hardlinks_created, 0);
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"alpha");

        let digest = ContentDigest::hash_bytes(Kind::File, b"alpha");
        assert_eq!(store.link_fs().hardlink_count(&store.entry_path(&digest)).unwrap(), 1);
    }

    /// Native links on a filesystem that refuses symbolic links.
    #[derive(Debug)]
    struct NoSymlinks;

    impl LinkFs for NoSymlinks {
        fn create_hardlink(&self, original: &Path, link: &Path) -> io::Result<LinkOutcome> {
            NativeFs.create_hardlink(original, link)
        }

        fn create_symlink(
            &self,
            _target: &Path,
            _link: &Path,
            _kind: Kind,
        ) -> io::Result<LinkOutcome> {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "symbolic links not permitted",
            ))
        }

        fn read_link(&self, link: &Path) -> io::Result<PathBuf> {
            NativeFs.read_link(link)
        }

        fn hardlink_count(&self, path: &Path) -> io::Result<u64> {
            NativeFs.hardlink_count(path)
        }

        fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
            NativeFs.copy_file(from, to)
        }
    }

    #[test]
    fn test_missing_symlink_privilege_aborts_before_any_work() {
        let (_temp, store, source, dest) = setup();
        let store = store.with_link_fs(Arc::new(NoSymlinks));
        fs::write(source.join("a.txt"), b"alpha").unwrap();

        let err = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap_err();

        assert!(matches!(err, Error::Privilege { .. }));
        assert!(!dest.exists());
        assert_eq!(count_entries(&store, Kind::File), 0);
        assert!(store.roots().list().unwrap().is_empty());
    }

    fn root_listing(root: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, store, source, dest) = setup();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/b.txt"), b"beta").unwrap();
        let locked = source.join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("secret.txt"), b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through permission bits.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = store.backup(&options(vec![BackupSource::new(&source)], &dest, 0));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let report = result.unwrap();
        let root = report.root.unwrap();

        assert_eq!(report.counters.source_errors, 1);
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(root.join("sub/b.txt")).unwrap(), b"beta");
        assert_eq!(root_listing(&root), vec![ROOT_MARKER, "a.txt", "sub"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_file_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, store, source, dest) = setup();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::write(source.join("c.txt"), b"gamma").unwrap();
        let locked = source.join("b.txt");
        fs::write(&locked, b"beta").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        if fs::File::open(&locked).is_ok() {
            return;
        }

        let report = store
            .backup(&options(vec![BackupSource::new(&source)], &dest, 0))
            .unwrap();
        let root = report.root.unwrap();

        assert_eq!(report.counters.source_errors, 1);
        assert_eq!(report.counters.files_published, 2);
        assert_eq!(root_listing(&root), vec![ROOT_MARKER, "a.txt", "c.txt"]);
        assert!(!store.contains(&ContentDigest::hash_bytes(Kind::File, b"beta")));
    }
}
