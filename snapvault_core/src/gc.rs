//! Garbage collection.
//!
//! Mark-and-sweep over the store. Marking starts from the links found in
//! every live backup root and follows the object graph through the store's
//! own directory entries, so each digest is opened at most once. Sweeping
//! removes every entry whose digest was not marked.
//!
//! The collector must not run while a backup is writing to the same store:
//! objects published by an unfinished backup are not yet reachable from any
//! backup root and would be swept. Nothing enforces this; callers must.

use crate::error::{Error, Result};
use crate::hash::{ContentDigest, Kind};
use crate::store::{Store, resolve};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Options for a collection run.
#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    /// Report what would be removed without removing it.
    pub dry_run: bool,
    /// Directories to treat as live in addition to the registered roots.
    pub extra_live: Vec<PathBuf>,
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Distinct digests reached during marking.
    pub objects_marked: usize,
    /// Entries deleted (or that would be, in a dry run).
    pub objects_deleted: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
    /// Unreachable entries that could not be removed.
    pub delete_failures: usize,
    /// Marked digests with no entry in the store.
    pub dangling: usize,
}

impl Store {
    /// Run garbage collection.
    ///
    /// Fails before sweeping if a registered destination is missing or a
    /// live link cannot be parsed, since either would under-mark.
    pub fn gc(&self, options: &GcOptions) -> Result<GcStats> {
        let live = self.live_paths(options)?;
        let mut stats = GcStats::default();

        let reachable = self.mark_reachable(&live, &mut stats)?;
        stats.objects_marked = reachable.len();
        info!(
            "Marked {} objects from {} live paths ({} dangling)",
            stats.objects_marked,
            live.len(),
            stats.dangling
        );

        self.sweep(&reachable, options.dry_run, &mut stats)?;
        info!(
            "{} {} objects, {} bytes ({} failures)",
            if options.dry_run { "Would delete" } else { "Deleted" },
            stats.objects_deleted,
            stats.bytes_freed,
            stats.delete_failures
        );
        Ok(stats)
    }

    /// Every child of every registered destination, plus the extra paths.
    fn live_paths(&self, options: &GcOptions) -> Result<Vec<PathBuf>> {
        let mut live = Vec::new();

        for destination in self.roots().list()? {
            if !destination.is_dir() {
                return Err(Error::configuration(format!(
                    "Registered destination {} is missing; restore it or unregister it",
                    destination.display()
                )));
            }
            for entry in fs::read_dir(&destination)? {
                live.push(entry?.path());
            }
        }

        for path in &options.extra_live {
            if fs::symlink_metadata(path).is_err() {
                return Err(Error::configuration(format!(
                    "Live path {} does not exist",
                    path.display()
                )));
            }
            live.push(path.clone());
        }

        Ok(live)
    }

    /// Mark phase: collect every digest reachable from the live paths.
    fn mark_reachable(&self, live: &[PathBuf], stats: &mut GcStats) -> Result<HashSet<ContentDigest>> {
        let mut reachable = HashSet::new();
        let mut live_dirs = Vec::new();

        for path in live {
            let file_type = fs::symlink_metadata(path)?.file_type();
            if file_type.is_symlink() {
                self.mark_link(path, &mut reachable, stats)?;
            } else if file_type.is_dir() {
                live_dirs.push(path.clone());
            }
        }

        // Real directories of the live trees; links into the store are not followed.
        while let Some(dir) = live_dirs.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_symlink() {
                    self.mark_link(&entry.path(), &mut reachable, stats)?;
                } else if file_type.is_dir() {
                    live_dirs.push(entry.path());
                }
            }
        }

        Ok(reachable)
    }

    /// Parse one live link and mark everything reachable from its target.
    fn mark_link(
        &self,
        link: &Path,
        reachable: &mut HashSet<ContentDigest>,
        stats: &mut GcStats,
    ) -> Result<()> {
        let target = self.link_fs().read_link(link)?;
        let digest = resolve(&target).map_err(|_| {
            Error::malformed_identifier(
                link,
                format!("live link target {} is not a store entry", target.display()),
            )
        })?;
        self.mark_object(digest, reachable, stats)
    }

    /// Mark a digest and, for directories, its children through the store.
    fn mark_object(
        &self,
        digest: ContentDigest,
        reachable: &mut HashSet<ContentDigest>,
        stats: &mut GcStats,
    ) -> Result<()> {
        let mut pending = vec![digest];

        while let Some(digest) = pending.pop() {
            // Already visited
            if !reachable.insert(digest) {
                continue;
            }

            let entry = self.entry_path(&digest);
            if fs::symlink_metadata(&entry).is_err() {
                warn!("Dangling reference to {:?}", digest);
                stats.dangling += 1;
                continue;
            }

            if digest.kind() == Kind::Directory {
                for child in fs::read_dir(&entry)? {
                    let child = child?.path();
                    let target = self.link_fs().read_link(&child).map_err(|_| {
                        Error::store_integrity(&child, "directory entry child is not a link")
                    })?;
                    pending.push(resolve(&target)?);
                }
            }
        }

        Ok(())
    }

    /// Sweep phase: delete unmarked entries. Shard buckets are kept.
    fn sweep(
        &self,
        reachable: &HashSet<ContentDigest>,
        dry_run: bool,
        stats: &mut GcStats,
    ) -> Result<()> {
        for kind in [Kind::File, Kind::Directory] {
            let kind_dir = self.root().join(kind.segment());

            for bucket in fs::read_dir(&kind_dir)? {
                let bucket = match bucket {
                    Ok(bucket) => bucket,
                    Err(e) => {
                        warn!("Cannot read shard in {}: {}", kind_dir.display(), e);
                        stats.delete_failures += 1;
                        continue;
                    }
                };
                match bucket.file_type() {
                    Ok(file_type) if file_type.is_dir() => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Cannot stat shard {}: {}", bucket.path().display(), e);
                        stats.delete_failures += 1;
                        continue;
                    }
                }

                let entries = match fs::read_dir(bucket.path()) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!("Cannot list shard {}: {}", bucket.path().display(), e);
                        stats.delete_failures += 1;
                        continue;
                    }
                };

                for entry in entries {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!("Cannot read entry in {}: {}", bucket.path().display(), e);
                            stats.delete_failures += 1;
                            continue;
                        }
                    };
                    let path = entry.path();

                    let digest = match resolve(&path) {
                        Ok(digest) if digest.kind() == kind => digest,
                        _ => {
                            warn!("Leaving unrecognized store entry {}", path.display());
                            continue;
                        }
                    };
                    if reachable.contains(&digest) {
                        continue;
                    }

                    let is_dir = match entry.file_type() {
                        Ok(file_type) => file_type.is_dir(),
                        Err(e) => {
                            warn!("Cannot stat {}: {}", path.display(), e);
                            stats.delete_failures += 1;
                            continue;
                        }
                    };
                    let bytes = if is_dir { 0 } else { self.freed_bytes(&path) };

                    if dry_run {
                        stats.objects_deleted += 1;
                        stats.bytes_freed += bytes;
                        continue;
                    }

                    let removed = if is_dir {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    match removed {
                        Ok(()) => {
                            debug!("Deleted {:?}", digest);
                            stats.objects_deleted += 1;
                            stats.bytes_freed += bytes;
                        }
                        Err(e) => {
                            warn!("Cannot delete {}: {}", path.display(), e);
                            stats.delete_failures += 1;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Bytes released by unlinking a file entry: its length if the store
    /// holds the last link, otherwise nothing.
    fn freed_bytes(&self, path: &Path) -> u64 {
        let Ok(metadata) = fs::symlink_metadata(path) else {
            return 0;
        };
        match self.link_fs().hardlink_count(path) {
            Ok(1) => metadata.len(),
            Ok(_) => 0,
            // Unknown link count: assume the last link.
            Err(_) => metadata.len(),
        }
    }
}
