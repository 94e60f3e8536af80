//! Reuse of an earlier snapshot to skip hashing unchanged files.
//!
//! A file whose length, modification time and permission bits match the
//! entry the previous snapshot recorded at the same relative path is assumed
//! to be unchanged, and that entry's digest is reused without reading the
//! file. This trusts metadata as a proxy for content: a file rewritten with
//! identical size and a forged modification time is not detected. Use
//! [`PreviousBackup::Disabled`] where that matters.

use crate::cache::mtime_nanos;
use crate::fsops::attributes;
use crate::hash::{ContentDigest, Kind};
use crate::retention::DatePattern;
use crate::store::{Store, resolve};
use crate::walk::ROOT_MARKER;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Which earlier snapshot, if any, the fast path consults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PreviousBackup {
    /// The newest dated snapshot in the destination.
    #[default]
    Auto,
    /// An explicit snapshot folder.
    Path(PathBuf),
    /// Always hash.
    Disabled,
}

/// An earlier snapshot's root marker, ready for lookups.
#[derive(Debug, Clone)]
pub struct PreviousRoot {
    marker: PathBuf,
}

impl PreviousRoot {
    /// Locate the snapshot selected by `previous`.
    ///
    /// Returns `None` when there is none or when it carries no root marker.
    pub fn locate(
        previous: &PreviousBackup,
        destination: &Path,
        pattern: &DatePattern,
    ) -> Option<Self> {
        let root = match previous {
            PreviousBackup::Disabled => return None,
            PreviousBackup::Path(path) => path.clone(),
            PreviousBackup::Auto => latest_snapshot(destination, pattern)?,
        };

        let marker = root.join(ROOT_MARKER);
        if fs::symlink_metadata(&marker).is_err() {
            debug!("{} has no root marker; fast path disabled", root.display());
            return None;
        }

        debug!("Using previous snapshot {}", root.display());
        Some(Self { marker })
    }

    /// The snapshot folder this root belongs to.
    pub fn path(&self) -> &Path {
        self.marker.parent().unwrap_or(&self.marker)
    }

    /// Digest recorded for `relative` if its entry matches `source`.
    ///
    /// The digest comes from parsing the recorded link; the metadata compared
    /// is that of this store's entry for it.
    pub fn lookup(
        &self,
        store: &Store,
        relative: &Path,
        source: &fs::Metadata,
    ) -> Option<ContentDigest> {
        let candidate = self.marker.join(relative);
        let target = store.link_fs().read_link(&candidate).ok()?;
        let digest = resolve(&target).ok()?;
        if digest.kind() != Kind::File {
            return None;
        }

        let entry = fs::metadata(store.entry_path(&digest)).ok()?;
        if entry.len() == source.len()
            && mtime_nanos(&entry) == mtime_nanos(source)
            && attributes(&entry) == attributes(source)
        {
            Some(digest)
        } else {
            trace!("{} changed since the previous snapshot", relative.display());
            None
        }
    }
}

/// The newest snapshot of `destination` that carries a root marker.
pub fn latest_snapshot(destination: &Path, pattern: &DatePattern) -> Option<PathBuf> {
    let snapshots = crate::retention::scan(destination, pattern).ok()?;
    snapshots
        .into_iter()
        .filter(|s| fs::symlink_metadata(s.path.join(ROOT_MARKER)).is_ok())
        .max_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)))
        .map(|s| s.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DirEntry, directory_digest};
    use filetime::FileTime;
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;

    /// Publish `source` as `name` under a one-level snapshot and mark it.
    #[cfg(unix)]
    fn snapshot_with_file(
        store: &Store,
        snapshot: &Path,
        source: &Path,
        name: &str,
    ) -> ContentDigest {
        let file = ContentDigest::hash_bytes(Kind::File, &fs::read(source).unwrap());
        store.publish_file(&file, source, &mut Sha1::new()).unwrap();

        let mut children = vec![DirEntry::new(name, file).unwrap()];
        let dir = directory_digest(&mut children);
        store.publish_directory(&dir, &children).unwrap();

        fs::create_dir_all(snapshot).unwrap();
        std::os::unix::fs::symlink(store.entry_path(&dir), snapshot.join(ROOT_MARKER)).unwrap();
        file
    }

    #[test]
    #[cfg(unix)]
    fn test_lookup_hit_and_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path().join("store")).unwrap();
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"unchanged").unwrap();
        filetime::set_file_mtime(&source, FileTime::from_unix_time(1_700_000_000, 42)).unwrap();

        let snapshot = temp_dir.path().join("dest/2024-01-01 00-00-00");
        let digest = snapshot_with_file(&store, &snapshot, &source, "a.txt");

        let previous = PreviousRoot::locate(
            &PreviousBackup::Path(snapshot.clone()),
            temp_dir.path(),
            &DatePattern::default(),
        )
        .unwrap();
        assert_eq!(previous.path(), snapshot);

        let metadata = fs::metadata(&source).unwrap();
        assert_eq!(
            previous.lookup(&store, Path::new("a.txt"), &metadata),
            Some(digest)
        );
        assert_eq!(previous.lookup(&store, Path::new("b.txt"), &metadata), None);

        // A one-nanosecond change disables reuse.
        filetime::set_file_mtime(&source, FileTime::from_unix_time(1_700_000_000, 43)).unwrap();
        let metadata = fs::metadata(&source).unwrap();
        assert_eq!(previous.lookup(&store, Path::new("a.txt"), &metadata), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_locate_auto_picks_newest_marked() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path().join("store")).unwrap();
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"x").unwrap();

        let dest = temp_dir.path().join("dest");
        snapshot_with_file(&store, &dest.join("2024-01-01 00-00-00"), &source, "a.txt");
        snapshot_with_file(&store, &dest.join("2024-02-01 00-00-00"), &source, "a.txt");
        // Newer, but unmarked (e.g. copied in by hand).
        fs::create_dir_all(dest.join("2024-03-01 00-00-00")).unwrap();

        let previous =
            PreviousRoot::locate(&PreviousBackup::Auto, &dest, &DatePattern::default()).unwrap();
        assert_eq!(previous.path(), dest.join("2024-02-01 00-00-00"));
    }

    #[test]
    fn test_locate_disabled_or_empty() {
        let temp_dir = TempDir::new().unwrap();
        let pattern = DatePattern::default();

        assert!(PreviousRoot::locate(&PreviousBackup::Disabled, temp_dir.path(), &pattern).is_none());
        assert!(PreviousRoot::locate(&PreviousBackup::Auto, temp_dir.path(), &pattern).is_none());
        assert!(
            PreviousRoot::locate(&PreviousBackup::Auto, &temp_dir.path().join("missing"), &pattern)
                .is_none()
        );
    }
}
