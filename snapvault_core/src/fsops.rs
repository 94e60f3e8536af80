//! Filesystem link primitives.
//!
//! The store and the snapshot builder never call link syscalls directly; they
//! go through [`LinkFs`] so that link-count exhaustion surfaces as a value
//! ([`LinkOutcome::LimitExceeded`]) rather than an error, and so tests can
//! substitute a filesystem with a tiny link ceiling.

use crate::hash::Kind;
use filetime::FileTime;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Result of a link creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The link was created.
    Created,
    /// Something already exists at the link path.
    AlreadyExists,
    /// The target has reached the platform hardlink ceiling.
    LimitExceeded,
}

/// Link and attribute operations consumed from the OS layer.
pub trait LinkFs: Send + Sync + fmt::Debug {
    /// Create a hardlink at `link` to the existing file `original`.
    fn create_hardlink(&self, original: &Path, link: &Path) -> io::Result<LinkOutcome>;

    /// Create a symbolic link at `link` whose target is `target`.
    ///
    /// `kind` selects a directory or file link on platforms that distinguish them.
    fn create_symlink(&self, target: &Path, link: &Path, kind: Kind) -> io::Result<LinkOutcome>;

    /// Read the target of a symbolic link.
    fn read_link(&self, link: &Path) -> io::Result<PathBuf>;

    /// Number of hardlinks to the file at `path` (not following symlinks).
    fn hardlink_count(&self, path: &Path) -> io::Result<u64>;

    /// Copy a file, preserving permissions and modification time.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;
}

/// [`LinkFs`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFs;

impl LinkFs for NativeFs {
    fn create_hardlink(&self, original: &Path, link: &Path) -> io::Result<LinkOutcome> {
        match fs::hard_link(original, link) {
            Ok(()) => Ok(LinkOutcome::Created),
            Err(e) => classify_link_error(e),
        }
    }

    fn create_symlink(&self, target: &Path, link: &Path, kind: Kind) -> io::Result<LinkOutcome> {
        match symlink(target, link, kind) {
            Ok(()) => Ok(LinkOutcome::Created),
            Err(e) => classify_link_error(e),
        }
    }

    fn read_link(&self, link: &Path) -> io::Result<PathBuf> {
        fs::read_link(link)
    }

    fn hardlink_count(&self, path: &Path) -> io::Result<u64> {
        let metadata = fs::symlink_metadata(path)?;
        nlink(&metadata)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let bytes = fs::copy(from, to)?;
        let metadata = fs::metadata(from)?;
        filetime::set_file_mtime(to, FileTime::from_last_modification_time(&metadata))?;
        Ok(bytes)
    }
}

fn classify_link_error(err: io::Error) -> io::Result<LinkOutcome> {
    match err.kind() {
        io::ErrorKind::AlreadyExists => Ok(LinkOutcome::AlreadyExists),
        io::ErrorKind::TooManyLinks => Ok(LinkOutcome::LimitExceeded),
        _ => Err(err),
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path, _kind: Kind) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path, kind: Kind) -> io::Result<()> {
    match kind {
        Kind::Directory => std::os::windows::fs::symlink_dir(target, link),
        Kind::File => std::os::windows::fs::symlink_file(target, link),
    }
}

#[cfg(unix)]
fn nlink(metadata: &fs::Metadata) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(metadata.nlink())
}

#[cfg(not(unix))]
fn nlink(_metadata: &fs::Metadata) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hardlink counts are not available on this platform",
    ))
}

/// Whether two existing paths live on the same device.
#[cfg(unix)]
pub fn same_device(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(a)?.dev() == fs::metadata(b)?.dev())
}

/// Whether two existing paths live on the same device (assumed elsewhere).
#[cfg(not(unix))]
pub fn same_device(_a: &Path, _b: &Path) -> io::Result<bool> {
    Ok(true)
}

/// Permission bits compared by the previous-backup fast path.
#[cfg(unix)]
pub fn attributes(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Permission bits compared by the previous-backup fast path.
#[cfg(not(unix))]
pub fn attributes(metadata: &fs::Metadata) -> u32 {
    u32::from(metadata.permissions().readonly())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hardlink_created_and_counted() {
        let temp_dir = TempDir::new().unwrap();
        let original = temp_dir.path().join("original");
        fs::write(&original, b"data").unwrap();

        let fs_ops = NativeFs;
        let link = temp_dir.path().join("link");
        assert_eq!(
            fs_ops.create_hardlink(&original, &link).unwrap(),
            LinkOutcome::Created
        );
        assert_eq!(fs::read(&link).unwrap(), b"data");

        #[cfg(unix)]
        assert_eq!(fs_ops.hardlink_count(&original).unwrap(), 2);
    }

    #[test]
    fn test_hardlink_already_exists() {
        let temp_dir = TempDir::new().unwrap();
        let original = temp_dir.path().join("original");
        let link = temp_dir.path().join("link");
        fs::write(&original, b"data").unwrap();
        fs::write(&link, b"other").unwrap();

        assert_eq!(
            NativeFs.create_hardlink(&original, &link).unwrap(),
            LinkOutcome::AlreadyExists
        );
    }

    #[test]
    fn test_hardlink_missing_original_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = NativeFs.create_hardlink(
            &temp_dir.path().join("missing"),
            &temp_dir.path().join("link"),
        );
        assert!(result.is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let link = temp_dir.path().join("link");
        let target = Path::new("../../../d/abc/def");

        assert_eq!(
            NativeFs
                .create_symlink(target, &link, Kind::Directory)
                .unwrap(),
            LinkOutcome::Created
        );
        assert_eq!(NativeFs.read_link(&link).unwrap(), target);
        assert_eq!(
            NativeFs
                .create_symlink(target, &link, Kind::Directory)
                .unwrap(),
            LinkOutcome::AlreadyExists
        );
    }

    #[test]
    fn test_copy_file_preserves_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("from");
        let to = temp_dir.path().join("to");
        fs::write(&from, b"payload").unwrap();
        let mtime = FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&from, mtime).unwrap();

        assert_eq!(NativeFs.copy_file(&from, &to).unwrap(), 7);
        let copied = fs::metadata(&to).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&copied), mtime);
    }

    #[test]
    fn test_same_device_for_siblings() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        assert!(same_device(&a, &b).unwrap());
    }
}
