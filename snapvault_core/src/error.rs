//! Error types for snapvault_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using snapvault_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store, backup, GC and retention operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A source entry could not be read.
    #[error("Cannot access source {path}: {source}")]
    SourceAccess {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A source file's content changed between hashing and copying.
    #[error("Source {path} changed while it was being read")]
    SourceChanged { path: PathBuf },

    /// A path does not follow the canonical store encoding.
    #[error("Malformed identifier {path}: {reason}")]
    MalformedIdentifier { path: PathBuf, reason: String },

    /// The store contains something it should not.
    #[error("Store integrity error at {path}: {reason}")]
    StoreIntegrity { path: PathBuf, reason: String },

    /// Linked content has a different length than its source.
    #[error("Hash collision at {path}: expected {expected} bytes, found {actual}")]
    HashCollision {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The platform hardlink ceiling was reached for a store entry.
    #[error("Hardlink limit exceeded for {path}")]
    LinkLimitExceeded { path: PathBuf },

    /// Two sources map to the same name in the backup root.
    #[error("Duplicate source alias: {alias}")]
    DuplicateAlias { alias: String },

    /// Invalid backup, GC or retention configuration.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Insufficient rights to create symbolic links.
    #[error("Cannot create symbolic links in {path}: {source}")]
    Privilege {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Invalid root registry entry.
    #[error("Invalid root: {reason}")]
    InvalidRoot { reason: String },

    /// Root is not registered.
    #[error("Root not registered: {path}")]
    RootNotFound { path: PathBuf },

    /// Invalid directory entry.
    #[error("Invalid directory entry: {reason}")]
    InvalidTreeEntry { reason: String },

    /// Invalid retention rule.
    #[error("Invalid retention rule: {reason}")]
    InvalidRule { reason: String },
}

impl Error {
    /// Create a SourceAccess error.
    pub fn source_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::SourceAccess {
            path: path.into(),
            source,
        }
    }

    /// Create a SourceChanged error.
    pub fn source_changed(path: impl Into<PathBuf>) -> Self {
        Error::SourceChanged { path: path.into() }
    }

    /// Create a MalformedIdentifier error.
    pub fn malformed_identifier(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::MalformedIdentifier {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a StoreIntegrity error.
    pub fn store_integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::StoreIntegrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a HashCollision error.
    pub fn hash_collision(path: impl Into<PathBuf>, expected: u64, actual: u64) -> Self {
        Error::HashCollision {
            path: path.into(),
            expected,
            actual,
        }
    }

    /// Create a DuplicateAlias error.
    pub fn duplicate_alias(alias: impl Into<String>) -> Self {
        Error::DuplicateAlias {
            alias: alias.into(),
        }
    }

    /// Create a Configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a Privilege error.
    pub fn privilege(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Privilege {
            path: path.into(),
            source,
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidRoot error.
    pub fn invalid_root(reason: impl Into<String>) -> Self {
        Error::InvalidRoot {
            reason: reason.into(),
        }
    }

    /// Create a RootNotFound error.
    pub fn root_not_found(path: impl Into<PathBuf>) -> Self {
        Error::RootNotFound { path: path.into() }
    }

    /// Create an InvalidTreeEntry error.
    pub fn invalid_tree_entry(reason: impl Into<String>) -> Self {
        Error::InvalidTreeEntry {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRule error.
    pub fn invalid_rule(reason: impl Into<String>) -> Self {
        Error::InvalidRule {
            reason: reason.into(),
        }
    }

    /// Whether this error is confined to a single source entry.
    ///
    /// The builder recovers from these locally; everything else aborts.
    pub fn is_per_entry(&self) -> bool {
        matches!(
            self,
            Error::SourceAccess { .. }
                | Error::SourceChanged { .. }
                | Error::HashCollision { .. }
                | Error::InvalidTreeEntry { .. }
                | Error::LinkLimitExceeded { .. }
        )
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a pattern error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::configuration(err.to_string()),
        }
    }
}
