//! Registry of backup destinations (GC roots).

use crate::error::{Error, Result};
use crate::store::Store;
use std::fs;
use std::path::{Path, PathBuf};

/// File in the store root listing registered destinations, one per line.
pub const ROOTS_FILE: &str = "roots";

/// Manages the backup destinations whose snapshots keep store objects alive.
pub struct RootRegistry<'a> {
    store: &'a Store,
}

impl<'a> RootRegistry<'a> {
    /// Create a new RootRegistry for the given store.
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    fn registry_path(&self) -> PathBuf {
        self.store.root().join(ROOTS_FILE)
    }

    fn validate(path: &Path) -> Result<String> {
        if !path.is_absolute() {
            return Err(Error::invalid_root(format!(
                "Root must be an absolute path: {}",
                path.display()
            )));
        }

        let line = path.to_str().ok_or_else(|| {
            Error::invalid_root(format!("Root is not valid UTF-8: {}", path.display()))
        })?;

        if line.contains('\n') || line.contains('\r') {
            return Err(Error::invalid_root("Root cannot contain line breaks"));
        }

        Ok(line.to_string())
    }

    /// Register a destination. Registering it again is a no-op.
    pub fn add(&self, path: &Path) -> Result<()> {
        let line = Self::validate(path)?;
        let mut roots = self.list()?;

        if roots.iter().any(|root| root == path) {
            return Ok(());
        }

        roots.push(PathBuf::from(line));
        self.write(&roots)
    }

    /// All registered destinations, in registration order.
    ///
    /// Blank lines and `#` comments are skipped.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let path = self.registry_path();

        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(PathBuf::from)
            .collect())
    }

    /// Unregister a destination.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let mut roots = self.list()?;
        let before = roots.len();
        roots.retain(|root| root != path);

        if roots.len() == before {
            return Err(Error::root_not_found(path));
        }

        self.write(&roots)
    }

    /// Rewrite the registry atomically.
    fn write(&self, roots: &[PathBuf]) -> Result<()> {
        let mut content = String::new();
        for root in roots {
            content.push_str(&root.to_string_lossy());
            content.push('\n');
        }

        let mut temp_file = tempfile::NamedTempFile::new_in(self.store.staging_dir())?;
        std::io::Write::write_all(&mut temp_file, content.as_bytes())?;
        temp_file.persist(self.registry_path())?;
        Ok(())
    }
}
