//! Shared file catalog.
//!
//! A flat directory of regular files. Names are resolved directly under the
//! root; anything that could escape it is treated as absent.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info};

/// Catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No regular file with that name.
    #[error("File not found: {0}")]
    NotFound(String),

    /// The name could escape the shared directory.
    #[error("Invalid file name: {0}")]
    InvalidName(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A listed file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CatalogEntry {
    /// File name relative to the shared directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// A file opened for transfer.
#[derive(Debug)]
pub struct OpenedFile {
    /// Catalog entry at open time.
    pub entry: CatalogEntry,
    /// Open handle positioned at the start.
    pub file: File,
}

/// The shared file directory.
#[derive(Debug, Clone)]
pub struct SharedCatalog {
    root: PathBuf,
}

impl SharedCatalog {
    /// Create a catalog rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the catalog root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the shared directory if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn ensure_exists(&self) -> Result<(), CatalogError> {
        if fs::metadata(&self.root).await.is_err() {
            fs::create_dir_all(&self.root).await?;
            info!(dir = %self.root.display(), "Created shared directory");
        }
        Ok(())
    }

    /// List regular files, sorted by name.
    ///
    /// Entries whose names are not valid UTF-8, or that could not be
    /// requested back by name, are skipped. Listed names never contain a
    /// line break, so the announced count always matches the lines sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(item) = dir.next_entry().await? {
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if validate_file_name(&name).is_err() {
                debug!(file = %name, "Skipping file with unlistable name");
                continue;
            }
            // Follow symlinks, like a plain `stat`.
            match fs::metadata(item.path()).await {
                Ok(meta) if meta.is_file() => entries.push(CatalogEntry {
                    name,
                    size: meta.len(),
                }),
                Ok(_) => {}
                Err(e) => debug!(file = %name, error = %e, "Skipping unreadable entry"),
            }
        }

        entries.sort();
        Ok(entries)
    }

    /// Resolve a name to a path inside the shared directory.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidName`] for names with separators, `..`,
    /// or control characters.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, CatalogError> {
        validate_file_name(name).map_err(|_| CatalogError::InvalidName(name.to_string()))?;
        Ok(self.root.join(name))
    }

    /// Open a file for transfer.
    ///
    /// The size is taken from the open handle, so it matches what will be
    /// read.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidName`] for unsafe names,
    /// [`CatalogError::NotFound`] unless `name` is a regular file, or the
    /// underlying open failure.
    pub async fn open(&self, name: &str) -> Result<OpenedFile, CatalogError> {
        let path = self.resolve(name)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(CatalogError::NotFound(name.to_string()));
        }

        Ok(OpenedFile {
            entry: CatalogEntry {
                name: name.to_string(),
                size: meta.len(),
            },
            file,
        })
    }
}

/// Check that a requested name stays inside the shared directory.
///
/// # Errors
///
/// Returns an error message if the name is unsafe.
pub fn validate_file_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("file name cannot be empty");
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("file name contains a separator");
    }
    if name == "." || name.contains("..") {
        return Err("file name contains a parent reference");
    }
    if name.chars().any(char::is_control) {
        return Err("file name contains control characters");
    }
    Ok(())
}
