//! Path and open-file registries
//!
//! A cycle owns the log-style files it references. Handles are opened at
//! commit and can be reopened by path on the log-rotation directive
//! without rebuilding the cycle.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tiller_core::Result;

/// One registered file, opened for appending.
pub struct OpenFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("path", &self.path)
            .field("open", &self.file.lock().is_some())
            .finish()
    }
}

impl OpenFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// Registered path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a handle is currently open.
    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn open(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }
}

/// The open-file registry owned by one cycle.
#[derive(Debug, Default)]
pub struct OpenFileRegistry {
    files: Vec<OpenFile>,
}

impl OpenFileRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path; the handle is opened at commit.
    ///
    /// Re-registering a path returns the existing entry's index.
    pub fn register(&mut self, path: impl Into<PathBuf>) -> usize {
        let path = path.into();
        if let Some(idx) = self.files.iter().position(|f| f.path == path) {
            return idx;
        }
        self.files.push(OpenFile::new(path));
        self.files.len() - 1
    }

    /// Number of registered files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Entry at `idx`.
    pub fn get(&self, idx: usize) -> Option<&OpenFile> {
        self.files.get(idx)
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = &OpenFile> {
        self.files.iter()
    }

    /// Open every registered file. Invoked once at commit.
    pub(crate) fn open_all(&self) -> Result<()> {
        for entry in &self.files {
            entry.open()?;
        }
        Ok(())
    }

    /// Reopen every registered file by path, releasing the old handles.
    ///
    /// This is the log-rotation directive: a rotated file keeps streaming
    /// through the old inode until its handle is replaced here.
    pub fn reopen_all(&self) -> Result<()> {
        for entry in &self.files {
            entry.open()?;
            tracing::info!(path = %entry.path.display(), "file reopened");
        }
        Ok(())
    }
}
