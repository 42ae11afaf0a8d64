//! Pid file lifecycle
//!
//! The pid file always names the process a control signal should reach.
//! During an upgrade the old master's file is renamed aside first, so the
//! name points at the new master the moment it writes its own; a failed
//! upgrade renames it back.

use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use tiller_core::{Error, Result};

/// A pid file owned by this process; removed on `delete`.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), pid = std::process::id(), "pid file written");
        Ok(Self { path })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename the file, keeping ownership of the new name.
    ///
    /// Used during an upgrade: the old master's pid file moves aside to
    /// the oldbin name before the new binary starts, and moves back if the
    /// start fails.
    pub fn rename(&mut self, to: impl Into<PathBuf>) -> Result<()> {
        let to = to.into();
        std::fs::rename(&self.path, &to)?;
        tracing::debug!(from = %self.path.display(), to = %to.display(), "pid file renamed");
        self.path = to;
        Ok(())
    }

    /// Remove the file. Idempotent; missing files are not an error.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "pid file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read the pid recorded in a pid file.
pub fn read_pid(path: impl AsRef<Path>) -> Result<Pid> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Signal(format!("cannot read pid file {}: {e}", path.display()))
    })?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| Error::Signal(format!("malformed pid file {}", path.display())))?;
    if pid <= 0 {
        return Err(Error::Signal(format!(
            "pid file {} names invalid pid {pid}",
            path.display()
        )));
    }
    Ok(Pid::from_raw(pid))
}
