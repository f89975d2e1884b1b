//! Durable "remember me" flag.
//!
//! The flag decides whether a persisted session may be restored at start-up.
//! It lives in a small marker file next to the persisted session so it
//! survives restarts; absence means "do not remember".

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// File name of the marker inside the data directory.
pub const REMEMBER_ME_FILE: &str = "nailbliss_remember_me";

pub trait PreferenceStore: Send + Sync {
    /// Whether the last successful sign-in asked to be remembered.
    fn remembered(&self) -> bool;

    fn set_remembered(&self, remember: bool) -> Result<()>;
}

/// Marker-file implementation.
pub struct FilePreferenceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePreferenceStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(REMEMBER_ME_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn remembered(&self) -> bool {
        let _guard = self.lock.lock();
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents.trim() == "true",
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not read remember-me flag, treating as unset"
                );
                false
            }
        }
    }

    fn set_remembered(&self, remember: bool) -> Result<()> {
        let _guard = self.lock.lock();
        if remember {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory {}", parent.display())
                })?;
            }
            std::fs::write(&self.path, "true")
                .with_context(|| format!("Failed to write {}", self.path.display()))?;
        } else {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", self.path.display()))
                }
            }
        }
        tracing::debug!(remember, "Remember-me flag updated");
        Ok(())
    }
}
