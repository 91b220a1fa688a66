//! Process-wide unlink-on-exit registry.
//!
//! Staged files (profile-data copies, preprocessed sources) are registered
//! here the moment they exist, and removed when the process drains the list
//! on exit. The dispatcher takes a registry handle rather than touching the
//! global directly, so tests can substitute their own instance and observe
//! what got registered.

use once_cell::sync::Lazy;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

static GLOBAL: Lazy<CleanupRegistry> = Lazy::new(CleanupRegistry::new);

/// An append-only list of paths to unlink on exit. Appends are serialized.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    paths: Mutex<Vec<PathBuf>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance used by the binaries.
    pub fn global() -> &'static CleanupRegistry {
        &GLOBAL
    }

    /// Register a path for removal at exit.
    pub fn register(&self, path: impl Into<PathBuf>) -> io::Result<()> {
        let path = path.into();
        let mut paths = self
            .paths
            .lock()
            .map_err(|_| io::Error::other("cleanup registry poisoned"))?;
        debug!("registered for cleanup: {}", path.display());
        paths.push(path);
        Ok(())
    }

    /// Paths currently registered, oldest first.
    pub fn registered(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }

    /// Whether a specific path is registered.
    pub fn contains(&self, path: &Path) -> bool {
        self.paths
            .lock()
            .map(|paths| paths.iter().any(|p| p == path))
            .unwrap_or(false)
    }

    /// Unlink every registered file and empty the list.
    ///
    /// Missing files are fine; anything else gets a warning and is dropped
    /// from the list regardless.
    pub fn drain(&self) {
        let paths = match self.paths.lock() {
            Ok(mut paths) => std::mem::take(&mut *paths),
            Err(_) => return,
        };
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {}", path.display(), e),
            }
        }
    }
}
