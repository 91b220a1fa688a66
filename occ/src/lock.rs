//! Local preprocessing slots.
//!
//! A slot is an advisory file lock under the state directory; holding one
//! bounds how many preprocessors run at once on this machine. The caller
//! acquires a slot before forking cpp and hands the guard to the
//! dispatcher, which releases it at the first point where a peer can
//! safely start preprocessing.
//!
//! Release is exactly-once by construction: `release` consumes the guard,
//! and `Drop` only unlocks when `release` never ran.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A held preprocessing slot.
#[derive(Debug)]
pub struct PreprocessSlot {
    file: File,
    path: PathBuf,
    released: bool,
}

impl PreprocessSlot {
    /// Acquire a slot, blocking on slot 0 when all are busy.
    ///
    /// Tries each of `slots` lock files without blocking first so idle
    /// slots are found quickly.
    pub fn acquire(dir: &Path, slots: u32) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        for n in 0..slots.max(1) {
            let file = Self::open_slot(dir, n)?;
            if file.try_lock_exclusive().is_ok() {
                debug!("acquired preprocess slot {n}");
                return Ok(Self::held(file, Self::slot_path(dir, n)));
            }
        }
        let file = Self::open_slot(dir, 0)?;
        file.lock_exclusive()?;
        debug!("acquired preprocess slot 0 after waiting");
        Ok(Self::held(file, Self::slot_path(dir, 0)))
    }

    /// Try to acquire any slot without blocking.
    pub fn try_acquire(dir: &Path, slots: u32) -> io::Result<Option<Self>> {
        std::fs::create_dir_all(dir)?;
        for n in 0..slots.max(1) {
            let file = Self::open_slot(dir, n)?;
            if file.try_lock_exclusive().is_ok() {
                debug!("acquired preprocess slot {n}");
                return Ok(Some(Self::held(file, Self::slot_path(dir, n))));
            }
        }
        Ok(None)
    }

    fn held(file: File, path: PathBuf) -> Self {
        Self {
            file,
            path,
            released: false,
        }
    }

    fn slot_path(dir: &Path, n: u32) -> PathBuf {
        dir.join(format!("preprocess_{n}.lock"))
    }

    fn open_slot(dir: &Path, n: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(Self::slot_path(dir, n))
    }

    /// Release the slot now. The one and only release point on the
    /// non-panic path.
    pub fn release(mut self) {
        self.unlock_now();
    }

    fn unlock_now(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match FileExt::unlock(&self.file) {
            Ok(()) => debug!("released preprocess slot {}", self.path.display()),
            Err(e) => warn!(
                "failed to release preprocess slot {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

impl Drop for PreprocessSlot {
    fn drop(&mut self) {
        // Backstop for unwinding paths; no-op after release().
        self.unlock_now();
    }
}
