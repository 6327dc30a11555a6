//! Cooperative cancellation.
//!
//! First signal: finish the current unit, leave a coherent cache, exit
//! cleanly. Second signal: abort immediately. Checked between zones, between
//! ray batches, and after each DEM tile fetch.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::{ViewshedError, ViewshedResult};

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal a graceful shutdown; a second call upgrades to force quit.
    pub fn request(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            self.force.store(true, Ordering::SeqCst);
        }
    }

    pub fn request_force(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.force.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Error out of the current unit if cancellation was signalled.
    pub fn checkpoint(&self) -> ViewshedResult<()> {
        if self.is_requested() {
            Err(ViewshedError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Remove partial cache artifacts (`*.tmp.*`) left behind by an interrupted
/// writer. Called on startup and on shutdown, both graceful and forced.
pub fn sweep_temp_files(dir: &Path) -> usize {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.contains(".tmp.") {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("failed to remove stale temp file {}: {}", name, e),
            }
        }
    }
    if removed > 0 {
        log::info!("swept {} stale temp file(s) from {}", removed, dir.display());
    }
    removed
}
