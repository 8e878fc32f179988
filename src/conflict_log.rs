//! Conflict audit log
//!
//! Append-only, human-readable record of every last-write-wins decision
//! the sync engine makes. An entry is written before the winning
//! transfer starts, so the log survives a transfer that later fails.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::providers::CloudError;

/// Default file name of the conflict log inside the config directory.
pub const CONFLICT_LOG_FILENAME: &str = "sync_actions.log";

/// Append-only conflict log at a fixed path.
pub struct ConflictLog {
    path: PathBuf,
}

impl ConflictLog {
    /// Open (and lazily create) a conflict log; parent directories are
    /// created up front so the first append cannot fail on a missing
    /// directory.
    pub fn new(path: &Path) -> Result<Self, CloudError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one conflict entry, stamped with the current UTC time.
    /// Logging failures are reported but never abort a sync pass.
    pub fn record(&self, message: &str) {
        warn!("CONFLICT: {}", message);
        let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let line = format!("[{}] CONFLICT: {}\n", stamp, message);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("could not append to conflict log '{}': {}", self.path.display(), e);
        }
    }
}
