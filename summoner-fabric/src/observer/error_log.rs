//! Size-rotated error log
//!
//! Observer errors must never halt the observer; they are appended to a
//! file that rotates at 10 MB with three backups (`.1` newest, `.3`
//! oldest). Logging itself is best-effort: I/O failures are swallowed.

use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default error log location
pub const DEFAULT_ERROR_LOG: &str = "/tmp/summoner-monitor-error.log";

/// Rotate when the file exceeds this many bytes
pub const MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Number of rotated backups to keep
pub const BACKUP_COUNT: u32 = 3;

/// Append-only error log with size-based rotation
#[derive(Debug, Clone)]
pub struct RotatingErrorLog {
    path: PathBuf,
    max_bytes: u64,
    backups: u32,
}

impl Default for RotatingErrorLog {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG)
    }
}

impl RotatingErrorLog {
    /// Log writing to `path` with the default rotation policy
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: MAX_BYTES,
            backups: BACKUP_COUNT,
        }
    }

    /// Override the rotation threshold (used by tests)
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// The active log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one error with its location and context pairs.
    pub fn log_error(&self, location: &str, error: &dyn Display, context: &[(&str, String)]) {
        let mut block = String::new();
        block.push_str(&"=".repeat(80));
        block.push('\n');
        block.push_str(&format!("Timestamp: {}\n", crate::messages::now_timestamp()));
        block.push_str(&format!("Location: {location}\n"));
        block.push_str(&format!("Error: {error}\n"));
        if !context.is_empty() {
            block.push_str("Context:\n");
            for (key, value) in context {
                block.push_str(&format!("  {key}: {value}\n"));
            }
        }
        block.push('\n');

        self.rotate_if_needed();
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = file.write_all(block.as_bytes());
        }
    }

    fn rotate_if_needed(&self) {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return;
        };
        if metadata.len() < self.max_bytes {
            return;
        }

        let backup = |n: u32| PathBuf::from(format!("{}.{n}", self.path.display()));
        let _ = fs::remove_file(backup(self.backups));
        for n in (1..self.backups).rev() {
            let _ = fs::rename(backup(n), backup(n + 1));
        }
        let _ = fs::rename(&self.path, backup(1));
    }
}
