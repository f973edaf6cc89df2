//! JSONL log persistence
//!
//! Per-session message logs at `<base>/<session_id>/messages.jsonl`: one
//! JSON object per line, appended with a single write so lines are never
//! interleaved. Logs survive session cleanup and back the historical
//! viewer.

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default log base directory
pub const DEFAULT_LOG_BASE: &str = "/tmp/summoner/monitor/logs";

/// One persisted log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Persist time, ISO-8601 with offset
    pub timestamp: String,
    /// Session the message belonged to
    pub session_id: String,
    /// Message type tag ("task", "report", ...)
    pub msg_type: String,
    /// Display sender
    pub sender: String,
    /// Display content
    pub content: String,
    /// Original message data, when available
    #[serde(default)]
    pub raw_data: Option<Value>,
}

/// Session-partitioned JSONL storage
#[derive(Debug, Clone)]
pub struct LogStorage {
    base_dir: PathBuf,
}

impl Default for LogStorage {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BASE)
    }
}

impl LogStorage {
    /// Storage rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The storage root
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    fn log_file(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("messages.jsonl")
    }

    /// Append one entry to its session's log. Directory creation is
    /// idempotent; the line lands with a single write.
    pub fn save(&self, entry: &LogEntry) -> Result<()> {
        fs::create_dir_all(self.session_dir(&entry.session_id))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(&entry.session_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Convenience append with the persist time stamped now
    pub fn save_message(
        &self,
        session_id: &str,
        msg_type: &str,
        sender: &str,
        content: &str,
        raw_data: Option<Value>,
    ) -> Result<()> {
        self.save(&LogEntry {
            timestamp: crate::messages::now_timestamp(),
            session_id: session_id.to_string(),
            msg_type: msg_type.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            raw_data,
        })
    }

    /// Replay a session's log. Missing files yield an empty list;
    /// malformed lines are skipped.
    pub fn load_messages(&self, session_id: &str) -> Vec<LogEntry> {
        let Ok(contents) = fs::read_to_string(self.log_file(session_id)) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Session ids that have a log on disk, sorted
    pub fn list_sessions(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut sessions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join("messages.jsonl").is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        sessions.sort();
        sessions
    }

    /// Number of persisted lines for a session
    pub fn message_count(&self, session_id: &str) -> usize {
        let Ok(contents) = fs::read_to_string(self.log_file(session_id)) else {
            return 0;
        };
        contents.lines().filter(|line| !line.trim().is_empty()).count()
    }

    /// Remove a session's log file. `true` when the file no longer
    /// exists afterwards.
    pub fn clear_session(&self, session_id: &str) -> bool {
        let path = self.log_file(session_id);
        if !path.exists() {
            return true;
        }
        fs::remove_file(path).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> (tempfile::TempDir, LogStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LogStorage::new(dir.path());
        (dir, storage)
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, storage) = storage();
        storage
            .save_message("sess-1", "task", "moogle", "do it", Some(json!({"k": 1})))
            .unwrap();
        storage
            .save_message("sess-1", "report", "chocobo-1", "done", None)
            .unwrap();

        let entries = storage.load_messages("sess-1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].msg_type, "task");
        assert_eq!(entries[1].sender, "chocobo-1");
        assert_eq!(entries[0].raw_data, Some(json!({"k": 1})));
    }

    #[test]
    fn test_missing_session_loads_empty() {
        let (_dir, storage) = storage();
        assert!(storage.load_messages("nope").is_empty());
        assert_eq!(storage.message_count("nope"), 0);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let (_dir, storage) = storage();
        storage
            .save_message("sess-1", "task", "moogle", "ok", None)
            .unwrap();
        let path = storage.base_dir().join("sess-1").join("messages.jsonl");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{broken\n");
        fs::write(&path, contents).unwrap();

        assert_eq!(storage.load_messages("sess-1").len(), 1);
        assert_eq!(storage.message_count("sess-1"), 2);
    }

    #[test]
    fn test_list_and_clear_sessions() {
        let (_dir, storage) = storage();
        storage.save_message("b", "task", "s", "c", None).unwrap();
        storage.save_message("a", "task", "s", "c", None).unwrap();
        assert_eq!(storage.list_sessions(), vec!["a", "b"]);

        assert!(storage.clear_session("a"));
        assert!(storage.clear_session("a"));
        assert_eq!(storage.list_sessions(), vec!["b"]);
    }
}
