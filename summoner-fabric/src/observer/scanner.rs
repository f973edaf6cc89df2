//! Session scanner
//!
//! Enumerates live uuid-mode sessions by cursor-scanning for
//! `summoner:*:config` keys in batches of 100, parsing each descriptor
//! tolerantly (partial descriptors are skipped, never fatal), and diffing
//! against the previous scan to detect appearing and disappearing
//! sessions.

use crate::{config::StoreConfig, errors::Result, store::StoreClient};
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Pattern matching every uuid-mode session descriptor
pub const SESSION_KEY_PATTERN: &str = "summoner:*:config";

/// A tolerantly-parsed view of one session's descriptor
#[derive(Debug, Clone)]
pub struct ObservedSession {
    /// Session identifier (always present; parse fails without it)
    pub session_id: String,
    /// Key prefix
    pub prefix: String,
    /// Worker fan-out bound
    pub max_children: u32,
    /// Creation time as stored
    pub created_at: String,
    /// Mode string as stored
    pub mode: String,
    /// Monitor channel, possibly empty
    pub monitor_channel: String,
    /// Task lists
    pub task_queues: Vec<String>,
    /// First report list (shared queue in uuid mode)
    pub report_queue: String,
}

impl ObservedSession {
    /// Parse a descriptor leniently: `session_id` is required, every
    /// other field falls back to an empty default.
    pub fn from_config_json(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let session_id = value.get("session_id")?.as_str()?.to_string();
        if session_id.is_empty() {
            return None;
        }

        let str_field = |name: &str| -> String {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let task_queues = value
            .get("parent_to_child_lists")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let report_queue = value
            .get("child_to_parent_lists")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(Self {
            session_id,
            prefix: str_field("prefix"),
            max_children: value
                .get("max_children")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            created_at: str_field("created_at"),
            mode: str_field("mode"),
            monitor_channel: str_field("monitor_channel"),
            task_queues,
            report_queue,
        })
    }

    /// Creation time as a datetime, when it parses
    pub fn created_datetime(&self) -> Option<DateTime<FixedOffset>> {
        crate::messages::parse_timestamp(&self.created_at).ok()
    }
}

/// The scan diff: everything active now, plus what changed
#[derive(Debug, Default)]
pub struct ScanDiff {
    /// All sessions seen in this scan, newest first
    pub sessions: Vec<ObservedSession>,
    /// Sessions absent from the previous scan
    pub appeared: Vec<ObservedSession>,
    /// Ids present previously but gone now
    pub disappeared: Vec<String>,
}

/// Periodic session enumerator
pub struct SessionScanner {
    client: StoreClient,
    previous_ids: HashSet<String>,
    last_scan: Vec<ObservedSession>,
}

impl SessionScanner {
    /// Scanner against the configured store
    pub fn new(config: StoreConfig) -> Self {
        Self {
            client: StoreClient::new(config),
            previous_ids: HashSet::new(),
            last_scan: Vec::new(),
        }
    }

    /// One full enumeration, newest session first
    pub async fn scan_sessions(&mut self) -> Result<Vec<ObservedSession>> {
        let keys = self.client.scan_keys(SESSION_KEY_PATTERN).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.client.get(&key).await? else {
                continue;
            };
            match ObservedSession::from_config_json(&raw) {
                Some(session) => sessions.push(session),
                None => trace!(key, "skipping partial descriptor"),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(count = sessions.len(), "session scan complete");
        Ok(sessions)
    }

    /// Scan and report what appeared and disappeared since last time.
    /// The first scan reports every session as appeared.
    pub async fn scan_and_diff(&mut self) -> Result<ScanDiff> {
        let sessions = self.scan_sessions().await?;
        let current_ids: HashSet<String> =
            sessions.iter().map(|s| s.session_id.clone()).collect();

        let appeared = sessions
            .iter()
            .filter(|s| !self.previous_ids.contains(&s.session_id))
            .cloned()
            .collect();
        let disappeared = self
            .previous_ids
            .iter()
            .filter(|id| !current_ids.contains(*id))
            .cloned()
            .collect();

        self.previous_ids = current_ids;
        self.last_scan = sessions.clone();

        Ok(ScanDiff {
            sessions,
            appeared,
            disappeared,
        })
    }

    /// The most recent scan result
    pub fn cached_sessions(&self) -> &[ObservedSession] {
        &self.last_scan
    }

    /// Forget scan history (next diff reports everything as new)
    pub fn clear_cache(&mut self) {
        self.previous_ids.clear();
        self.last_scan.clear();
    }

    /// Depth of every task queue and the report queue of one session.
    /// Sampling failures (the session vanished mid-sample) are swallowed.
    pub async fn queue_lengths(&mut self, session: &ObservedSession) -> HashMap<String, i64> {
        let mut lengths = HashMap::new();
        for queue in &session.task_queues {
            if let Ok(len) = self.client.llen(queue).await {
                lengths.insert(queue.clone(), len);
            }
        }
        if !session.report_queue.is_empty() {
            if let Ok(len) = self.client.llen(&session.report_queue).await {
                lengths.insert(session.report_queue.clone(), len);
            }
        }
        lengths
    }
}
