//! Session provisioning and lifecycle
//!
//! A session is a bounded coordination context identified by a key prefix.
//! Its authoritative record is the JSON descriptor at `<prefix>:config`,
//! which every other component loads by value. Two shapes exist:
//!
//! - **sequenced**: prefix `<project>-<host>-NNN`, per-slot task and
//!   report lists (`:p2c:<i>` / `:c2p:<i>`), numeric sequence allocated by
//!   probing for a free config key.
//! - **summoner** (uuid): prefix `summoner:<uuid>`, per-slot task lists
//!   (`:tasks:<i>`), one shared report list (`:reports`), and a monitor
//!   pub/sub channel mirroring every push.

use crate::{
    config::StoreConfig,
    errors::{FabricError, Result},
    messages::{new_id, now_timestamp},
    store::StoreClient,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Highest sequence number probed before giving up
pub const SEQUENCE_MAX_ATTEMPTS: u32 = 100;

/// Key-space prefix of uuid-mode sessions
pub const SUMMONER_PREFIX: &str = "summoner";

const MAX_HOST_LEN: usize = 12;

/// Which of the two session shapes a descriptor has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// `<project>-<host>-NNN` with per-slot report lists
    #[serde(rename = "normal")]
    Sequenced,
    /// `summoner:<uuid>` with a shared report list and monitor channel
    #[serde(rename = "summoner")]
    Summoner,
}

/// The authoritative record of a session, stored at `<prefix>:config`.
///
/// The JSON field names are the wire format other tooling already reads;
/// the Rust accessors speak in task/report-queue vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Opaque session identifier
    pub session_id: String,
    /// Key prefix shared by every name below
    pub prefix: String,
    /// Bound on worker fan-out
    pub max_children: u32,
    /// Creation time, ISO-8601 with offset
    pub created_at: String,
    /// Task list per worker slot, index 0 = slot 1
    #[serde(rename = "parent_to_child_lists", default)]
    pub task_queues: Vec<String>,
    /// Report lists: one per slot (sequenced) or a single shared list
    #[serde(rename = "child_to_parent_lists", default)]
    pub report_queues: Vec<String>,
    /// Append-only lifecycle event stream
    #[serde(default)]
    pub status_stream: String,
    /// Append-only completion artifact stream
    #[serde(default)]
    pub result_stream: String,
    /// Out-of-band wake/exit list
    #[serde(default)]
    pub control_list: String,
    /// Pub/sub mirror channel; empty outside summoner mode
    #[serde(default)]
    pub monitor_channel: String,
    /// Shape discriminator
    pub mode: SessionMode,
}

impl SessionDescriptor {
    /// Key the descriptor itself is stored under
    pub fn config_key(&self) -> String {
        format!("{}:config", self.prefix)
    }

    /// Task list for one worker slot (1-based)
    pub fn task_queue(&self, child_id: u32) -> Result<&str> {
        self.slot(&self.task_queues, child_id)
    }

    /// Report list a worker with this slot pushes to
    pub fn report_queue(&self, child_id: u32) -> Result<&str> {
        match self.mode {
            SessionMode::Summoner => self
                .report_queues
                .first()
                .map(String::as_str)
                .ok_or_else(|| FabricError::invalid_state("descriptor has no report queue")),
            SessionMode::Sequenced => self.slot(&self.report_queues, child_id),
        }
    }

    /// Every report list the dispatcher must watch
    pub fn report_queues(&self) -> &[String] {
        &self.report_queues
    }

    fn slot<'a>(&self, lists: &'a [String], child_id: u32) -> Result<&'a str> {
        if child_id < 1 || child_id > self.max_children {
            return Err(FabricError::ChildIdOutOfRange {
                child_id,
                max_children: self.max_children,
            });
        }
        lists
            .get(child_id as usize - 1)
            .map(String::as_str)
            .ok_or_else(|| FabricError::invalid_state("descriptor queue list is short"))
    }

    /// Does the session mirror pushes to a monitor channel?
    pub fn has_monitor(&self) -> bool {
        !self.monitor_channel.is_empty()
    }

    /// All store keys referenced by this session, descriptor included.
    /// The monitor channel is not a key; it is excluded.
    pub fn referenced_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        keys.extend(self.task_queues.iter().cloned());
        keys.extend(self.report_queues.iter().cloned());
        for name in [&self.status_stream, &self.result_stream, &self.control_list] {
            if !name.is_empty() {
                keys.push(name.clone());
            }
        }
        keys.push(self.config_key());
        keys
    }

    /// Encode the descriptor as its stored JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored descriptor
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| FabricError::parse_error(e.to_string(), raw))
    }
}

/// `<project>-<host>` from `PROJECT_NAME` and `HOSTNAME`, with the usual
/// defaults when unset
pub fn default_prefix_from_env() -> String {
    let project = std::env::var("PROJECT_NAME").unwrap_or_else(|_| "project".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    default_prefix(&project, &host)
}

/// `<project>-<host>` with the host truncated to twelve characters
pub fn default_prefix(project: &str, host: &str) -> String {
    let host = if host.len() > MAX_HOST_LEN {
        &host[..MAX_HOST_LEN]
    } else {
        host
    };
    format!("{project}-{host}")
}

/// Session id for sequenced sessions: epoch millis and pid
pub fn sequenced_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{millis}-{}", std::process::id())
}

/// Allocates, describes, and destroys sessions.
pub struct SessionManager {
    client: StoreClient,
}

impl SessionManager {
    /// Manager speaking to the configured store
    pub fn new(config: StoreConfig) -> Self {
        Self {
            client: StoreClient::new(config),
        }
    }

    /// Manager reusing an existing client
    pub fn from_client(client: StoreClient) -> Self {
        Self { client }
    }

    /// Create a sequenced session under `<project>-<host>-NNN`.
    ///
    /// Chooses the lowest free NNN in 1..=100 by probing config keys;
    /// concurrent creators may race, in which case callers retry on the
    /// observed collision.
    pub async fn create_sequenced(
        &mut self,
        project: &str,
        host: &str,
        max_children: u32,
        ttl: u64,
    ) -> Result<SessionDescriptor> {
        let base = default_prefix(project, host);
        self.create_sequenced_prefixed(&base, max_children, ttl).await
    }

    /// Create a sequenced session under an explicit `<base>-NNN` prefix
    pub async fn create_sequenced_prefixed(
        &mut self,
        base: &str,
        max_children: u32,
        ttl: u64,
    ) -> Result<SessionDescriptor> {
        let sequence = self.find_available_sequence(base).await?;
        let prefix = format!("{base}-{sequence:03}");

        let descriptor = SessionDescriptor {
            session_id: sequenced_session_id(),
            prefix: prefix.clone(),
            max_children,
            created_at: now_timestamp(),
            task_queues: (1..=max_children).map(|i| format!("{prefix}:p2c:{i}")).collect(),
            report_queues: (1..=max_children).map(|i| format!("{prefix}:c2p:{i}")).collect(),
            status_stream: format!("{prefix}:status"),
            result_stream: format!("{prefix}:results"),
            control_list: format!("{prefix}:control"),
            monitor_channel: String::new(),
            mode: SessionMode::Sequenced,
        };

        self.persist(&descriptor, ttl).await?;
        info!(prefix = %descriptor.prefix, max_children, "sequenced session created");
        Ok(descriptor)
    }

    /// Create a uuid-mode session under `summoner:<id>`.
    ///
    /// Generates a fresh random id unless one is supplied, and announces
    /// the session with an `initialized` event on its monitor channel.
    pub async fn create_summoner(
        &mut self,
        max_children: u32,
        ttl: u64,
        session_id: Option<String>,
    ) -> Result<SessionDescriptor> {
        let session_id = session_id.unwrap_or_else(new_id);
        let prefix = format!("{SUMMONER_PREFIX}:{session_id}");

        let descriptor = SessionDescriptor {
            session_id: session_id.clone(),
            prefix: prefix.clone(),
            max_children,
            created_at: now_timestamp(),
            task_queues: (1..=max_children).map(|i| format!("{prefix}:tasks:{i}")).collect(),
            report_queues: vec![format!("{prefix}:reports")],
            status_stream: format!("{prefix}:status"),
            result_stream: format!("{prefix}:results"),
            control_list: format!("{prefix}:control"),
            monitor_channel: format!("{prefix}:monitor"),
            mode: SessionMode::Summoner,
        };

        self.persist(&descriptor, ttl).await?;

        let announcement = json!({
            "event": "initialized",
            "session_id": descriptor.session_id,
            "max_children": descriptor.max_children,
            "created_at": descriptor.created_at,
        })
        .to_string();
        self.client
            .publish(&descriptor.monitor_channel, &announcement)
            .await?;

        info!(session_id = %descriptor.session_id, max_children, "summoner session created");
        Ok(descriptor)
    }

    /// Load a descriptor by its full prefix; `None` when absent
    pub async fn load_prefix(&mut self, prefix: &str) -> Result<Option<SessionDescriptor>> {
        let key = format!("{prefix}:config");
        let Some(raw) = self.client.get(&key).await? else {
            return Ok(None);
        };
        match SessionDescriptor::from_json(&raw) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(_) => Ok(None),
        }
    }

    /// Load a uuid-mode descriptor by session id; `None` when absent
    pub async fn load(&mut self, session_id: &str) -> Result<Option<SessionDescriptor>> {
        let prefix = format!("{SUMMONER_PREFIX}:{session_id}");
        self.load_prefix(&prefix).await
    }

    /// Destroy a session: delete every referenced key, then (summoner
    /// mode) publish a final `cleanup` event.
    ///
    /// Returns `true` when the descriptor existed when cleanup began;
    /// repeating a successful cleanup returns `false` with no side
    /// effects.
    pub async fn cleanup(&mut self, descriptor: &SessionDescriptor) -> Result<bool> {
        if !self.client.exists(&descriptor.config_key()).await? {
            debug!(prefix = %descriptor.prefix, "cleanup: session already gone");
            return Ok(false);
        }

        let keys = descriptor.referenced_keys();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.client.delete(&refs).await?;

        if descriptor.has_monitor() {
            let farewell = json!({
                "event": "cleanup",
                "session_id": descriptor.session_id,
                "timestamp": now_timestamp(),
            })
            .to_string();
            self.client
                .publish(&descriptor.monitor_channel, &farewell)
                .await?;
        }

        info!(prefix = %descriptor.prefix, "session cleaned up");
        Ok(true)
    }

    /// Cleanup by prefix; `false` when no session was found
    pub async fn cleanup_prefix(&mut self, prefix: &str) -> Result<bool> {
        match self.load_prefix(prefix).await? {
            Some(descriptor) => self.cleanup(&descriptor).await,
            None => Ok(false),
        }
    }

    /// Cleanup a uuid-mode session by id; `false` when not found
    pub async fn cleanup_session_id(&mut self, session_id: &str) -> Result<bool> {
        match self.load(session_id).await? {
            Some(descriptor) => self.cleanup(&descriptor).await,
            None => Ok(false),
        }
    }

    async fn find_available_sequence(&mut self, base: &str) -> Result<u32> {
        for sequence in 1..=SEQUENCE_MAX_ATTEMPTS {
            let key = format!("{base}-{sequence:03}:config");
            if !self.client.exists(&key).await? {
                return Ok(sequence);
            }
        }
        Err(FabricError::NoAvailableSequence {
            prefix: base.to_string(),
            max_attempts: SEQUENCE_MAX_ATTEMPTS,
        })
    }

    /// Write the descriptor and record the `initialized` stream event,
    /// TTL-bounding both keys.
    async fn persist(&mut self, descriptor: &SessionDescriptor, ttl: u64) -> Result<()> {
        let config_json = descriptor.to_json()?;
        self.client
            .set(&descriptor.config_key(), &config_json, Some(ttl))
            .await?;

        let max_children = descriptor.max_children.to_string();
        let mut fields = vec![
            ("event", "initialized"),
            ("session_id", descriptor.session_id.as_str()),
            ("max_children", max_children.as_str()),
            ("created_at", descriptor.created_at.as_str()),
        ];
        if descriptor.mode == SessionMode::Summoner {
            fields.insert(1, ("mode", "summoner"));
        }
        self.client.xadd(&descriptor.status_stream, &fields).await?;
        self.client.expire(&descriptor.status_stream, ttl).await?;
        Ok(())
    }
}
