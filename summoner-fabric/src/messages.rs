//! Message envelopes and their JSON codec
//!
//! Every value pushed onto a queue or published on a channel is a
//! self-describing envelope carrying a `type` tag, a unique `message_id`,
//! an ISO-8601 `timestamp` with offset, the owning `session_id`, and the
//! variant-specific payload. Decoding dispatches on the tag; an unknown
//! tag is an error, a malformed payload is reported with the raw text.

use crate::errors::{FabricError, Result};
use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Fresh unique id for messages, tasks, and uuid-mode sessions
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time as ISO-8601 with timezone offset
pub fn now_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Parse an ISO-8601 timestamp. A trailing `Z` parses as UTC; offsets with
/// or without a colon are accepted.
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map_err(|e| FabricError::parse_error(format!("invalid timestamp: {e}"), value))
}

fn default_message_id() -> String {
    new_id()
}

fn default_timestamp() -> String {
    now_timestamp()
}

fn default_priority() -> u8 {
    3
}

/// Completion status carried by a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Task handler finished normally
    #[default]
    Success,
    /// Task handler finished and signalled failure
    Failure,
    /// Task handler raised
    Error,
    /// Task exceeded its deadline
    Timeout,
}

impl ReportStatus {
    /// Is this a successful completion?
    pub fn is_success(self) -> bool {
        matches!(self, ReportStatus::Success)
    }
}

/// Lifecycle event carried by a status envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEvent {
    /// Task accepted, handler about to run
    Started,
    /// Worker idle and ready to receive
    Ready,
    /// Worker occupied
    Busy,
    /// Work finished
    Completed,
    /// Worker exited
    Stopped,
}

/// A task instruction from the dispatcher to one worker slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TaskWire")]
pub struct TaskMessage {
    /// Unique envelope id
    pub message_id: String,
    /// Creation time, ISO-8601 with offset
    pub timestamp: String,
    /// Correlation id echoed back in the report
    pub task_id: String,
    /// Owning session
    pub session_id: String,
    /// Target worker slot, 1-based
    pub child_id: u32,
    /// The instruction text
    pub prompt: String,
    /// Free-form context passed through to the handler
    #[serde(default)]
    pub context: Map<String, Value>,
    /// 1 (highest) .. 5 (lowest)
    pub priority: u8,
    /// Advisory execution deadline in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Wire shape for task decoding: tolerates missing defaults and the
/// legacy `instruction` alias for `prompt` (`instruction` wins when both
/// are present).
#[derive(Deserialize)]
struct TaskWire {
    #[serde(default = "default_message_id")]
    message_id: String,
    #[serde(default = "default_timestamp")]
    timestamp: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    child_id: u32,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    context: Map<String, Value>,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    timeout: Option<u64>,
}

impl From<TaskWire> for TaskMessage {
    fn from(wire: TaskWire) -> Self {
        let prompt = match wire.instruction {
            Some(instruction) => instruction,
            None => wire.prompt,
        };
        let task_id = if wire.task_id.is_empty() {
            new_id()
        } else {
            wire.task_id
        };
        Self {
            message_id: wire.message_id,
            timestamp: wire.timestamp,
            task_id,
            session_id: wire.session_id,
            child_id: wire.child_id,
            prompt,
            context: wire.context,
            priority: wire.priority,
            timeout: wire.timeout,
        }
    }
}

impl TaskMessage {
    /// New task for one worker slot with default priority
    pub fn new(session_id: impl Into<String>, child_id: u32, prompt: impl Into<String>) -> Self {
        Self {
            message_id: new_id(),
            timestamp: now_timestamp(),
            task_id: new_id(),
            session_id: session_id.into(),
            child_id,
            prompt: prompt.into(),
            context: Map::new(),
            priority: default_priority(),
            timeout: None,
        }
    }

    /// Attach free-form context
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Set the priority, clamped into 1..=5
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    /// Set the advisory execution deadline
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }
}

/// A completion report from a worker back to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMessage {
    /// Unique envelope id
    #[serde(default = "default_message_id")]
    pub message_id: String,
    /// Creation time, ISO-8601 with offset
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
    /// The task this report answers
    #[serde(default)]
    pub task_id: String,
    /// Owning session
    #[serde(default)]
    pub session_id: String,
    /// Reporting worker slot
    #[serde(default)]
    pub child_id: u32,
    /// Completion status
    #[serde(default)]
    pub status: ReportStatus,
    /// Result payload, present iff success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text, present iff non-success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler wall time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ReportMessage {
    /// Successful completion
    pub fn success(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        child_id: u32,
        result: Value,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            message_id: new_id(),
            timestamp: now_timestamp(),
            task_id: task_id.into(),
            session_id: session_id.into(),
            child_id,
            status: ReportStatus::Success,
            result: Some(result),
            error: None,
            duration_ms,
            metadata: Map::new(),
        }
    }

    /// Failed completion
    pub fn failure(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        child_id: u32,
        error: impl Into<String>,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            message_id: new_id(),
            timestamp: now_timestamp(),
            task_id: task_id.into(),
            session_id: session_id.into(),
            child_id,
            status: ReportStatus::Failure,
            result: None,
            error: Some(error.into()),
            duration_ms,
            metadata: Map::new(),
        }
    }

    /// Attach free-form metadata
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An instruction for workers to wake and exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownMessage {
    /// Unique envelope id
    #[serde(default = "default_message_id")]
    pub message_id: String,
    /// Creation time, ISO-8601 with offset
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
    /// Owning session
    #[serde(default)]
    pub session_id: String,
    /// Why the shutdown was issued
    #[serde(default)]
    pub reason: String,
    /// Finish in-flight work before exiting?
    #[serde(default = "default_graceful")]
    pub graceful: bool,
    /// Target slot; `None` broadcasts to every slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_child_id: Option<u32>,
}

fn default_graceful() -> bool {
    true
}

impl ShutdownMessage {
    /// New shutdown envelope
    pub fn new(
        session_id: impl Into<String>,
        reason: impl Into<String>,
        graceful: bool,
        target_child_id: Option<u32>,
    ) -> Self {
        Self {
            message_id: new_id(),
            timestamp: now_timestamp(),
            session_id: session_id.into(),
            reason: reason.into(),
            graceful,
            target_child_id,
        }
    }
}

/// A worker lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Unique envelope id
    #[serde(default = "default_message_id")]
    pub message_id: String,
    /// Creation time, ISO-8601 with offset
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
    /// Owning session
    #[serde(default)]
    pub session_id: String,
    /// Reporting worker slot
    #[serde(default)]
    pub child_id: u32,
    /// Lifecycle event
    pub event: StatusEvent,
    /// Free-form details
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl StatusMessage {
    /// New status envelope
    pub fn new(session_id: impl Into<String>, child_id: u32, event: StatusEvent) -> Self {
        Self {
            message_id: new_id(),
            timestamp: now_timestamp(),
            session_id: session_id.into(),
            child_id,
            event,
            details: Map::new(),
        }
    }

    /// Attach free-form details
    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }
}

/// A decoded envelope of any variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Dispatcher → worker instruction
    Task(TaskMessage),
    /// Worker → dispatcher completion
    Report(ReportMessage),
    /// Wake-and-exit instruction
    Shutdown(ShutdownMessage),
    /// Worker lifecycle notification
    Status(StatusMessage),
}

impl Message {
    /// The wire tag of this variant
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Task(_) => "task",
            Message::Report(_) => "report",
            Message::Shutdown(_) => "shutdown",
            Message::Status(_) => "status",
        }
    }

    /// Session the envelope belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Message::Task(m) => &m.session_id,
            Message::Report(m) => &m.session_id,
            Message::Shutdown(m) => &m.session_id,
            Message::Status(m) => &m.session_id,
        }
    }

    /// Encode as a single-line JSON string (UTF-8, no ASCII escaping)
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode an envelope, dispatching on its `type` tag.
///
/// Unknown tags fail with [`FabricError::UnknownMessageType`]; payloads
/// that do not match their variant fail with the raw text attached.
pub fn parse_message(raw: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| FabricError::parse_error(e.to_string(), raw))?;
    let msg_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| FabricError::parse_error("missing 'type' field", raw))?
        .to_string();

    let message = match msg_type.as_str() {
        "task" => Message::Task(from_value(value, raw)?),
        "report" => Message::Report(from_value(value, raw)?),
        "shutdown" => Message::Shutdown(from_value(value, raw)?),
        "status" => Message::Status(from_value(value, raw)?),
        _ => return Err(FabricError::UnknownMessageType(msg_type)),
    };
    Ok(message)
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value, raw: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| FabricError::parse_error(e.to_string(), raw))
}

/// The wrapper published on a session's monitor channel for every list
/// push: the target queue, the original message verbatim, and the publish
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEnvelope {
    /// List the mirrored push targeted
    pub queue: String,
    /// Original message, as the JSON string that was pushed
    pub message: String,
    /// Publish time, ISO-8601 with offset
    pub timestamp: String,
}

impl MonitorEnvelope {
    /// Wrap a pushed payload for publication
    pub fn wrap(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }

    /// Encode as a single-line JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a published payload
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| FabricError::parse_error(e.to_string(), raw))
    }
}

/// UTC "now" helper for components that log in UTC
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
