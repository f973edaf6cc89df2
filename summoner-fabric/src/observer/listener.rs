//! Per-session monitor listener
//!
//! One listener per active session: a dedicated subscriber on the
//! session's monitor channel feeding a bounded FIFO of parsed records.
//! When the queue is full the oldest record is dropped, never the newest.

use crate::{
    config::StoreConfig,
    errors::Result,
    messages::MonitorEnvelope,
    store::{ChannelMessage, Subscriber},
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Bound on buffered records per session
pub const QUEUE_CAPACITY: usize = 1000;

/// One monitor-channel record, parsed and labelled for display
#[derive(Debug, Clone)]
pub struct MonitorRecord {
    /// Receipt time, ISO-8601 with offset
    pub timestamp: String,
    /// Channel the envelope arrived on
    pub channel: String,
    /// Queue named inside the monitor envelope
    pub queue: String,
    /// Inner message `type` tag, or "unknown"
    pub message_type: String,
    /// Display sender ("moogle", "chocobo-N", "chocobo", "unknown")
    pub sender: String,
    /// Display receiver
    pub receiver: String,
    /// Short display content (prompt, result, event, reason)
    pub content: String,
    /// Inner message as parsed JSON, when it parsed
    pub data: Option<Value>,
    /// Raw published payload
    pub raw: String,
}

impl MonitorRecord {
    /// Build a record from a raw channel payload. Anything that fails to
    /// parse still yields a record, tagged "unknown".
    pub fn from_channel_message(message: &ChannelMessage) -> Self {
        let mut record = Self {
            timestamp: crate::messages::now_timestamp(),
            channel: message.channel.clone(),
            queue: String::new(),
            message_type: "unknown".to_string(),
            sender: "unknown".to_string(),
            receiver: "unknown".to_string(),
            content: String::new(),
            data: None,
            raw: message.payload.clone(),
        };

        let Ok(envelope) = MonitorEnvelope::from_json(&message.payload) else {
            // Lifecycle events (initialized/cleanup) publish bare JSON.
            if let Ok(value) = serde_json::from_str::<Value>(&message.payload) {
                if let Some(event) = value.get("event").and_then(Value::as_str) {
                    record.message_type = event.to_string();
                    record.content = event.to_string();
                    record.sender = "summoner".to_string();
                    record.receiver = "observer".to_string();
                }
                record.data = Some(value);
            }
            return record;
        };

        record.queue = envelope.queue.clone();
        let Ok(inner) = serde_json::from_str::<Value>(&envelope.message) else {
            record.content = envelope.message;
            return record;
        };

        let msg_type = inner
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let (sender, receiver, content) = derive_labels(&msg_type, &inner, &envelope.queue);
        record.message_type = msg_type;
        record.sender = sender;
        record.receiver = receiver;
        record.content = content;
        record.data = Some(inner);
        record
    }

    /// `sender → receiver` for one-line displays
    pub fn flow(&self) -> String {
        format!("{} → {}", self.sender, self.receiver)
    }
}

/// Display labelling: tasks flow moogle → chocobo-N (slot taken from the
/// queue name suffix), reports and statuses flow chocobo-N → moogle
/// (slot taken from `child_id`), shutdowns flow moogle → chocobo-N or
/// plain "chocobo" when no target can be determined.
fn derive_labels(msg_type: &str, inner: &Value, queue: &str) -> (String, String, String) {
    let child_from_payload = inner
        .get("chocobo_id")
        .or_else(|| inner.get("child_id"))
        .and_then(Value::as_u64);
    let chocobo_from_payload = || match child_from_payload {
        Some(id) => format!("chocobo-{id}"),
        None => "chocobo".to_string(),
    };
    let chocobo_from_queue = || match queue_slot(queue) {
        Some(id) => format!("chocobo-{id}"),
        None => chocobo_from_payload(),
    };
    let text_field = |name: &str| {
        inner
            .get(name)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };

    match msg_type {
        "task" => {
            let content = {
                let instruction = text_field("instruction");
                if instruction.is_empty() {
                    text_field("prompt")
                } else {
                    instruction
                }
            };
            ("moogle".to_string(), chocobo_from_queue(), content)
        },
        "report" => (chocobo_from_payload(), "moogle".to_string(), text_field("result")),
        "status" => (chocobo_from_payload(), "moogle".to_string(), text_field("event")),
        "shutdown" => {
            let receiver = match inner.get("target_child_id").and_then(Value::as_u64) {
                Some(id) => format!("chocobo-{id}"),
                None => match queue_slot(queue) {
                    Some(id) => format!("chocobo-{id}"),
                    None => "chocobo".to_string(),
                },
            };
            ("moogle".to_string(), receiver, text_field("reason"))
        },
        _ => (
            "unknown".to_string(),
            "unknown".to_string(),
            text_field("task_id"),
        ),
    }
}

/// Slot number from a queue name like `…:tasks:3` or `…:p2c:3`
fn queue_slot(queue: &str) -> Option<u64> {
    queue.rsplit(':').next()?.parse().ok()
}

/// Bounded FIFO shared between the subscriber task and the presenter
type RecordQueue = Arc<Mutex<VecDeque<MonitorRecord>>>;

/// A live subscription to one session's monitor channel
pub struct SessionListener {
    session_id: String,
    subscriber: Subscriber,
    queue: RecordQueue,
    dropped: Arc<AtomicUsize>,
}

impl SessionListener {
    /// Subscribe to `channel` and start buffering records
    pub async fn start(config: &StoreConfig, session_id: &str, channel: &str) -> Result<Self> {
        let queue: RecordQueue = Arc::new(Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)));
        let dropped = Arc::new(AtomicUsize::new(0));

        let handler_queue = queue.clone();
        let handler_dropped = dropped.clone();
        let handler = Arc::new(move |message: ChannelMessage| {
            let record = MonitorRecord::from_channel_message(&message);
            let mut buffer = handler_queue.lock().expect("record queue lock poisoned");
            if buffer.len() >= QUEUE_CAPACITY {
                buffer.pop_front();
                handler_dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(record);
        });

        let listener_session = session_id.to_string();
        let on_error = Arc::new(move |err: crate::errors::FabricError| {
            warn!(session_id = %listener_session, error = %err, "monitor listener lost");
        });

        let subscriber = Subscriber::subscribe(config, channel, handler, Some(on_error)).await?;
        Ok(Self {
            session_id: session_id.to_string(),
            subscriber,
            queue,
            dropped,
        })
    }

    /// Session this listener belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Take up to `max` buffered records, oldest first
    pub fn drain(&self, max: usize) -> Vec<MonitorRecord> {
        let mut buffer = self.queue.lock().expect("record queue lock poisoned");
        let take = max.min(buffer.len());
        buffer.drain(..take).collect()
    }

    /// Buffered record count
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("record queue lock poisoned").len()
    }

    /// Records discarded because the buffer was full
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Is the underlying subscriber still alive?
    pub fn is_running(&self) -> bool {
        self.subscriber.is_running()
    }

    /// Unsubscribe and stop the background task
    pub async fn stop(self) {
        self.subscriber.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, MonitorEnvelope, ReportMessage, StatusEvent, StatusMessage, TaskMessage};
    use serde_json::json;

    fn channel_message(payload: String) -> ChannelMessage {
        ChannelMessage {
            channel: "summoner:abc:monitor".to_string(),
            payload,
        }
    }

    #[test]
    fn test_task_labelled_from_queue_suffix() {
        let task = Message::Task(TaskMessage::new("abc", 2, "count things"));
        let envelope = MonitorEnvelope::wrap("summoner:abc:tasks:2", task.to_json().unwrap());
        let record =
            MonitorRecord::from_channel_message(&channel_message(envelope.to_json().unwrap()));
        assert_eq!(record.message_type, "task");
        assert_eq!(record.flow(), "moogle → chocobo-2");
        assert_eq!(record.content, "count things");
    }

    #[test]
    fn test_report_labelled_from_child_id() {
        let report = Message::Report(ReportMessage::success("t", "abc", 3, json!("done"), None));
        let envelope = MonitorEnvelope::wrap("summoner:abc:reports", report.to_json().unwrap());
        let record =
            MonitorRecord::from_channel_message(&channel_message(envelope.to_json().unwrap()));
        assert_eq!(record.flow(), "chocobo-3 → moogle");
        assert_eq!(record.content, "done");
    }

    #[test]
    fn test_status_labelled_from_child_id() {
        let status = Message::Status(StatusMessage::new("abc", 1, StatusEvent::Ready));
        let envelope = MonitorEnvelope::wrap("status:1", status.to_json().unwrap());
        let record =
            MonitorRecord::from_channel_message(&channel_message(envelope.to_json().unwrap()));
        assert_eq!(record.flow(), "chocobo-1 → moogle");
        assert_eq!(record.content, "ready");
    }

    #[test]
    fn test_shutdown_without_target_falls_back() {
        let raw = r#"{"type":"shutdown","session_id":"abc","reason":"done","graceful":true}"#;
        let envelope = MonitorEnvelope::wrap("status:broadcast", raw.to_string());
        let record =
            MonitorRecord::from_channel_message(&channel_message(envelope.to_json().unwrap()));
        assert_eq!(record.flow(), "moogle → chocobo");
        assert_eq!(record.content, "done");
    }

    #[test]
    fn test_lifecycle_event_payload() {
        let payload = json!({"event": "initialized", "session_id": "abc"}).to_string();
        let record = MonitorRecord::from_channel_message(&channel_message(payload));
        assert_eq!(record.message_type, "initialized");
        assert_eq!(record.sender, "summoner");
    }

    #[test]
    fn test_garbage_payload_still_yields_record() {
        let record = MonitorRecord::from_channel_message(&channel_message("???".to_string()));
        assert_eq!(record.message_type, "unknown");
        assert_eq!(record.raw, "???");
    }
}
