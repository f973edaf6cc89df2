//! Parent-side task fan-out and report collection
//!
//! The dispatcher (the "moogle" role) loads a session descriptor, pushes
//! task envelopes onto per-slot queues, blocks on the report queue(s),
//! and commands shutdown. Every push is mirrored to the session's monitor
//! channel when one exists.

use crate::{
    config::StoreConfig,
    errors::{FabricError, Result},
    messages::{
        Message, MonitorEnvelope, ReportMessage, ShutdownMessage, TaskMessage, parse_message,
    },
    session::{SUMMONER_PREFIX, SessionDescriptor},
    store::StoreClient,
};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Granularity cap on each blocking receive inside an overall budget
const RECEIVE_SLICE_SECS: u64 = 5;

/// Result of one fan-out push
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchOutcome {
    /// Slot the task was aimed at
    pub child_id: u32,
    /// Correlation id of the task
    pub task_id: String,
    /// Did the push reach the store?
    pub ok: bool,
}

/// Parent dispatcher bound to one session.
#[derive(Debug)]
pub struct Dispatcher {
    descriptor: SessionDescriptor,
    client: StoreClient,
}

impl Dispatcher {
    /// Connect to a uuid-mode session by id. Fails with
    /// [`FabricError::SessionNotFound`] when the descriptor is absent.
    pub async fn connect(config: StoreConfig, session_id: &str) -> Result<Self> {
        Self::connect_prefix(config, &format!("{SUMMONER_PREFIX}:{session_id}")).await
    }

    /// Connect to a session by its full key prefix (either mode)
    pub async fn connect_prefix(config: StoreConfig, prefix: &str) -> Result<Self> {
        let mut client = StoreClient::new(config);
        let key = format!("{prefix}:config");
        let raw = client
            .get(&key)
            .await?
            .ok_or_else(|| FabricError::SessionNotFound(prefix.to_string()))?;
        let descriptor = SessionDescriptor::from_json(&raw)?;
        Ok(Self { descriptor, client })
    }

    /// Dispatcher over an already-loaded descriptor
    pub fn with_descriptor(config: StoreConfig, descriptor: SessionDescriptor) -> Self {
        Self {
            descriptor,
            client: StoreClient::new(config),
        }
    }

    /// The session this dispatcher drives
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Session id shorthand
    pub fn session_id(&self) -> &str {
        &self.descriptor.session_id
    }

    /// Send one task to one worker slot.
    ///
    /// Returns `(ok, task_id)`: a push that fails on the wire yields
    /// `ok = false` (the task id is still returned for correlation). A
    /// `child_id` outside `1..=max_children` is rejected outright.
    pub async fn send_task(
        &mut self,
        child_id: u32,
        prompt: &str,
        context: Option<Map<String, Value>>,
        priority: Option<u8>,
        timeout_secs: Option<u64>,
    ) -> Result<(bool, String)> {
        let mut task = TaskMessage::new(&self.descriptor.session_id, child_id, prompt);
        if let Some(context) = context {
            task = task.with_context(context);
        }
        if let Some(priority) = priority {
            task = task.with_priority(priority);
        }
        if let Some(timeout) = timeout_secs {
            task = task.with_timeout(timeout);
        }

        let queue = self.descriptor.task_queue(child_id)?.to_string();
        let task_id = task.task_id.clone();
        let encoded = Message::Task(task).to_json()?;

        let ok = self.push_mirrored(&queue, &encoded).await;
        Ok((ok, task_id))
    }

    /// Fan tasks out to slots 1..=len(prompts), capped by max_children.
    /// A failing slot does not abort the batch.
    pub async fn send_tasks_to_all(&mut self, prompts: &[String]) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::with_capacity(prompts.len());
        for (index, prompt) in prompts.iter().enumerate() {
            let child_id = index as u32 + 1;
            if child_id > self.descriptor.max_children {
                break;
            }
            let (ok, task_id) = self.send_task(child_id, prompt, None, None, None).await?;
            outcomes.push(DispatchOutcome {
                child_id,
                task_id,
                ok,
            });
        }
        Ok(outcomes)
    }

    /// Block for one report. `None` on timeout, and also when the popped
    /// value decodes to something other than a report (the value is
    /// discarded with a log entry).
    pub async fn receive_report(&mut self, timeout_secs: u64) -> Result<Option<ReportMessage>> {
        let queues: Vec<&str> = self
            .descriptor
            .report_queues()
            .iter()
            .map(String::as_str)
            .collect();
        let Some((list, raw)) = self.client.blpop(&queues, timeout_secs).await? else {
            return Ok(None);
        };
        match parse_message(&raw) {
            Ok(Message::Report(report)) => Ok(Some(report)),
            Ok(other) => {
                warn!(list, message_type = other.message_type(), "discarding non-report message");
                Ok(None)
            },
            Err(err) => {
                warn!(list, error = %err, "discarding undecodable message");
                Ok(None)
            },
        }
    }

    /// Receive until `expected_count` reports arrived or the overall
    /// budget elapsed. Each blocking call is bounded to at most five
    /// seconds so the deadline is honored; transient connection failures
    /// back off for a second and retry within the budget.
    pub async fn receive_all_reports(
        &mut self,
        expected_count: usize,
        overall_timeout_secs: u64,
    ) -> Result<Vec<ReportMessage>> {
        let mut reports = Vec::with_capacity(expected_count);
        let deadline = Instant::now() + Duration::from_secs(overall_timeout_secs);

        while reports.len() < expected_count {
            let remaining = deadline.saturating_duration_since(Instant::now()).as_secs();
            if remaining == 0 {
                break;
            }
            let slice = remaining.min(RECEIVE_SLICE_SECS).max(1);
            match self.receive_report(slice).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {},
                Err(err) if err.is_connection_error() => {
                    warn!(error = %err, "report receive failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                },
                Err(err) => return Err(err),
            }
        }
        Ok(reports)
    }

    /// Send a shutdown envelope. `target` of `None` broadcasts one
    /// envelope to every task queue; otherwise only that slot is
    /// signalled. Returns one ok flag per push.
    pub async fn send_shutdown(
        &mut self,
        reason: &str,
        graceful: bool,
        target_child_id: Option<u32>,
    ) -> Result<Vec<bool>> {
        let shutdown =
            ShutdownMessage::new(&self.descriptor.session_id, reason, graceful, target_child_id);
        let encoded = Message::Shutdown(shutdown).to_json()?;

        let queues: Vec<String> = match target_child_id {
            Some(child_id) => vec![self.descriptor.task_queue(child_id)?.to_string()],
            None => self.descriptor.task_queues.clone(),
        };

        let mut results = Vec::with_capacity(queues.len());
        for queue in &queues {
            results.push(self.push_mirrored(queue, &encoded).await);
        }
        Ok(results)
    }

    /// Push an out-of-band payload onto the session's control list
    pub async fn send_control(&mut self, payload: &str) -> Result<i64> {
        let list = self.descriptor.control_list.clone();
        self.client.rpush(&list, &[payload]).await
    }

    /// RPUSH plus monitor mirror. Push failures yield `false`; a failed
    /// mirror publish never fails an already-landed push.
    async fn push_mirrored(&mut self, queue: &str, encoded: &str) -> bool {
        match self.client.rpush(queue, &[encoded]).await {
            Ok(len) => {
                debug!(queue, list_length = len, "message pushed");
                if self.descriptor.has_monitor() {
                    let channel = self.descriptor.monitor_channel.clone();
                    let envelope = MonitorEnvelope::wrap(queue, encoded);
                    match envelope.to_json() {
                        Ok(payload) => {
                            if let Err(err) = self.client.publish(&channel, &payload).await {
                                warn!(queue, error = %err, "monitor publish failed");
                            }
                        },
                        Err(err) => warn!(error = %err, "monitor envelope encoding failed"),
                    }
                }
                true
            },
            Err(err) => {
                warn!(queue, error = %err, "push failed");
                false
            },
        }
    }
}
