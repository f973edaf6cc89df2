//! Worker runtime
//!
//! A worker (the "chocobo" role) owns one slot of a session: it blocks on
//! its task queue and the session control list, runs each task through a
//! handler, pushes a report, and emits status envelopes on the monitor
//! channel. Cancellation is cooperative — a shutdown envelope on the task
//! queue, a poison message on the control list, or an externally-set stop
//! flag all drain the loop.

use crate::{
    config::StoreConfig,
    errors::{FabricError, Result},
    messages::{
        Message, MonitorEnvelope, ReportMessage, ReportStatus, StatusEvent, StatusMessage,
        TaskMessage, parse_message,
    },
    session::{SUMMONER_PREFIX, SessionDescriptor},
    store::StoreClient,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Error code attached to reports produced from a raised handler
pub const TASK_EXECUTION_ERROR_CODE: &str = "E_TASK_EXECUTION";

/// Executes one task and produces its result payload.
///
/// Returning `Err` yields a failure report carrying the message in
/// `error` and [`TASK_EXECUTION_ERROR_CODE`] in `metadata.code`; it never
/// terminates the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one task to completion
    async fn handle(&self, task: &TaskMessage) -> std::result::Result<Value, String>;
}

/// Default handler: brief simulated work, then a success summary
pub struct SimulatedHandler {
    /// Simulated processing time
    pub delay_ms: u64,
}

impl Default for SimulatedHandler {
    fn default() -> Self {
        Self { delay_ms: 100 }
    }
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, task: &TaskMessage) -> std::result::Result<Value, String> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        let summary: String = task.prompt.chars().take(50).collect();
        Ok(json!(format!("Processed: {summary}")))
    }
}

/// Observable worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Runtime created
    Starting,
    /// Loading the session descriptor
    Connecting,
    /// Blocked waiting for work
    Idle,
    /// Handler running
    Busy,
    /// Report being pushed
    Reporting,
    /// Stop signalled; finishing up
    Draining,
    /// Absorbing final state
    Terminal,
}

/// Cooperative stop flag checked between loop iterations
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request the worker to drain and exit
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has a stop been requested?
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of one worker run
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerOutcome {
    /// Did the loop exit cleanly?
    pub success: bool,
    /// Session the worker belonged to
    pub session_id: String,
    /// Slot the worker served
    pub child_id: u32,
    /// Messages consumed that decoded as tasks
    pub tasks_received: u32,
    /// Tasks that produced a success report
    pub tasks_completed: u32,
    /// Tasks that produced a failure/error/timeout report
    pub tasks_failed: u32,
    /// Did a shutdown envelope end the loop?
    pub shutdown_received: bool,
    /// Failure description when `success` is false
    pub error: Option<String>,
    /// Wall time of the whole run
    pub duration_ms: u64,
}

/// One worker bound to one slot of one session.
pub struct Worker {
    session: String,
    child_id: u32,
    descriptor: Option<SessionDescriptor>,
    client: StoreClient,
    handler: Arc<dyn TaskHandler>,
    state: Arc<std::sync::Mutex<WorkerState>>,
    stop: StopHandle,
}

impl Worker {
    /// New worker. `session` is a uuid-mode session id or a full
    /// sequenced prefix; the descriptor is loaded on connect.
    pub fn new(
        config: StoreConfig,
        session: impl Into<String>,
        child_id: u32,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            client: StoreClient::new(config),
            session: session.into(),
            child_id,
            descriptor: None,
            handler,
            state: Arc::new(std::sync::Mutex::new(WorkerState::Starting)),
            stop: StopHandle::default(),
        }
    }

    /// Worker with the simulated default handler
    pub fn with_default_handler(config: StoreConfig, session: impl Into<String>, child_id: u32) -> Self {
        Self::new(config, session, child_id, Arc::new(SimulatedHandler::default()))
    }

    /// Handle for requesting a stop from another task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state lock poisoned")
    }

    fn set_state(&self, next: WorkerState) {
        *self.state.lock().expect("worker state lock poisoned") = next;
    }

    /// Load the session descriptor and validate the slot assignment.
    pub async fn connect(&mut self) -> Result<()> {
        self.set_state(WorkerState::Connecting);
        match self.try_connect().await {
            Ok(()) => {
                self.set_state(WorkerState::Idle);
                Ok(())
            },
            Err(err) => {
                self.set_state(WorkerState::Terminal);
                Err(err)
            },
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        let summoner_key = format!("{SUMMONER_PREFIX}:{}:config", self.session);
        let raw = match self.client.get(&summoner_key).await? {
            Some(raw) => raw,
            None => {
                let prefix_key = format!("{}:config", self.session);
                self.client
                    .get(&prefix_key)
                    .await?
                    .ok_or_else(|| FabricError::SessionNotFound(self.session.clone()))?
            },
        };
        let descriptor = SessionDescriptor::from_json(&raw)?;
        if self.child_id < 1 || self.child_id > descriptor.max_children {
            return Err(FabricError::ChildIdOutOfRange {
                child_id: self.child_id,
                max_children: descriptor.max_children,
            });
        }
        info!(
            session_id = %descriptor.session_id,
            child_id = self.child_id,
            task_queue = descriptor.task_queue(self.child_id)?,
            "worker connected"
        );
        self.descriptor = Some(descriptor);
        Ok(())
    }

    /// Run the receive loop until a shutdown envelope or control-list
    /// poison arrives, a stop is requested, or `max_tasks` tasks have
    /// completed or failed. `timeout_secs` bounds each blocking receive;
    /// an expired receive is not an error and simply re-enters the loop.
    pub async fn run(&mut self, max_tasks: Option<u32>, timeout_secs: u64) -> Result<WorkerOutcome> {
        let run_started = Instant::now();
        let mut outcome = WorkerOutcome {
            child_id: self.child_id,
            ..WorkerOutcome::default()
        };

        if self.descriptor.is_none() {
            if let Err(err) = self.connect().await {
                warn!(session = %self.session, error = %err, "worker failed to connect");
                outcome.error = Some(err.to_string());
                outcome.duration_ms = run_started.elapsed().as_millis() as u64;
                return Ok(outcome);
            }
        }
        let Some(descriptor) = self.descriptor.clone() else {
            return Err(FabricError::invalid_state("worker is not connected"));
        };
        outcome.session_id = descriptor.session_id.clone();

        let task_queue = descriptor.task_queue(self.child_id)?.to_string();
        let report_queue = descriptor.report_queue(self.child_id)?.to_string();
        let control_list = descriptor.control_list.clone();

        self.send_status(&descriptor, StatusEvent::Ready, None).await;

        loop {
            if self.stop.is_stopped() {
                debug!(child_id = self.child_id, "stop requested, draining");
                break;
            }
            if let Some(max) = max_tasks {
                if outcome.tasks_completed + outcome.tasks_failed >= max {
                    break;
                }
            }

            self.set_state(WorkerState::Idle);
            let lists = [task_queue.as_str(), control_list.as_str()];
            let popped = match self.client.blpop(&lists, timeout_secs).await {
                Ok(popped) => popped,
                Err(err) if err.is_connection_error() => {
                    warn!(error = %err, "receive failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                },
                Err(err) => {
                    self.set_state(WorkerState::Terminal);
                    return Err(err);
                },
            };

            let Some((list, raw)) = popped else {
                continue;
            };

            if list == control_list {
                info!(child_id = self.child_id, "control-list signal received, draining");
                break;
            }

            let message = match parse_message(&raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable message");
                    continue;
                },
            };

            match message {
                Message::Shutdown(shutdown) => {
                    info!(
                        child_id = self.child_id,
                        reason = %shutdown.reason,
                        "shutdown received"
                    );
                    outcome.shutdown_received = true;
                    break;
                },
                Message::Task(task) => {
                    outcome.tasks_received += 1;
                    let report = self.execute_task(&descriptor, &task).await;
                    if report.status.is_success() {
                        outcome.tasks_completed += 1;
                    } else {
                        outcome.tasks_failed += 1;
                    }

                    self.set_state(WorkerState::Reporting);
                    let encoded = Message::Report(report).to_json()?;
                    if let Err(err) = self.client.rpush(&report_queue, &[&encoded]).await {
                        warn!(error = %err, "report push failed");
                    } else if descriptor.has_monitor() {
                        self.mirror(&descriptor, &report_queue, &encoded).await;
                    }
                    self.send_status(&descriptor, StatusEvent::Ready, None).await;
                },
                other => {
                    debug!(message_type = other.message_type(), "dropping unexpected message");
                },
            }
        }

        self.set_state(WorkerState::Draining);
        self.send_status(&descriptor, StatusEvent::Stopped, None).await;
        self.set_state(WorkerState::Terminal);

        outcome.success = true;
        outcome.duration_ms = run_started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    /// Run the handler with timing and produce the matching report.
    async fn execute_task(&mut self, descriptor: &SessionDescriptor, task: &TaskMessage) -> ReportMessage {
        self.set_state(WorkerState::Busy);
        let details = json!({"task_id": task.task_id});
        self.send_status(descriptor, StatusEvent::Started, details.as_object().cloned())
            .await;

        let clock = Instant::now();
        let handled = match task.timeout {
            Some(limit) => {
                match tokio::time::timeout(Duration::from_secs(limit), self.handler.handle(task)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let duration = clock.elapsed().as_millis() as u64;
                        let mut report = ReportMessage::failure(
                            &task.task_id,
                            &descriptor.session_id,
                            self.child_id,
                            format!("task timed out after {limit}s"),
                            Some(duration),
                        );
                        report.status = ReportStatus::Timeout;
                        return report;
                    },
                }
            },
            None => self.handler.handle(task).await,
        };
        let duration = clock.elapsed().as_millis() as u64;

        match handled {
            Ok(result) => ReportMessage::success(
                &task.task_id,
                &descriptor.session_id,
                self.child_id,
                result,
                Some(duration),
            ),
            Err(message) => {
                let mut metadata = serde_json::Map::new();
                metadata.insert("code".to_string(), json!(TASK_EXECUTION_ERROR_CODE));
                ReportMessage::failure(
                    &task.task_id,
                    &descriptor.session_id,
                    self.child_id,
                    message,
                    Some(duration),
                )
                .with_metadata(metadata)
            },
        }
    }

    /// Publish a status envelope on the monitor channel. Status emission
    /// never fails the loop.
    async fn send_status(
        &mut self,
        descriptor: &SessionDescriptor,
        event: StatusEvent,
        details: Option<serde_json::Map<String, Value>>,
    ) {
        if !descriptor.has_monitor() {
            return;
        }
        let mut status = StatusMessage::new(&descriptor.session_id, self.child_id, event);
        if let Some(details) = details {
            status = status.with_details(details);
        }
        let Ok(encoded) = Message::Status(status).to_json() else {
            return;
        };
        let queue = format!("status:{}", self.child_id);
        self.mirror(descriptor, &queue, &encoded).await;
    }

    async fn mirror(&mut self, descriptor: &SessionDescriptor, queue: &str, encoded: &str) {
        let envelope = MonitorEnvelope::wrap(queue, encoded);
        let Ok(payload) = envelope.to_json() else {
            return;
        };
        let channel = descriptor.monitor_channel.clone();
        if let Err(err) = self.client.publish(&channel, &payload).await {
            warn!(error = %err, "monitor publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle() {
        let handle = StopHandle::default();
        assert!(!handle.is_stopped());
        let clone = handle.clone();
        clone.stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_simulated_handler_summarizes_prompt() {
        let handler = SimulatedHandler { delay_ms: 0 };
        let task = TaskMessage::new("s", 1, "Process data batch #1");
        let result = handler.handle(&task).await.unwrap();
        assert_eq!(result, json!("Processed: Process data batch #1"));
    }

    #[test]
    fn test_new_worker_starts_in_starting_state() {
        let worker = Worker::with_default_handler(StoreConfig::default(), "abc", 1);
        assert_eq!(worker.state(), WorkerState::Starting);
        assert!(!worker.stop_handle().is_stopped());
    }
}
