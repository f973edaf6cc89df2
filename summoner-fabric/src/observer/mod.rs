//! Live cross-session observer
//!
//! Aggregates every active uuid-mode session into one view: a scanner
//! task enumerates sessions every five seconds and keeps one monitor
//! subscriber per session alive; a presenter task drains the subscribers'
//! buffers twice a second and persists each record to the per-session
//! JSONL log; a sampler task collects queue depths every two seconds.
//! Errors are written to a rotating error log and never halt the
//! observer.

use crate::{config::StoreConfig, errors::Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub mod error_log;
pub mod listener;
pub mod log_store;
pub mod scanner;

pub use error_log::RotatingErrorLog;
pub use listener::{MonitorRecord, QUEUE_CAPACITY, SessionListener};
pub use log_store::{LogEntry, LogStorage};
pub use scanner::{ObservedSession, ScanDiff, SessionScanner};

/// Session enumeration cadence
pub const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Presenter drain cadence
pub const PRESENT_INTERVAL: Duration = Duration::from_millis(500);

/// Queue-depth sampling cadence
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Records drained per listener per presenter pass
const PRESENT_BATCH: usize = 100;

/// Aggregate queue depths for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    /// Sum of task-queue lengths
    pub tasks: i64,
    /// Report-queue length
    pub reports: i64,
}

impl QueueDepths {
    /// Tasks plus reports
    pub fn total(&self) -> i64 {
        self.tasks + self.reports
    }
}

struct ObserverState {
    config: StoreConfig,
    scanner: SessionScanner,
    sessions: HashMap<String, ObservedSession>,
    listeners: HashMap<String, SessionListener>,
    log_storage: LogStorage,
    error_log: RotatingErrorLog,
    depths: HashMap<String, QueueDepths>,
}

impl ObserverState {
    /// Rescan sessions; subscribe to new ones, drop vanished ones, and
    /// rebuild listeners whose subscriber died since the last pass.
    async fn tick_scan(&mut self) {
        let diff = match self.scanner.scan_and_diff().await {
            Ok(diff) => diff,
            Err(err) => {
                self.error_log.log_error("Observer::tick_scan", &err, &[]);
                return;
            },
        };

        for session_id in &diff.disappeared {
            if let Some(listener) = self.listeners.remove(session_id) {
                debug!(session_id, "session gone, unsubscribing");
                listener.stop().await;
            }
            self.sessions.remove(session_id);
            self.depths.remove(session_id);
        }

        for session in &diff.sessions {
            self.sessions
                .insert(session.session_id.clone(), session.clone());
            if session.monitor_channel.is_empty() {
                continue;
            }
            let dead = self
                .listeners
                .get(&session.session_id)
                .is_some_and(|l| !l.is_running());
            if dead {
                if let Some(listener) = self.listeners.remove(&session.session_id) {
                    listener.stop().await;
                }
            }
            if !self.listeners.contains_key(&session.session_id) {
                match SessionListener::start(
                    &self.config,
                    &session.session_id,
                    &session.monitor_channel,
                )
                .await
                {
                    Ok(listener) => {
                        info!(session_id = %session.session_id, "monitoring session");
                        self.listeners.insert(session.session_id.clone(), listener);
                    },
                    Err(err) => self.error_log.log_error(
                        "Observer::tick_scan",
                        &err,
                        &[("session_id", session.session_id.clone())],
                    ),
                }
            }
        }
    }

    /// Drain every listener and persist the records as JSONL lines.
    fn tick_present(&mut self) {
        for (session_id, listener) in &self.listeners {
            for record in listener.drain(PRESENT_BATCH) {
                let entry = LogEntry {
                    timestamp: record.timestamp.clone(),
                    session_id: session_id.clone(),
                    msg_type: record.message_type.clone(),
                    sender: record.flow(),
                    content: record.content.clone(),
                    raw_data: record.data.clone(),
                };
                if let Err(err) = self.log_storage.save(&entry) {
                    self.error_log.log_error(
                        "Observer::tick_present",
                        &err,
                        &[("session_id", session_id.clone())],
                    );
                }
            }
        }
    }

    /// Refresh queue-depth aggregates for every active session.
    /// Individual sampling failures are swallowed by the scanner.
    async fn tick_sample(&mut self) {
        let sessions: Vec<ObservedSession> = self.sessions.values().cloned().collect();
        for session in sessions {
            let lengths = self.scanner.queue_lengths(&session).await;
            let mut depths = QueueDepths::default();
            for (queue, length) in lengths {
                if queue == session.report_queue {
                    depths.reports += length;
                } else {
                    depths.tasks += length;
                }
            }
            self.depths.insert(session.session_id.clone(), depths);
        }
    }

    async fn shutdown(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.stop().await;
        }
    }
}

/// The observer: shared state plus the three periodic tasks.
pub struct Observer {
    state: Arc<tokio::sync::Mutex<ObserverState>>,
    log_storage: LogStorage,
}

impl Observer {
    /// Observer over the configured store, logging under `log_storage`
    pub fn new(config: StoreConfig, log_storage: LogStorage, error_log: RotatingErrorLog) -> Self {
        let state = ObserverState {
            scanner: SessionScanner::new(config.clone()),
            config,
            sessions: HashMap::new(),
            listeners: HashMap::new(),
            log_storage: log_storage.clone(),
            error_log,
            depths: HashMap::new(),
        };
        Self {
            state: Arc::new(tokio::sync::Mutex::new(state)),
            log_storage,
        }
    }

    /// Observer with default log locations
    pub fn with_defaults(config: StoreConfig) -> Self {
        Self::new(config, LogStorage::default(), RotatingErrorLog::default())
    }

    /// Run one scan pass immediately
    pub async fn scan_now(&self) {
        self.state.lock().await.tick_scan().await;
    }

    /// Run one presenter pass immediately
    pub async fn present_now(&self) {
        self.state.lock().await.tick_present();
    }

    /// Run one sampling pass immediately
    pub async fn sample_now(&self) {
        self.state.lock().await.tick_sample().await;
    }

    /// Snapshot of the active sessions
    pub async fn active_sessions(&self) -> Vec<ObservedSession> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    /// Per-session queue depths from the last sampling pass
    pub async fn depths(&self) -> HashMap<String, QueueDepths> {
        self.state.lock().await.depths.clone()
    }

    /// Aggregate depth totals across all sessions
    pub async fn depth_totals(&self) -> QueueDepths {
        let state = self.state.lock().await;
        let mut totals = QueueDepths::default();
        for depths in state.depths.values() {
            totals.tasks += depths.tasks;
            totals.reports += depths.reports;
        }
        totals
    }

    /// Replay a session's persisted log (works after cleanup too)
    pub fn replay(&self, session_id: &str) -> Vec<LogEntry> {
        self.log_storage.load_messages(session_id)
    }

    /// Sessions with a log on disk
    pub fn logged_sessions(&self) -> Vec<String> {
        self.log_storage.list_sessions()
    }

    /// Spawn the scanner, presenter, and sampler tasks. The returned
    /// handle stops all three and tears down every subscriber.
    pub fn spawn(&self) -> ObserverTasks {
        let (stop_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(3);

        {
            let state = self.state.clone();
            let mut stop_rx = stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SCAN_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => state.lock().await.tick_scan().await,
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }
        {
            let state = self.state.clone();
            let mut stop_rx = stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PRESENT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => state.lock().await.tick_present(),
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }
        {
            let state = self.state.clone();
            let mut stop_rx = stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => state.lock().await.tick_sample().await,
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        ObserverTasks {
            stop: stop_tx,
            handles,
            state: self.state.clone(),
        }
    }
}

/// Handle over the three running observer tasks
pub struct ObserverTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    state: Arc<tokio::sync::Mutex<ObserverState>>,
}

impl ObserverTasks {
    /// Stop all tasks and close every subscriber
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        self.state.lock().await.shutdown().await;
        Ok(())
    }
}
