//! # Summoner Orchestration Fabric
//!
//! A multi-agent orchestration fabric built atop a Redis-compatible
//! key/value store. A single orchestrator ("summoner") provisions a
//! session, a parent dispatcher ("moogle") fans tasks out over per-worker
//! lists, and N workers ("chocobo") block on their assigned lists, run
//! tasks, and push reports back. Every push can be mirrored on a pub/sub
//! monitor channel, which the observer aggregates across all live
//! sessions into a unified, JSONL-persisted view.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use summoner_fabric::{Dispatcher, SessionManager, StoreConfig, Worker};
//!
//! #[tokio::main]
//! async fn main() -> summoner_fabric::Result<()> {
//!     let config = StoreConfig::from_env();
//!
//!     let mut manager = SessionManager::new(config.clone());
//!     let session = manager.create_summoner(1, 3600, None).await?;
//!
//!     let mut worker = Worker::with_default_handler(config.clone(), session.session_id.clone(), 1);
//!     let runner = tokio::spawn(async move { worker.run(Some(1), 5).await });
//!
//!     let mut dispatcher = Dispatcher::connect(config, &session.session_id).await?;
//!     dispatcher.send_task(1, "Process A", None, None, None).await?;
//!     let report = dispatcher.receive_report(10).await?;
//!     println!("{report:?}");
//!
//!     runner.await.expect("worker task panicked")?;
//!     manager.cleanup(&session).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod config;
mod dispatcher;
mod errors;
pub mod messages;
pub mod observer;
mod session;
pub mod store;
mod worker;

/// RESP wire protocol codec
pub mod resp;

// Re-export main types and functions
pub use config::{DEFAULT_TTL_SECS, StoreConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use errors::{FabricError, Result};
pub use messages::{
    Message, MonitorEnvelope, ReportMessage, ReportStatus, ShutdownMessage, StatusEvent,
    StatusMessage, TaskMessage, parse_message,
};
pub use observer::{LogEntry, LogStorage, Observer, ObserverTasks, RotatingErrorLog};
pub use session::{
    SEQUENCE_MAX_ATTEMPTS, SUMMONER_PREFIX, SessionDescriptor, SessionManager, SessionMode,
    default_prefix, default_prefix_from_env,
};
pub use store::{ChannelMessage, StoreClient, StreamEntry, Subscriber};
pub use worker::{
    SimulatedHandler, StopHandle, TASK_EXECUTION_ERROR_CODE, TaskHandler, Worker, WorkerOutcome,
    WorkerState,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Dispatcher, FabricError, Message, ReportMessage, Result, SessionDescriptor,
        SessionManager, StoreClient, StoreConfig, TaskMessage, Worker,
    };
}
