//! Pub/sub subscriber
//!
//! A subscriber owns a dedicated connection — never shared with command
//! traffic — and a background task that delivers channel payloads to a
//! handler in arrival order. On connection loss the optional error hook
//! fires and the subscriber tears down; owners that need the channel back
//! (the observer) re-subscribe on their next scan.

use crate::{
    config::StoreConfig,
    errors::{FabricError, Result},
    resp::{self, Frame},
    store::Connection,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A message delivered on a subscribed channel
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Channel the message arrived on
    pub channel: String,
    /// Raw payload as published
    pub payload: String,
}

/// Callback invoked for each arriving message, in arrival order
pub type MessageHandler = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// Callback invoked when the subscriber connection fails
pub type ErrorHook = Arc<dyn Fn(FabricError) + Send + Sync>;

/// A live subscription to one channel
pub struct Subscriber {
    channel: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Open a dedicated connection, subscribe to `channel`, and spawn the
    /// receive task. Returns once the server acknowledged the
    /// subscription.
    pub async fn subscribe(
        config: &StoreConfig,
        channel: &str,
        handler: MessageHandler,
        on_error: Option<ErrorHook>,
    ) -> Result<Self> {
        let mut conn = Connection::open(config).await?;
        conn.write_all(&resp::encode_command(&["SUBSCRIBE", channel]))
            .await?;

        let ack = tokio::time::timeout(config.socket_timeout(), conn.read_frame())
            .await
            .map_err(|_| FabricError::connection("subscribe acknowledgment timed out"))??;
        match ack {
            Frame::Array(ref items)
                if matches!(items.first(), Some(Frame::Bulk(kind)) if kind == "subscribe") => {},
            Frame::Error(msg) => return Err(FabricError::Protocol(msg)),
            other => {
                return Err(FabricError::unexpected_reply(
                    "subscribe acknowledgment",
                    other.describe(),
                ));
            },
        }
        debug!(channel, "subscribed");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut stop_requested = false;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        trace!(channel = %channel_name, "subscriber shutting down");
                        stop_requested = true;
                        break;
                    },
                    frame = conn.read_frame() => match frame {
                        Ok(frame) => {
                            if let Some(message) = push_payload(frame) {
                                handler(message);
                            }
                        },
                        Err(err) => {
                            warn!(channel = %channel_name, error = %err, "subscriber connection lost");
                            if let Some(hook) = &on_error {
                                hook(err);
                            }
                            break;
                        },
                    },
                }
            }
            if stop_requested {
                // Best-effort; the socket closes right after either way.
                let unsubscribe = resp::encode_command(&["UNSUBSCRIBE", &channel_name]);
                let _ = conn.write_all(&unsubscribe).await;
            }
        });

        Ok(Self {
            channel: channel.to_string(),
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Channel this subscriber is bound to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Is the receive task still alive?
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the receive task and close the connection.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!(channel = %self.channel, "subscriber task did not stop in time");
                task.abort();
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Extract the payload from a pub/sub push frame.
/// Push format: `["message", <channel>, <payload>]`. Subscription
/// bookkeeping frames (`subscribe`/`unsubscribe` acks) yield nothing.
fn push_payload(frame: Frame) -> Option<ChannelMessage> {
    let Frame::Array(items) = frame else {
        return None;
    };
    let mut iter = items.into_iter();
    let kind = match iter.next()? {
        Frame::Bulk(s) | Frame::Simple(s) => s,
        _ => return None,
    };
    if kind != "message" {
        return None;
    }
    let channel = match iter.next()? {
        Frame::Bulk(s) | Frame::Simple(s) => s,
        _ => return None,
    };
    let payload = match iter.next()? {
        Frame::Bulk(s) | Frame::Simple(s) => s,
        _ => return None,
    };
    Some(ChannelMessage { channel, payload })
}
