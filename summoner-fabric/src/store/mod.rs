//! Store client
//!
//! Command/reply access to a Redis-compatible server over the RESP wire
//! protocol, plus the persistent subscriber connection in [`subscriber`].
//!
//! One instance owns one command socket. The connection is opened lazily
//! and re-opened on demand after a failure; command and pub/sub traffic
//! never share a socket.

use crate::{
    config::StoreConfig,
    errors::{FabricError, Result},
    resp::{self, Frame},
};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

pub mod subscriber;

pub use subscriber::{ChannelMessage, ErrorHook, MessageHandler, Subscriber};

/// Extra read-deadline slack on blocking pops, beyond the requested
/// timeout. The server answers a timed-out BLPOP itself; the deadline only
/// trips when the server has stalled.
const BLOCKING_GRACE_SECS: u64 = 2;

/// A framed RESP connection: TCP stream plus read buffer.
#[derive(Debug)]
pub(crate) struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    /// Open a connection, honoring the configured connect deadline.
    pub(crate) async fn open(config: &StoreConfig) -> Result<Self> {
        let addr = config.addr();
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                FabricError::connection(format!("Connection to {addr} timed out"))
            })?
            .map_err(|e| FabricError::connection(format!("Cannot connect to store at {addr}: {e}")))?;

        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
        })
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Read one complete frame, buffering until the parser is satisfied.
    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some((frame, consumed)) = resp::parse_frame(&self.buffer)? {
                self.buffer.advance(consumed);
                trace!(frame = %frame.describe(), "frame received");
                return Ok(frame);
            }
            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(FabricError::connection("connection closed by server"));
            }
        }
    }
}

/// One entry read back from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Server-assigned entry id
    pub id: String,
    /// Field/value pairs in stored order
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Decode an `[id, [field, value, ...]]` reply element
    fn from_frame(frame: Frame) -> Option<Self> {
        let Frame::Array(parts) = frame else {
            return None;
        };
        let mut parts = parts.into_iter();
        let id = parts.next()?.into_string().ok().flatten()?;
        let mut fields = Vec::new();
        if let Some(Frame::Array(raw_fields)) = parts.next() {
            let mut iter = raw_fields.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                let (Ok(Some(key)), Ok(Some(value))) = (key.into_string(), value.into_string())
                else {
                    continue;
                };
                fields.push((key, value));
            }
        }
        Some(Self { id, fields })
    }
}

/// Command/reply client for the store.
///
/// All operations surface server `-` replies as [`FabricError::Protocol`]
/// and transport failures as [`FabricError::Connection`]; blocking pops
/// report an elapsed timeout as `Ok(None)`.
#[derive(Debug)]
pub struct StoreClient {
    config: StoreConfig,
    conn: Option<Connection>,
}

impl StoreClient {
    /// Create a client; the socket is opened on first use
    pub fn new(config: StoreConfig) -> Self {
        Self { config, conn: None }
    }

    /// Client against the environment-configured store
    pub fn from_env() -> Self {
        Self::new(StoreConfig::from_env())
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Drop the command socket. The next command reconnects.
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Send one command and read its reply.
    ///
    /// `deadline` of `None` waits forever (used by zero-timeout blocking
    /// pops); `Some(d)` returns `Ok(None)` if no reply arrives within `d`,
    /// after discarding the connection since the reply stream can no
    /// longer be trusted to be aligned.
    async fn exchange(&mut self, args: &[&str], deadline: Option<Duration>) -> Result<Option<Frame>> {
        if self.conn.is_none() {
            debug!(addr = %self.config.addr(), "connecting to store");
            self.conn = Some(Connection::open(&self.config).await?);
        }
        let payload = resp::encode_command(args);

        // Outcome is computed in an inner scope so the connection borrow
        // ends before the failure paths discard the connection.
        let outcome: Option<Result<Frame>> = {
            let Some(conn) = self.conn.as_mut() else {
                return Err(FabricError::connection("connection unavailable"));
            };
            let io = async {
                conn.write_all(&payload).await?;
                conn.read_frame().await
            };
            match deadline {
                Some(limit) => tokio::time::timeout(limit, io).await.ok(),
                None => Some(io.await),
            }
        };

        match outcome {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => {
                self.conn = None;
                Err(err)
            },
            None => {
                warn!(command = args.first().copied().unwrap_or(""), "read deadline elapsed");
                self.conn = None;
                Ok(None)
            },
        }
    }

    /// Command with the standard socket read deadline
    async fn command(&mut self, args: &[&str]) -> Result<Frame> {
        let deadline = self.config.socket_timeout();
        self.exchange(args, Some(deadline))
            .await?
            .ok_or_else(|| FabricError::connection("command reply timed out"))
    }

    /// Check connectivity
    pub async fn ping(&mut self) -> Result<bool> {
        let frame = self.command(&["PING"]).await?;
        Ok(matches!(frame, Frame::Simple(ref s) if s == "PONG"))
    }

    /// Set a key, optionally with a TTL in seconds
    pub async fn set(&mut self, key: &str, value: &str, ttl: Option<u64>) -> Result<bool> {
        let ttl_arg;
        let args: Vec<&str> = match ttl {
            Some(secs) => {
                ttl_arg = secs.to_string();
                vec!["SET", key, value, "EX", &ttl_arg]
            },
            None => vec!["SET", key, value],
        };
        let frame = self.command(&args).await?;
        match frame {
            Frame::Simple(ref s) if s == "OK" => Ok(true),
            Frame::Error(msg) => Err(FabricError::Protocol(msg)),
            other => Err(FabricError::unexpected_reply("OK", other.describe())),
        }
    }

    /// Get a key's value; `None` when the key is absent
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.command(&["GET", key]).await?.into_string()
    }

    /// Delete keys; returns the number actually removed
    pub async fn delete(&mut self, keys: &[&str]) -> Result<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["DEL"];
        args.extend_from_slice(keys);
        self.command(&args).await?.as_integer()
    }

    /// Does the key exist?
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        Ok(self.command(&["EXISTS", key]).await?.as_integer()? == 1)
    }

    /// Set a TTL on an existing key; false when the key is absent
    pub async fn expire(&mut self, key: &str, ttl_secs: u64) -> Result<bool> {
        let ttl = ttl_secs.to_string();
        Ok(self.command(&["EXPIRE", key, &ttl]).await?.as_integer()? == 1)
    }

    /// Append values to the tail of a list; returns the new length
    pub async fn rpush(&mut self, list: &str, values: &[&str]) -> Result<i64> {
        let mut args = vec!["RPUSH", list];
        args.extend_from_slice(values);
        self.command(&args).await?.as_integer()
    }

    /// Prepend values to the head of a list; returns the new length
    pub async fn lpush(&mut self, list: &str, values: &[&str]) -> Result<i64> {
        let mut args = vec!["LPUSH", list];
        args.extend_from_slice(values);
        self.command(&args).await?.as_integer()
    }

    /// Length of a list (0 for a missing key)
    pub async fn llen(&mut self, list: &str) -> Result<i64> {
        self.command(&["LLEN", list]).await?.as_integer()
    }

    /// Slice of a list without consuming it
    pub async fn lrange(&mut self, list: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        let frame = self.command(&["LRANGE", list, &start, &stop]).await?;
        let items = frame.into_array()?.unwrap_or_default();
        items
            .into_iter()
            .map(|f| {
                f.into_string()?
                    .ok_or_else(|| FabricError::unexpected_reply("bulk string", "null"))
            })
            .collect()
    }

    /// Blocking pop from the head of the leftmost non-empty list.
    ///
    /// `timeout_secs` of zero waits indefinitely. Returns the `(list,
    /// value)` pair, or `None` when the timeout elapsed. Consumes at most
    /// one value per call.
    pub async fn blpop(&mut self, lists: &[&str], timeout_secs: u64) -> Result<Option<(String, String)>> {
        self.blocking_pop("BLPOP", lists, timeout_secs).await
    }

    /// Blocking pop from the tail; otherwise identical to [`blpop`](Self::blpop)
    pub async fn brpop(&mut self, lists: &[&str], timeout_secs: u64) -> Result<Option<(String, String)>> {
        self.blocking_pop("BRPOP", lists, timeout_secs).await
    }

    async fn blocking_pop(
        &mut self,
        cmd: &str,
        lists: &[&str],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>> {
        let timeout_arg = timeout_secs.to_string();
        let mut args = vec![cmd];
        args.extend_from_slice(lists);
        args.push(&timeout_arg);

        let deadline = if timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(timeout_secs + BLOCKING_GRACE_SECS))
        };

        let Some(frame) = self.exchange(&args, deadline).await? else {
            return Ok(None);
        };

        let Some(items) = frame.into_array()? else {
            // Null array: server-side timeout.
            return Ok(None);
        };
        let mut iter = items.into_iter();
        match (iter.next(), iter.next()) {
            (Some(list), Some(value)) => {
                let list = list
                    .into_string()?
                    .ok_or_else(|| FabricError::unexpected_reply("list name", "null"))?;
                let value = value
                    .into_string()?
                    .ok_or_else(|| FabricError::unexpected_reply("value", "null"))?;
                Ok(Some((list, value)))
            },
            _ => Err(FabricError::unexpected_reply("2-element array", "short array")),
        }
    }

    /// Publish to a channel; returns the subscriber count
    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<i64> {
        self.command(&["PUBLISH", channel, message]).await?.as_integer()
    }

    /// Append an entry to a stream with a server-assigned id
    pub async fn xadd(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let mut args = vec!["XADD", stream, "*"];
        for &(key, value) in fields {
            args.push(key);
            args.push(value);
        }
        self.command(&args)
            .await?
            .into_string()?
            .ok_or_else(|| FabricError::unexpected_reply("entry id", "null"))
    }

    /// Read entries from streams after the given `(stream, last_id)`
    /// positions. `block_ms` of `Some(0)` blocks until data arrives;
    /// `None` returns immediately. A blocking read that times out yields
    /// an empty result.
    pub async fn xread(
        &mut self,
        streams: &[(&str, &str)],
        count: Option<u32>,
        block_ms: Option<u64>,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>> {
        let count_arg = count.map(|c| c.to_string());
        let block_arg = block_ms.map(|ms| ms.to_string());

        let mut args = vec!["XREAD"];
        if let Some(count) = &count_arg {
            args.push("COUNT");
            args.push(count);
        }
        if let Some(block) = &block_arg {
            args.push("BLOCK");
            args.push(block);
        }
        args.push("STREAMS");
        for &(stream, _) in streams {
            args.push(stream);
        }
        for &(_, last_id) in streams {
            args.push(last_id);
        }

        let deadline = match block_ms {
            None => Some(self.config.socket_timeout()),
            Some(0) => None,
            Some(ms) => {
                Some(Duration::from_millis(ms) + Duration::from_secs(BLOCKING_GRACE_SECS))
            },
        };
        let Some(frame) = self.exchange(&args, deadline).await? else {
            return Ok(Vec::new());
        };
        let Some(batches) = frame.into_array()? else {
            return Ok(Vec::new());
        };

        let mut result = Vec::with_capacity(batches.len());
        for batch in batches {
            let Frame::Array(parts) = batch else { continue };
            let mut parts = parts.into_iter();
            let Some(name) = parts.next().and_then(|f| f.into_string().ok().flatten()) else {
                continue;
            };
            let mut entries = Vec::new();
            if let Some(Frame::Array(raw_entries)) = parts.next() {
                for raw in raw_entries {
                    if let Some(entry) = StreamEntry::from_frame(raw) {
                        entries.push(entry);
                    }
                }
            }
            result.push((name, entries));
        }
        Ok(result)
    }

    /// One SCAN step; returns the next cursor and the matching keys
    pub async fn scan(&mut self, cursor: u64, pattern: &str, count: u32) -> Result<(u64, Vec<String>)> {
        let (cursor, count) = (cursor.to_string(), count.to_string());
        let frame = self
            .command(&["SCAN", &cursor, "MATCH", pattern, "COUNT", &count])
            .await?;
        let items = frame
            .into_array()?
            .ok_or_else(|| FabricError::unexpected_reply("scan reply", "null"))?;
        let mut iter = items.into_iter();
        let next = iter
            .next()
            .ok_or_else(|| FabricError::unexpected_reply("cursor", "missing"))?
            .into_string()?
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FabricError::unexpected_reply("cursor", "non-numeric"))?;
        let keys = match iter.next() {
            Some(Frame::Array(frames)) => frames
                .into_iter()
                .filter_map(|f| f.into_string().ok().flatten())
                .collect(),
            _ => Vec::new(),
        };
        Ok((next, keys))
    }

    /// Collect every key matching `pattern`, scanning in batches of 100
    pub async fn scan_keys(&mut self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = self.scan(cursor, pattern, 100).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
