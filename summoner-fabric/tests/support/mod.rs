//! In-process fake store for integration tests.
//!
//! Speaks enough RESP to exercise the fabric end to end: string/list/
//! stream commands, blocking pops (served by polling the shared state),
//! SCAN, and pub/sub with one channel per subscriber connection.

// Not every test file uses every helper.
#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use summoner_fabric::StoreConfig;
use summoner_fabric::resp::{Frame, parse_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct State {
    kv: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, Vec<Vec<String>>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl State {
    fn key_exists(&self, key: &str) -> bool {
        self.kv.contains_key(key) || self.lists.contains_key(key) || self.streams.contains_key(key)
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let mut removed = false;
        removed |= self.kv.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.streams.remove(key).is_some();
        removed
    }
}

/// A running fake store bound to an ephemeral localhost port.
pub struct FakeStore {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    accept_task: JoinHandle<()>,
}

impl FakeStore {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake store");
        let addr = listener.local_addr().expect("local addr");
        let state: Arc<Mutex<State>> = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, conn_state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Client configuration pointing at this store
    pub fn config(&self) -> StoreConfig {
        StoreConfig::with_addr("127.0.0.1", self.addr.port())
    }

    /// Direct peek at a list's contents (test assertions)
    pub fn list_snapshot(&self, list: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Does a key exist right now?
    pub fn has_key(&self, key: &str) -> bool {
        self.state.lock().unwrap().key_exists(key)
    }
}

impl Drop for FakeStore {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        let frame = loop {
            match parse_frame(&buffer) {
                Ok(Some((frame, consumed))) => {
                    buffer.advance(consumed);
                    break frame;
                },
                Ok(None) => {
                    if stream.read_buf(&mut buffer).await? == 0 {
                        return Ok(());
                    }
                },
                Err(_) => return Ok(()),
            }
        };

        let args = frame_to_args(frame);
        if args.is_empty() {
            stream.write_all(b"-ERR empty command\r\n").await?;
            continue;
        }
        let command = args[0].to_uppercase();

        if command == "SUBSCRIBE" {
            return serve_subscription(stream, buffer, state, &args[1]).await;
        }

        let reply = match command.as_str() {
            "PING" => b"+PONG\r\n".to_vec(),
            "SET" => {
                let mut state = state.lock().unwrap();
                state.kv.insert(args[1].clone(), args[2].clone());
                b"+OK\r\n".to_vec()
            },
            "GET" => {
                let state = state.lock().unwrap();
                match state.kv.get(&args[1]) {
                    Some(value) => bulk(value),
                    None => b"$-1\r\n".to_vec(),
                }
            },
            "EXISTS" => {
                let state = state.lock().unwrap();
                integer(state.key_exists(&args[1]) as i64)
            },
            "EXPIRE" => {
                let state = state.lock().unwrap();
                integer(state.key_exists(&args[1]) as i64)
            },
            "DEL" => {
                let mut state = state.lock().unwrap();
                let removed = args[1..].iter().filter(|key| state.remove_key(key)).count();
                integer(removed as i64)
            },
            "RPUSH" => {
                let mut state = state.lock().unwrap();
                let list = state.lists.entry(args[1].clone()).or_default();
                for value in &args[2..] {
                    list.push_back(value.clone());
                }
                integer(list.len() as i64)
            },
            "LPUSH" => {
                let mut state = state.lock().unwrap();
                let list = state.lists.entry(args[1].clone()).or_default();
                for value in &args[2..] {
                    list.push_front(value.clone());
                }
                integer(list.len() as i64)
            },
            "LLEN" => {
                let state = state.lock().unwrap();
                integer(state.lists.get(&args[1]).map_or(0, |l| l.len()) as i64)
            },
            "BLPOP" => serve_blpop(&state, &args).await,
            "PUBLISH" => {
                let mut state = state.lock().unwrap();
                let senders = state.subscribers.entry(args[1].clone()).or_default();
                senders.retain(|tx| tx.send(args[2].clone()).is_ok());
                integer(senders.len() as i64)
            },
            "XADD" => {
                let mut state = state.lock().unwrap();
                let entries = state.streams.entry(args[1].clone()).or_default();
                entries.push(args[3..].to_vec());
                bulk(&format!("{}-0", entries.len()))
            },
            "SCAN" => {
                let state = state.lock().unwrap();
                let pattern = args
                    .iter()
                    .position(|a| a.eq_ignore_ascii_case("MATCH"))
                    .map(|i| args[i + 1].clone())
                    .unwrap_or_else(|| "*".to_string());
                let mut keys: Vec<String> = state
                    .kv
                    .keys()
                    .filter(|key| glob_match(&pattern, key))
                    .cloned()
                    .collect();
                keys.sort();
                scan_reply(&keys)
            },
            _ => format!("-ERR unknown command '{command}'\r\n").into_bytes(),
        };
        stream.write_all(&reply).await?;
    }
}

async fn serve_blpop(state: &Arc<Mutex<State>>, args: &[String]) -> Vec<u8> {
    let lists = &args[1..args.len() - 1];
    let timeout: u64 = args[args.len() - 1].parse().unwrap_or(0);
    let deadline = (timeout > 0).then(|| Instant::now() + Duration::from_secs(timeout));

    loop {
        {
            let mut state = state.lock().unwrap();
            for list in lists {
                if let Some(queue) = state.lists.get_mut(list) {
                    if let Some(value) = queue.pop_front() {
                        let mut reply = format!("*2\r\n${}\r\n{}\r\n", list.len(), list).into_bytes();
                        reply.extend_from_slice(&bulk(&value));
                        return reply;
                    }
                }
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return b"*-1\r\n".to_vec();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn serve_subscription(
    mut stream: TcpStream,
    mut buffer: BytesMut,
    state: Arc<Mutex<State>>,
    channel: &str,
) -> std::io::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    state
        .lock()
        .unwrap()
        .subscribers
        .entry(channel.to_string())
        .or_default()
        .push(tx);

    let mut ack = format!("*3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n", channel.len(), channel).into_bytes();
    ack.extend_from_slice(b":1\r\n");
    stream.write_all(&ack).await?;

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { return Ok(()) };
                let mut push = format!("*3\r\n$7\r\nmessage\r\n${}\r\n{}\r\n", channel.len(), channel).into_bytes();
                push.extend_from_slice(&bulk(&payload));
                stream.write_all(&push).await?;
            },
            read = stream.read_buf(&mut buffer) => {
                // Client closed (or sent UNSUBSCRIBE, which we treat the same).
                if read? == 0 {
                    return Ok(());
                }
                buffer.clear();
            },
        }
    }
}

fn frame_to_args(frame: Frame) -> Vec<String> {
    let Frame::Array(items) = frame else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Frame::Bulk(s) | Frame::Simple(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn bulk(value: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", value.len(), value).into_bytes()
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn scan_reply(keys: &[String]) -> Vec<u8> {
    let mut reply = b"*2\r\n$1\r\n0\r\n".to_vec();
    reply.extend_from_slice(format!("*{}\r\n", keys.len()).as_bytes());
    for key in keys {
        reply.extend_from_slice(&bulk(key));
    }
    reply
}

/// Minimal glob: `*` matches any run of characters.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let mut remainder = key;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            let Some(rest) = remainder.strip_prefix(part) else {
                return false;
            };
            remainder = rest;
        } else if index == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            let Some(found) = remainder.find(part) else {
                return false;
            };
            remainder = &remainder[found + part.len()..];
        }
    }
    // Pattern ended with '*'
    true
}
