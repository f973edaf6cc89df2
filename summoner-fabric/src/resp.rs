//! RESP wire codec
//!
//! Encoding of request commands as arrays of bulk strings and incremental
//! parsing of the five reply shapes (simple string, error, integer, bulk
//! string, array). Bulk payloads are read by their declared length, so
//! embedded CRLF sequences pass through untouched.

use crate::errors::{FabricError, Result};

/// A single decoded reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR ...\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`
    Bulk(String),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
    /// `*<count>\r\n<frames>`
    Array(Vec<Frame>),
}

impl Frame {
    /// Integer value, or an UnexpectedReply error
    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Frame::Integer(n) => Ok(*n),
            Frame::Error(msg) => Err(FabricError::Protocol(msg.clone())),
            other => Err(FabricError::unexpected_reply("integer", other.describe())),
        }
    }

    /// String payload of a simple or bulk frame; `None` for null
    pub fn into_string(self) -> Result<Option<String>> {
        match self {
            Frame::Simple(s) | Frame::Bulk(s) => Ok(Some(s)),
            Frame::Null => Ok(None),
            Frame::Error(msg) => Err(FabricError::Protocol(msg)),
            other => Err(FabricError::unexpected_reply("string", other.describe())),
        }
    }

    /// Array elements; `None` for a null array
    pub fn into_array(self) -> Result<Option<Vec<Frame>>> {
        match self {
            Frame::Array(items) => Ok(Some(items)),
            Frame::Null => Ok(None),
            Frame::Error(msg) => Err(FabricError::Protocol(msg)),
            other => Err(FabricError::unexpected_reply("array", other.describe())),
        }
    }

    /// Short tag for diagnostics
    pub fn describe(&self) -> String {
        match self {
            Frame::Simple(s) => format!("simple({s})"),
            Frame::Error(s) => format!("error({s})"),
            Frame::Integer(n) => format!("integer({n})"),
            Frame::Bulk(_) => "bulk".to_string(),
            Frame::Null => "null".to_string(),
            Frame::Array(items) => format!("array[{}]", items.len()),
        }
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Try to parse one frame from the front of `src`.
///
/// Returns `Ok(Some((frame, consumed)))` on success, `Ok(None)` when more
/// bytes are needed, and an error on malformed input.
pub fn parse_frame(src: &[u8]) -> Result<Option<(Frame, usize)>> {
    parse_at(src, 0)
}

fn parse_at(src: &[u8], pos: usize) -> Result<Option<(Frame, usize)>> {
    if pos >= src.len() {
        return Ok(None);
    }

    let kind = src[pos];
    let Some((line, next)) = get_line(src, pos + 1) else {
        return Ok(None);
    };

    match kind {
        b'+' => Ok(Some((Frame::Simple(decode_text(line)), next))),
        b'-' => Ok(Some((Frame::Error(decode_text(line)), next))),
        b':' => {
            let n = parse_decimal(line)?;
            Ok(Some((Frame::Integer(n), next)))
        },
        b'$' => {
            let len = parse_decimal(line)?;
            if len == -1 {
                return Ok(Some((Frame::Null, next)));
            }
            let len = usize::try_from(len)
                .map_err(|_| FabricError::Protocol(format!("invalid bulk length: {len}")))?;
            // Payload plus its trailing CRLF must be present in full.
            let end = next + len;
            if src.len() < end + 2 {
                return Ok(None);
            }
            if &src[end..end + 2] != b"\r\n" {
                return Err(FabricError::Protocol(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            Ok(Some((Frame::Bulk(decode_text(&src[next..end])), end + 2)))
        },
        b'*' => {
            let count = parse_decimal(line)?;
            if count == -1 {
                return Ok(Some((Frame::Null, next)));
            }
            let count = usize::try_from(count)
                .map_err(|_| FabricError::Protocol(format!("invalid array length: {count}")))?;
            let mut items = Vec::with_capacity(count);
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(src, cursor)? {
                    Some((frame, consumed)) => {
                        items.push(frame);
                        cursor = consumed;
                    },
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), cursor)))
        },
        other => Err(FabricError::Protocol(format!(
            "invalid frame type byte: 0x{other:02x}"
        ))),
    }
}

/// Slice out one CRLF-terminated line starting at `start`.
/// Returns the line contents and the index just past the CRLF.
fn get_line(src: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let mut i = start;
    while i + 1 < src.len() {
        if src[i] == b'\r' && src[i + 1] == b'\n' {
            return Some((&src[start..i], i + 2));
        }
        i += 1;
    }
    None
}

fn parse_decimal(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            FabricError::Protocol(format!(
                "invalid decimal: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
