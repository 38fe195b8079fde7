//! Typed command and reply model for the colon-framed wire grammar.
//!
//! A frame is one command on one short-lived TCP connection:
//! `<cmd>:<arg1>:<rest>` — only the first two `:` delimit on the master
//! side (the first three on the node side, where a chunk id travels
//! between filename and body); the remainder is an opaque body that may
//! itself contain `:`. The sender closes its write half after the frame,
//! so requests are read to EOF and carry no length limit.
//!
//! The textual grammar is a serialization of the enums below, kept as the
//! compatibility wire. Replies are `OK`, `OK:<n>`, `SUCCESS: …`,
//! `ERROR: …`, raw chunk bytes (with optional trailing `WARNING:` lines),
//! or bare JSON for `list`/`metadata`/`system_info`.

use bytes::Bytes;

use crate::error::DfsError;

/// Commands accepted by the master.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create { file: String, body: Bytes },
    Write { file: String, body: Bytes },
    Append { file: String, body: Bytes },
    Read { file: String },
    Delete { file: String },
    List,
    Metadata { file: String },
    SystemInfo,
    Heartbeat { node_id: u32 },
}

/// Commands accepted by a data node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    Write { file: String, cid: u64, body: Bytes },
    Read { file: String, cid: u64 },
    Delete { file: String, cid: u64 },
    DeleteFile { file: String },
}

/// Why an incoming frame could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Reply `ERROR: Invalid request`.
    Invalid,
    /// Close the connection without replying (malformed heartbeat).
    Silent,
}

/// Replies sent back over the same connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    OkCount(usize),
    Success(String),
    /// Concatenated chunk bytes plus one warning per unreadable chunk.
    Body { data: Bytes, warnings: Vec<String> },
    Json(serde_json::Value),
    Error(DfsError),
}

/// Split `buf` on `:` into at most `max_parts` pieces; the final piece is
/// the untouched remainder.
fn split_parts(buf: &[u8], max_parts: usize) -> Vec<&[u8]> {
    let mut parts = Vec::with_capacity(max_parts);
    let mut rest = buf;
    while parts.len() + 1 < max_parts {
        match rest.iter().position(|&b| b == b':') {
            Some(i) => {
                parts.push(&rest[..i]);
                rest = &rest[i + 1..];
            }
            None => break,
        }
    }
    parts.push(rest);
    parts
}

fn utf8_part(part: &[u8]) -> Result<String, ParseError> {
    String::from_utf8(part.to_vec()).map_err(|_| ParseError::Invalid)
}

impl Command {
    /// Parse a client frame. Fewer than two colon-delimited parts is an
    /// invalid request; a `heartbeat` with a non-integer id is dropped
    /// without a reply.
    pub fn parse(buf: &[u8]) -> Result<Command, ParseError> {
        let parts = split_parts(buf, 3);
        if parts.len() < 2 {
            return Err(ParseError::Invalid);
        }
        let cmd = std::str::from_utf8(parts[0]).map_err(|_| ParseError::Invalid)?;
        if cmd == "heartbeat" {
            let node_id = std::str::from_utf8(parts[1])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ParseError::Silent)?;
            return Ok(Command::Heartbeat { node_id });
        }
        let file = utf8_part(parts[1])?;
        let body = Bytes::copy_from_slice(parts.get(2).copied().unwrap_or(&[]));
        match cmd {
            "create" => Ok(Command::Create { file, body }),
            "write" => Ok(Command::Write { file, body }),
            "append" => Ok(Command::Append { file, body }),
            "read" => Ok(Command::Read { file }),
            "delete" => Ok(Command::Delete { file }),
            "list" => Ok(Command::List),
            "metadata" => Ok(Command::Metadata { file }),
            "system_info" => Ok(Command::SystemInfo),
            _ => Err(ParseError::Invalid),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Create { file, body } => frame3("create", file, body),
            Command::Write { file, body } => frame3("write", file, body),
            Command::Append { file, body } => frame3("append", file, body),
            Command::Read { file } => frame3("read", file, b""),
            Command::Delete { file } => frame3("delete", file, b""),
            Command::List => b"list::".to_vec(),
            Command::Metadata { file } => frame3("metadata", file, b""),
            Command::SystemInfo => b"system_info::".to_vec(),
            Command::Heartbeat { node_id } => format!("heartbeat:{node_id}").into_bytes(),
        }
    }
}

impl NodeCommand {
    /// Parse a node frame (split on the first three `:`).
    pub fn parse(buf: &[u8]) -> Result<NodeCommand, ParseError> {
        let parts = split_parts(buf, 4);
        if parts.len() < 2 {
            return Err(ParseError::Invalid);
        }
        let cmd = std::str::from_utf8(parts[0]).map_err(|_| ParseError::Invalid)?;
        if cmd == "delete_file" {
            // Remainder past the first `:` is the whole filename.
            let raw: Vec<u8> = parts[1..].join(&b':');
            return Ok(NodeCommand::DeleteFile { file: utf8_part(&raw)? });
        }
        if parts.len() < 3 {
            return Err(ParseError::Invalid);
        }
        let file = utf8_part(parts[1])?;
        let cid: u64 = std::str::from_utf8(parts[2])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ParseError::Invalid)?;
        match cmd {
            "write" => {
                if parts.len() < 4 {
                    return Err(ParseError::Invalid);
                }
                let body = Bytes::copy_from_slice(parts[3]);
                Ok(NodeCommand::Write { file, cid, body })
            }
            "read" => Ok(NodeCommand::Read { file, cid }),
            "delete" => Ok(NodeCommand::Delete { file, cid }),
            _ => Err(ParseError::Invalid),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            NodeCommand::Write { file, cid, body } => {
                let mut out = format!("write:{file}:{cid}:").into_bytes();
                out.extend_from_slice(body);
                out
            }
            NodeCommand::Read { file, cid } => format!("read:{file}:{cid}").into_bytes(),
            NodeCommand::Delete { file, cid } => format!("delete:{file}:{cid}").into_bytes(),
            NodeCommand::DeleteFile { file } => format!("delete_file:{file}").into_bytes(),
        }
    }
}

fn frame3(cmd: &str, file: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!("{cmd}:{file}:").into_bytes();
    out.extend_from_slice(body);
    out
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"OK".to_vec(),
            Reply::OkCount(n) => format!("OK:{n}").into_bytes(),
            Reply::Success(msg) => format!("SUCCESS: {msg}").into_bytes(),
            Reply::Body { data, warnings } => {
                let mut out = data.to_vec();
                for w in warnings {
                    out.extend_from_slice(format!("WARNING: {w}\n").as_bytes());
                }
                out
            }
            Reply::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Reply::Error(e) => format!("ERROR: {e}").into_bytes(),
        }
    }
}
