//! Packet types for the Socket.IO wire protocol.
//!
//! The server speaks Socket.IO v5 on top of Engine.IO v4, over a plain
//! websocket transport. Every websocket text frame is one Engine.IO packet;
//! Engine.IO `message` packets (`4`) carry one Socket.IO packet.
//!
//! | Frame                  | Meaning                                  |
//! |------------------------|------------------------------------------|
//! | `0{"sid":…}`           | Engine.IO open (handshake)               |
//! | `2` / `3`              | ping / pong                              |
//! | `40` / `40{"sid":…}`   | Socket.IO connect (request / confirmed)  |
//! | `42["name",data]`      | event                                    |
//! | `4212["name",data]`    | event expecting acknowledgment 12        |
//! | `4312[data]`           | acknowledgment 12                        |
//! | `44{"message":…}`      | connect error                            |
//!
//! Only the default namespace is used. Binary packets are not supported.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from decoding or encoding a frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown packet type: {0}")]
    UnknownType(String),

    #[error("Invalid acknowledgment id: {0}")]
    InvalidAckId(String),

    #[error("Event packet without a name")]
    MissingEventName,

    #[error("Acknowledgment packet without an id")]
    MissingAckId,

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e.to_string())
    }
}

/// Engine.IO handshake data sent by the server in the open packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// Milliseconds between server pings
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO open, sent by the server right after the upgrade
    Open(Handshake),
    /// Engine.IO close
    Close,
    /// Engine.IO ping (server → client)
    Ping,
    /// Engine.IO pong (client → server)
    Pong,
    /// Engine.IO noop
    Noop,
    /// Socket.IO connect; `data` is `{"sid": …}` when sent by the server
    Connect { data: Option<Value> },
    /// Socket.IO disconnect
    Disconnect,
    /// Named event, optionally expecting an acknowledgment
    Event {
        name: String,
        data: Value,
        ack_id: Option<u64>,
    },
    /// Acknowledgment for a previously emitted event
    Ack { ack_id: u64, data: Value },
    /// Socket.IO connect refused by the server
    ConnectError { data: Value },
}

impl Packet {
    /// Builds an event packet.
    pub fn event(name: impl Into<String>, data: Value, ack_id: Option<u64>) -> Self {
        Packet::Event {
            name: name.into(),
            data,
            ack_id,
        }
    }

    /// Encodes the packet as a websocket text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let frame = match self {
            Packet::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect { data: None } => "40".to_string(),
            Packet::Connect { data: Some(data) } => format!("40{}", serde_json::to_string(data)?),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, data, ack_id } => {
                let args = if data.is_null() {
                    serde_json::json!([name])
                } else {
                    serde_json::json!([name, data])
                };
                format!(
                    "42{}{}",
                    ack_id.map(|id| id.to_string()).unwrap_or_default(),
                    serde_json::to_string(&args)?
                )
            }
            Packet::Ack { ack_id, data } => {
                let args = if data.is_null() {
                    serde_json::json!([])
                } else {
                    serde_json::json!([data])
                };
                format!("43{}{}", ack_id, serde_json::to_string(&args)?)
            }
            Packet::ConnectError { data } => format!("44{}", serde_json::to_string(data)?),
        };
        Ok(frame)
    }

    /// Decodes a websocket text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_socket_packet(rest),
            '6' => Ok(Packet::Noop),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Decodes the Socket.IO packet carried by an Engine.IO message.
fn decode_socket_packet(body: &str) -> Result<Packet, ProtocolError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let mut rest = chars.as_str();

    // Namespaced packets look like `42/admin,["name"]`; we only use "/".
    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        };
    }

    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let ack_id = if digits > 0 {
        Some(
            rest[..digits]
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidAckId(rest[..digits].to_string()))?,
        )
    } else {
        None
    };
    let payload = &rest[digits..];

    match kind {
        '0' => {
            let data = if payload.is_empty() {
                None
            } else {
                Some(serde_json::from_str(payload)?)
            };
            Ok(Packet::Connect { data })
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut args: Vec<Value> = serde_json::from_str(payload)?;
            if args.is_empty() {
                return Err(ProtocolError::MissingEventName);
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                _ => return Err(ProtocolError::MissingEventName),
            };
            let data = if args.is_empty() {
                Value::Null
            } else {
                args.remove(0)
            };
            Ok(Packet::Event { name, data, ack_id })
        }
        '3' => {
            let ack_id = ack_id.ok_or(ProtocolError::MissingAckId)?;
            let mut args: Vec<Value> = serde_json::from_str(payload)?;
            let data = if args.is_empty() {
                Value::Null
            } else {
                args.remove(0)
            };
            Ok(Packet::Ack { ack_id, data })
        }
        '4' => {
            let data = if payload.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(payload)?
            };
            Ok(Packet::ConnectError { data })
        }
        other => Err(ProtocolError::UnknownType(format!("4{}", other))),
    }
}
