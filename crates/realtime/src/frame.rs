//! Text frame codec.
//!
//! Socket.IO v4 rides on Engine.IO packets: the first character is the
//! Engine.IO type (`0` open, `1` close, `2` ping, `4` message) and message packets carry a
//! Socket.IO packet (`0` connect, `1` disconnect, `2` event, `4` connect error).
//! Events look like `42["vendor:created",{...}]`, optionally with a `/namespace,`
//! and an ack id before the array.

use serde_json::{json, Value};

use crate::error::{Result, SocketError};
use stockyard_core::sync::SocketEnvelope;

/// Wire format spoken over the WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameProtocol {
    #[default]
    SocketIo,
    /// Plain JSON objects: `{"event": "...", "data": ...}`.
    Json,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Engine.IO handshake; the client must answer with a namespace connect.
    Open,
    /// Namespace connect acknowledged.
    Connected,
    ConnectError(String),
    Ping,
    Pong,
    Event(SocketEnvelope),
    /// Namespace disconnect (`41`): the server is done with this client.
    Disconnect,
    /// Engine.IO close (`1`): the transport went away, the client may retry.
    Close,
    /// Acks, upgrades, noops and other packets the channel does not act on.
    Ignored,
}

pub fn decode(text: &str, protocol: FrameProtocol) -> Result<Frame> {
    match protocol {
        FrameProtocol::SocketIo => decode_socket_io(text),
        FrameProtocol::Json => decode_json(text),
    }
}

fn decode_json(text: &str) -> Result<Frame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SocketError::frame(e.to_string()))?;
    let name = value
        .get("event")
        .or_else(|| value.get("eventName"))
        .and_then(Value::as_str)
        .ok_or_else(|| SocketError::frame("JSON frame has no event name"))?;
    let payload = value
        .get("data")
        .or_else(|| value.get("payload"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(Frame::Event(SocketEnvelope::new(name, payload)))
}

fn decode_socket_io(text: &str) -> Result<Frame> {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Ok(Frame::Open),
        Some('1') => Ok(Frame::Close),
        Some('2') => Ok(Frame::Ping),
        Some('3') => Ok(Frame::Pong),
        Some('4') => decode_socket_io_packet(chars.as_str()),
        Some('5') | Some('6') => Ok(Frame::Ignored),
        Some(other) => Err(SocketError::frame(format!(
            "unknown engine packet type '{}'",
            other
        ))),
        None => Err(SocketError::frame("empty frame")),
    }
}

/// Skip `/namespace,` and a numeric ack id.
fn strip_namespace_and_ack(body: &str) -> &str {
    let body = match body.strip_prefix('/') {
        Some(rest) => rest.split_once(',').map(|(_, tail)| tail).unwrap_or(""),
        None => body,
    };
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn decode_socket_io_packet(packet: &str) -> Result<Frame> {
    let mut chars = packet.chars();
    let kind = chars.next();
    let body = strip_namespace_and_ack(chars.as_str());
    match kind {
        Some('0') => Ok(Frame::Connected),
        Some('1') => Ok(Frame::Disconnect),
        Some('2') => {
            let args: Vec<Value> =
                serde_json::from_str(body).map_err(|e| SocketError::frame(e.to_string()))?;
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(SocketError::frame("event packet has no name")),
            };
            let rest: Vec<Value> = args.collect();
            let payload = match rest.len() {
                0 => Value::Null,
                1 => rest.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(rest),
            };
            Ok(Frame::Event(SocketEnvelope::new(name, payload)))
        }
        Some('4') => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|value| value.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| body.to_string());
            Ok(Frame::ConnectError(message))
        }
        Some('3') | Some('5') | Some('6') => Ok(Frame::Ignored),
        _ => Err(SocketError::frame(format!("unknown socket packet '{}'", packet))),
    }
}

/// Namespace connect packet, carrying the auth token when present.
pub fn encode_connect(access_token: Option<&str>) -> String {
    match access_token {
        Some(token) => format!("40{}", json!({ "token": token })),
        None => "40".to_string(),
    }
}

pub fn encode_pong() -> &'static str {
    "3"
}

pub fn encode_event(envelope: &SocketEnvelope, protocol: FrameProtocol) -> String {
    match protocol {
        FrameProtocol::SocketIo => {
            format!("42{}", json!([envelope.event_name, envelope.payload]))
        }
        FrameProtocol::Json => {
            json!({ "event": envelope.event_name, "data": envelope.payload }).to_string()
        }
    }
}
