//! JSON frames exchanged over the voice control channel.
//!
//! Every frame is `{"op": <u8>, "d": <payload>}`, with an optional server
//! sequence number (`seq`) on inbound frames that heartbeats echo back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VoiceConnectError;

pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const SESSION_DESCRIPTION: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_READY: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const HELLO: u8 = 8;
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlFrame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

/// The server's description of the voice session: our SSRC, the UDP
/// endpoint to punch through to, and the encryption modes it supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

/// Carries the secret key once the protocol selection was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReady {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceMessage {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    SessionDescription(SessionDescription),
    /// Outbound heartbeat echoing the last received sequence number.
    Heartbeat(u64),
    SessionReady(SessionReady),
    Speaking(Speaking),
    HeartbeatAck(u64),
    Hello(Hello),
    /// An opcode this client does not know. Kept explicit so callers
    /// ignore it deliberately instead of silently.
    Unknown(u8),
}

impl VoiceMessage {
    /// Decodes one control frame, returning the message and the server
    /// sequence number if the frame carried one.
    pub fn decode(text: &str) -> Result<(VoiceMessage, Option<u64>), VoiceConnectError> {
        let frame: ControlFrame = serde_json::from_str(text)?;
        let message = match frame.op {
            opcode::IDENTIFY => VoiceMessage::Identify(serde_json::from_value(frame.d)?),
            opcode::SELECT_PROTOCOL => {
                VoiceMessage::SelectProtocol(serde_json::from_value(frame.d)?)
            }
            opcode::SESSION_DESCRIPTION => {
                VoiceMessage::SessionDescription(serde_json::from_value(frame.d)?)
            }
            opcode::HEARTBEAT => VoiceMessage::Heartbeat(frame.d.as_u64().unwrap_or(0)),
            opcode::SESSION_READY => VoiceMessage::SessionReady(serde_json::from_value(frame.d)?),
            opcode::SPEAKING => VoiceMessage::Speaking(serde_json::from_value(frame.d)?),
            opcode::HEARTBEAT_ACK => VoiceMessage::HeartbeatAck(frame.d.as_u64().unwrap_or(0)),
            opcode::HELLO => VoiceMessage::Hello(serde_json::from_value(frame.d)?),
            other => VoiceMessage::Unknown(other),
        };
        Ok((message, frame.seq))
    }

    pub fn encode(&self) -> Result<String, VoiceConnectError> {
        let (op, d) = match self {
            VoiceMessage::Identify(d) => (opcode::IDENTIFY, serde_json::to_value(d)?),
            VoiceMessage::SelectProtocol(d) => (opcode::SELECT_PROTOCOL, serde_json::to_value(d)?),
            VoiceMessage::SessionDescription(d) => {
                (opcode::SESSION_DESCRIPTION, serde_json::to_value(d)?)
            }
            VoiceMessage::Heartbeat(ack) => (opcode::HEARTBEAT, Value::from(*ack)),
            VoiceMessage::SessionReady(d) => (opcode::SESSION_READY, serde_json::to_value(d)?),
            VoiceMessage::Speaking(d) => (opcode::SPEAKING, serde_json::to_value(d)?),
            VoiceMessage::HeartbeatAck(ack) => (opcode::HEARTBEAT_ACK, Value::from(*ack)),
            VoiceMessage::Hello(d) => (opcode::HELLO, serde_json::to_value(d)?),
            VoiceMessage::Unknown(op) => (*op, Value::Null),
        };
        Ok(serde_json::to_string(&ControlFrame { op, d, seq: None })?)
    }
}
