//! Voice gateway message envelope and typed event payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Voice gateway op codes (§3 of the data model).
pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_CONNECT: u8 = 12;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

/// The wire envelope every voice gateway message is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub op: u8,
    pub d: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl Op {
    pub fn new(op: u8, d: Value) -> Self {
        Op { op, d, seq: None }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocolPayload {
    pub protocol: &'static str,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescriptionData {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakingData {
    pub speaking: u32,
    pub delay: u32,
    pub ssrc: u32,
}

/// A decoded voice gateway event, as dispatched by [`super::gateway::VoiceGatewayClient`].
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Hello(HelloData),
    Ready(ReadyData),
    SessionDescription(SessionDescriptionData),
    Speaking(SpeakingData),
    HeartbeatAck,
    Resumed,
    ClientConnect(Value),
    ClientDisconnect(Value),
    /// Op code with no registered handler; logged by the caller, not fatal.
    Unknown(u8, Value),
}

impl VoiceEvent {
    pub fn decode(op: Op) -> crate::Result<VoiceEvent> {
        Ok(match op.op {
            opcode::HELLO => VoiceEvent::Hello(serde_json::from_value(op.d)?),
            opcode::READY => VoiceEvent::Ready(serde_json::from_value(op.d)?),
            opcode::SESSION_DESCRIPTION => {
                VoiceEvent::SessionDescription(serde_json::from_value(op.d)?)
            }
            opcode::SPEAKING => VoiceEvent::Speaking(serde_json::from_value(op.d)?),
            opcode::HEARTBEAT_ACK => VoiceEvent::HeartbeatAck,
            opcode::RESUMED => VoiceEvent::Resumed,
            opcode::CLIENT_CONNECT => VoiceEvent::ClientConnect(op.d),
            opcode::CLIENT_DISCONNECT => VoiceEvent::ClientDisconnect(op.d),
            other => VoiceEvent::Unknown(other, op.d),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hello_and_ready() {
        let hello = Op::new(opcode::HELLO, serde_json::json!({"heartbeat_interval": 41250.0}));
        assert!(matches!(VoiceEvent::decode(hello).unwrap(), VoiceEvent::Hello(_)));

        let ready = Op::new(
            opcode::READY,
            serde_json::json!({"ssrc": 42, "ip": "203.0.113.7", "port": 50000, "modes": ["xsalsa20_poly1305"]}),
        );
        match VoiceEvent::decode(ready).unwrap() {
            VoiceEvent::Ready(r) => assert_eq!(r.ssrc, 42),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_not_fatal() {
        let op = Op::new(255, Value::Null);
        assert!(matches!(VoiceEvent::decode(op).unwrap(), VoiceEvent::Unknown(255, _)));
    }
}
