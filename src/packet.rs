//! Wire envelopes for the gateway control protocol.
//!
//! Every frame is a JSON envelope `{op, d, s?, t?}` inbound and `{op, d}`
//! outbound. The `d` payload is kept raw and decoded lazily once the opcode
//! (and, for dispatches, the event name) is known.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Error;

/// Dispatch event announcing a freshly created session.
pub const EVENT_READY: &str = "READY";
/// Dispatch event confirming a successful resume.
pub const EVENT_RESUMED: &str = "RESUMED";

/// Gateway operation codes.
///
/// Wire values the shard does not speak round-trip through [`OpCode::Unknown`]
/// so an envelope with a novel opcode still decodes; the shard ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum OpCode {
    /// Server event carrying a name and sequence number.
    Dispatch,
    /// Liveness ping; the server may also request one.
    Heartbeat,
    /// New-session handshake.
    Identify,
    /// Re-attach to an existing session.
    Resume,
    /// Server instruction to drop and re-dial.
    Reconnect,
    /// The session is gone; payload says whether it can be resumed.
    InvalidSession,
    /// First packet of every connection; carries the heartbeat interval.
    Hello,
    /// Acknowledgement of a client heartbeat.
    HeartbeatAck,
    /// Any opcode this client does not handle.
    Unknown(u8),
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
            OpCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// One decoded inbound envelope.
#[derive(Debug, Deserialize)]
pub struct ReceivePacket {
    /// Operation code.
    pub op: OpCode,
    /// Raw payload; decode with [`ReceivePacket::decode`] once the opcode is
    /// known.
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
    /// Dispatch sequence number; present only on `op == Dispatch`.
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name; meaningful only on `op == Dispatch`. The shard blanks it
    /// for every other opcode before the packet is observable.
    #[serde(default)]
    pub t: Option<String>,
}

impl ReceivePacket {
    /// Decode the raw payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let raw = self
            .d
            .as_deref()
            .ok_or_else(|| Error::Protocol(format!("op {} packet is missing its payload", self.op)))?;
        Ok(serde_json::from_str(raw.get())?)
    }

    /// Event name, or the empty string for non-dispatch packets.
    pub fn event(&self) -> &str {
        self.t.as_deref().unwrap_or("")
    }
}

/// One outbound envelope.
#[derive(Debug, Serialize)]
pub struct SendPacket<T> {
    /// Operation code.
    pub op: OpCode,
    /// Payload, serialized in place.
    pub d: T,
}

/// `Hello` payload: the server's negotiated heartbeat cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Interval between client heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
    #[serde(default, rename = "_trace")]
    pub trace: Vec<String>,
}

/// `Ready` payload: the subset of the session-start event the shard consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    #[serde(rename = "v")]
    pub version: u32,
    /// Server-assigned session id, persisted for resumes.
    pub session_id: String,
    /// Endpoint to prefer for the rest of this session's reconnects.
    #[serde(default)]
    pub resume_gateway_url: String,
    #[serde(default, rename = "_trace")]
    pub trace: Vec<String>,
}

/// `Resumed` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Resumed {
    #[serde(default, rename = "_trace")]
    pub trace: Vec<String>,
}

/// Device metadata reported during identify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: env!("CARGO_PKG_NAME").to_owned(),
            device: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

/// `Identify` payload: authentication plus the shard tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub properties: ConnectionProperties,
    /// `[shard_index, shard_count]`.
    pub shard: [u32; 2],
    #[serde(default)]
    pub intents: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,
}

impl Identify {
    /// Identify payload for `shard` = `[index, count]` with default
    /// properties, no intents, and no initial presence.
    pub fn new(token: impl Into<String>, shard: [u32; 2]) -> Self {
        Self {
            token: token.into(),
            properties: ConnectionProperties::default(),
            shard,
            intents: 0,
            presence: None,
        }
    }

    /// Set the intent bitfield.
    pub fn intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    /// Set the initial presence object (schema is opaque to the shard).
    pub fn presence(mut self, presence: serde_json::Value) -> Self {
        self.presence = Some(presence);
        self
    }
}

/// `Resume` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// WebSocket close codes the gateway protocol assigns meaning to.
pub mod close_code {
    /// Normal local closure.
    pub const NORMAL: u16 = 1000;
    /// Emitted locally when the server requests a reconnect.
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    /// Emitted locally when a heartbeat goes unacknowledged.
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Codes after which re-identifying can never succeed.
    pub const FATAL: [u16; 6] = [
        AUTHENTICATION_FAILED,
        INVALID_SHARD,
        SHARDING_REQUIRED,
        INVALID_API_VERSION,
        INVALID_INTENTS,
        DISALLOWED_INTENTS,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips_through_u8() {
        for value in 0u8..=12 {
            assert_eq!(u8::from(OpCode::from(value)), value);
        }
        assert_eq!(OpCode::from(3), OpCode::Unknown(3));
        assert_eq!(OpCode::from(10), OpCode::Hello);
    }

    #[test]
    fn decodes_dispatch_envelope() {
        let raw = r#"{"op":0,"d":{"session_id":"abc","v":10,"resume_gateway_url":"wss://r"},"s":17,"t":"READY"}"#;
        let packet: ReceivePacket = serde_json::from_str(raw).unwrap();
        assert_eq!(packet.op, OpCode::Dispatch);
        assert_eq!(packet.s, Some(17));
        assert_eq!(packet.event(), "READY");

        let ready: Ready = packet.decode().unwrap();
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.version, 10);
        assert_eq!(ready.resume_gateway_url, "wss://r");
    }

    #[test]
    fn decodes_envelope_with_missing_fields() {
        let packet: ReceivePacket = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(packet.op, OpCode::HeartbeatAck);
        assert!(packet.d.is_none());
        assert_eq!(packet.s, None);
        assert_eq!(packet.event(), "");
        assert!(packet.decode::<bool>().is_err());
    }

    #[test]
    fn decodes_invalid_session_flag() {
        let packet: ReceivePacket = serde_json::from_str(r#"{"op":9,"d":false}"#).unwrap();
        assert_eq!(packet.op, OpCode::InvalidSession);
        assert!(!packet.decode::<bool>().unwrap());
    }

    #[test]
    fn serializes_send_packet() {
        let body = serde_json::to_value(SendPacket {
            op: OpCode::Heartbeat,
            d: 42u64,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"op": 1, "d": 42}));
    }

    #[test]
    fn identify_omits_absent_presence() {
        let identify = Identify::new("t0ken", [2, 16]).intents(1 << 9);
        let body = serde_json::to_value(&identify).unwrap();
        assert_eq!(body["shard"], serde_json::json!([2, 16]));
        assert_eq!(body["intents"], 512);
        assert!(body.get("presence").is_none());

        let with_presence = identify.presence(serde_json::json!({"status": "online"}));
        let body = serde_json::to_value(&with_presence).unwrap();
        assert_eq!(body["presence"]["status"], "online");
    }

    #[test]
    fn hello_defaults_trace() {
        let hello: Hello = serde_json::from_str(r#"{"heartbeat_interval":41250}"#).unwrap();
        assert_eq!(hello.heartbeat_interval, 41_250);
        assert!(hello.trace.is_empty());
    }
}
