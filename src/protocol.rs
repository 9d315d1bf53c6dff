//! Binary wire protocol spoken by the robots.
//!
//! Every message in both directions starts with a fixed 20-byte header of five
//! little-endian u32 fields: `[total_len, packet_type, sub_type, sequence,
//! flags]`, followed by `total_len - 20` payload bytes. The payload is UTF-8
//! JSON for every message kind except the heartbeat, which carries none.
//! `sequence` correlates an outbound command with its acknowledgement.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::commands::TransitCommand;
use crate::framing::FrameCodec;

pub const HEADER_LEN: usize = 20;
const_assert_eq!(HEADER_LEN, 5 * core::mem::size_of::<u32>());

/// Default listening port of the device-protocol server.
pub const DEVICE_PORT: u16 = 20008;

/// Upper bound for a claimed payload; anything larger is a protocol violation.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

// Inbound header tuples (robot -> server).
pub const TYPE_PING: u32 = 0x00c8_0100;
pub const SUB_PING: u32 = 0x01;
pub const FLAGS_PING: u32 = 0x03e7;
pub const TYPE_IDENTIFY: u32 = 0x0010;
pub const TYPE_STATUS: u32 = 0x0018;
pub const TYPE_COMMAND_ACK: u32 = 0x0000_00fa;
pub const TYPE_MAP: u32 = 0x0014;
pub const TYPE_ERROR: u32 = 0x0016;
pub const SUB_REPORT: u32 = 0x0001;

// Outbound header tuples (server -> robot).
pub const TYPE_PONG: u32 = 0x00c8_0111;
pub const SUB_PONG: u32 = 0x0108_0001;
pub const TYPE_LOGIN_OK: u32 = 0x00c8_0011;
pub const TYPE_OK_ACK: u32 = 0x00c8_0019;
pub const FLAGS_OK_ACK: u32 = 0x01;
pub const TYPE_COMMAND: u32 = 0x00c8_00fa;
pub const SUB_COMMAND: u32 = 0x0109_0000;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("claimed payload length {claimed} exceeds maximum {max}")]
    PayloadTooLarge { claimed: u32, max: u32 },

    #[error("header claims total length {0}, shorter than the header itself")]
    LengthUnderflow(u32),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// The five little-endian u32 header fields, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub total_len: u32,
    pub packet_type: u32,
    pub sub_type: u32,
    pub sequence: u32,
    pub flags: u32,
}

impl PacketHeader {
    pub fn parse(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_LEN);
        Self {
            total_len: buf.get_u32_le(),
            packet_type: buf.get_u32_le(),
            sub_type: buf.get_u32_le(),
            sequence: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut cursor = &mut out[..];
        cursor.put_u32_le(self.total_len);
        cursor.put_u32_le(self.packet_type);
        cursor.put_u32_le(self.sub_type);
        cursor.put_u32_le(self.sequence);
        cursor.put_u32_le(self.flags);
        out
    }

    pub fn payload_len(&self) -> usize {
        self.total_len.saturating_sub(HEADER_LEN as u32) as usize
    }
}

/// One complete wire message.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// Inbound message classification, matched on exact `(type, sub, flags)`
/// tuples. Length and sequence act as wildcards except for the heartbeat,
/// which must be a bare header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Ping,
    Identify,
    Status,
    CommandAck,
    Map,
    Error,
    Unknown,
}

impl Packet {
    pub fn new(
        packet_type: u32,
        sub_type: u32,
        sequence: u32,
        flags: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            header: PacketHeader {
                total_len: (HEADER_LEN + payload.len()) as u32,
                packet_type,
                sub_type,
                sequence,
                flags,
            },
            payload,
        }
    }

    /// Header-only message (heartbeat pong).
    pub fn bare(packet_type: u32, sub_type: u32, sequence: u32, flags: u32) -> Self {
        Self::new(packet_type, sub_type, sequence, flags, Bytes::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn kind(&self) -> PacketKind {
        let h = &self.header;
        if h.total_len == HEADER_LEN as u32
            && h.packet_type == TYPE_PING
            && h.sub_type == SUB_PING
            && h.flags == FLAGS_PING
        {
            return PacketKind::Ping;
        }
        match (h.packet_type, h.sub_type, h.flags) {
            (TYPE_IDENTIFY, SUB_REPORT, 0x00) => PacketKind::Identify,
            (TYPE_STATUS, SUB_REPORT, 0x00) => PacketKind::Status,
            (TYPE_COMMAND_ACK, SUB_REPORT, 0x00) => PacketKind::CommandAck,
            (TYPE_MAP, SUB_REPORT, 0x00) => PacketKind::Map,
            (TYPE_ERROR, SUB_REPORT, 0x00) => PacketKind::Error,
            _ => PacketKind::Unknown,
        }
    }

    pub fn payload_json(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Frame extractor for the 20-byte-header protocol.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl FrameCodec for PacketCodec {
    type Frame = Packet;
    type Error = ProtocolError;

    fn try_extract(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = PacketHeader::parse(&buf[..HEADER_LEN]);
        if header.total_len < HEADER_LEN as u32 {
            return Err(ProtocolError::LengthUnderflow(header.total_len));
        }
        let payload_len = header.payload_len();
        if payload_len as u32 > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                claimed: payload_len as u32,
                max: MAX_PAYLOAD_LEN,
            });
        }
        if buf.len() < header.total_len as usize {
            return Ok(None);
        }
        let mut frame = buf.split_to(header.total_len as usize);
        let _ = frame.split_to(HEADER_LEN);
        Ok(Some(Packet {
            header,
            payload: frame.freeze(),
        }))
    }
}

/// Per-session credentials captured from the identify payload and echoed back
/// in every outbound command envelope.
#[derive(Debug, Clone)]
pub struct Session {
    pub auth_code: String,
    pub device_ip: String,
    pub device_port: String,
}

/// Identify payload fields (inside the `value` object).
#[derive(Debug, Clone, Deserialize)]
pub struct Identify {
    pub token: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "appKey")]
    pub app_key: String,
    #[serde(rename = "authCode")]
    pub auth_code: String,
    #[serde(rename = "deviceIp")]
    pub device_ip: String,
    #[serde(rename = "devicePort")]
    pub device_port: String,
}

impl Identify {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct Envelope {
            value: Identify,
        }
        let envelope: Envelope = serde_json::from_slice(payload)?;
        Ok(envelope.value)
    }

    pub fn session(&self) -> Session {
        Session {
            auth_code: self.auth_code.clone(),
            device_ip: self.device_ip.clone(),
            device_port: self.device_port.clone(),
        }
    }
}

/// Heartbeat reply, echoing the ping's sequence id.
pub fn pong(sequence: u32) -> Packet {
    Packet::bare(TYPE_PONG, SUB_PONG, sequence, FLAGS_PING)
}

/// Login-succeeded envelope sent after a valid identify.
pub fn login_ok(sequence: u32, timestamp: &str) -> Packet {
    let body = format!(
        "{{\"msg\":\"login succeed\",\"result\":0,\"version\":\"1.0\",\"time\":\"{timestamp}\"}}"
    );
    Packet::new(TYPE_LOGIN_OK, 0x01, sequence, 0x00, body)
}

/// Immediate OK acknowledgement for status and error reports.
pub fn ok_ack(sequence: u32) -> Packet {
    Packet::new(
        TYPE_OK_ACK,
        0x01,
        sequence,
        FLAGS_OK_ACK,
        "{\"msg\":\"OK\",\"result\":0,\"version\":\"1.0\"}\n",
    )
}

/// Outbound command envelope. The control block carries the credentials
/// captured at identify time; the firmware rejects commands without them.
pub fn command(sequence: u32, session: &Session, cmd: &TransitCommand) -> Packet {
    let mut value = serde_json::Map::new();
    if let Some((key, field)) = &cmd.prefix {
        value.insert((*key).to_string(), Value::String(field.clone()));
    }
    value.insert("transitCmd".to_string(), Value::String(cmd.code.to_string()));
    if let Some((key, field)) = &cmd.suffix {
        value.insert((*key).to_string(), Value::String(field.clone()));
    }
    let body = json!({
        "cmd": 0,
        "control": {
            "authCode": session.auth_code,
            "deviceIp": session.device_ip,
            "devicePort": session.device_port,
            "targetId": "1",
            "targetType": "3",
        },
        "seq": 0,
        "value": Value::Object(value),
    });
    let mut text = body.to_string();
    text.push('\n');
    Packet::new(TYPE_COMMAND, SUB_COMMAND, sequence, 0x00, text)
}
