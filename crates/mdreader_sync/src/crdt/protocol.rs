//! Y-sync protocol implementation for Hocuspocus compatibility.
//!
//! # Wire Format (y-protocols compatible)
//!
//! Every WebSocket binary frame carries one document's traffic:
//!
//! ```text
//! varString(room) ++ varUint(msgType) ++ body
//! ```
//!
//! - `varUint(0)`: Sync message
//!   - `varUint(0)`: SyncStep1 - contains state vector
//!   - `varUint(1)`: SyncStep2 - contains missing updates
//!   - `varUint(2)`: Update - contains incremental update
//! - `varUint(1)`: Awareness message (ignored)
//! - `varUint(2)`: Auth message
//!   - `varUint(0)`: Token - `varString(token)`
//!   - `varUint(1)`: PermissionDenied - `varString(reason)`
//!   - `varUint(2)`: Authenticated - `varString(scope)`
//!
//! Byte arrays are encoded as `varUint(length) + raw bytes`; strings as the
//! byte array of their UTF-8 encoding.

use crate::error::{Result, SyncError};

// ===========================================================================
// VarUint encoding/decoding (y-protocols compatible)
// ===========================================================================

/// Write a variable-length unsigned integer to a buffer.
/// Uses 7 bits per byte, with MSB indicating continuation.
pub fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer from a buffer.
/// Returns (value, bytes_consumed) or None if buffer is too short.
pub fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

/// Write a byte array with length prefix.
pub fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read a byte array with length prefix.
/// Returns (data, bytes_consumed) or None if buffer is too short.
pub fn read_var_byte_array(data: &[u8]) -> Option<(&[u8], usize)> {
    let (len, len_bytes) = read_var_uint(data)?;
    let total = len_bytes.checked_add(usize::try_from(len).ok()?)?;
    if data.len() < total {
        return None;
    }
    Some((&data[len_bytes..total], total))
}

/// Write a UTF-8 string with length prefix.
pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_byte_array(buf, s.as_bytes());
}

/// Read a UTF-8 string with length prefix.
pub fn read_var_string(data: &[u8]) -> Option<(String, usize)> {
    let (bytes, consumed) = read_var_byte_array(data)?;
    let s = std::str::from_utf8(bytes).ok()?;
    Some((s.to_string(), consumed))
}

/// Message type bytes.
mod msg_type {
    pub const SYNC: u64 = 0;
    pub const AWARENESS: u64 = 1;
    pub const AUTH: u64 = 2;
}

/// Sync sub-message types.
mod sync_type {
    pub const STEP1: u64 = 0;
    pub const STEP2: u64 = 1;
    pub const UPDATE: u64 = 2;
}

/// Auth sub-message types.
mod auth_type {
    pub const TOKEN: u64 = 0;
    pub const PERMISSION_DENIED: u64 = 1;
    pub const AUTHENTICATED: u64 = 2;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    SyncStep1(Vec<u8>),
    /// SyncStep2 contains missing updates
    SyncStep2(Vec<u8>),
    /// Update contains an incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    fn sub_type(&self) -> u64 {
        match self {
            SyncMessage::SyncStep1(_) => sync_type::STEP1,
            SyncMessage::SyncStep2(_) => sync_type::STEP2,
            SyncMessage::Update(_) => sync_type::UPDATE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(p) | SyncMessage::SyncStep2(p) | SyncMessage::Update(p) => p,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        write_var_uint(buf, msg_type::SYNC);
        write_var_uint(buf, self.sub_type());
        write_var_byte_array(buf, self.payload());
    }

    /// Encode as `varUint(0) + varUint(syncType) + varByteArray(payload)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload().len() + 8);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a sync sub-message (sync type + payload) without the message
    /// type prefix. Returns (message, bytes_consumed), or None if incomplete.
    fn decode_sub_message(data: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some((sub, sub_bytes)) = read_var_uint(data) else {
            return Ok(None);
        };
        let Some((payload, payload_bytes)) = read_var_byte_array(&data[sub_bytes..]) else {
            log::debug!("[Y-sync] Incomplete payload");
            return Ok(None);
        };
        let payload = payload.to_vec();
        let msg = match sub {
            sync_type::STEP1 => SyncMessage::SyncStep1(payload),
            sync_type::STEP2 => SyncMessage::SyncStep2(payload),
            sync_type::UPDATE => SyncMessage::Update(payload),
            other => {
                return Err(SyncError::Crdt(format!("Unknown sync type: {}", other)));
            }
        };
        Ok(Some((msg, sub_bytes + payload_bytes)))
    }

    /// Decode every sub-message of a sync body.
    ///
    /// Hocuspocus can send multiple sub-messages (e.g., SyncStep2 +
    /// SyncStep1) after a single message type prefix.
    pub fn decode_all(body: &[u8]) -> Result<Vec<Self>> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            match Self::decode_sub_message(&body[offset..])? {
                Some((msg, consumed)) => {
                    messages.push(msg);
                    offset += consumed;
                }
                None => break,
            }
        }
        Ok(messages)
    }
}

/// Authentication messages exchanged before syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    /// Client presents its session token
    Token(String),
    /// Server refused the token
    PermissionDenied(String),
    /// Server accepted the token; carries the granted scope
    Authenticated(String),
}

impl AuthMessage {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        write_var_uint(buf, msg_type::AUTH);
        let (sub, text) = match self {
            AuthMessage::Token(t) => (auth_type::TOKEN, t),
            AuthMessage::PermissionDenied(r) => (auth_type::PERMISSION_DENIED, r),
            AuthMessage::Authenticated(s) => (auth_type::AUTHENTICATED, s),
        };
        write_var_uint(buf, sub);
        write_var_string(buf, text);
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let (sub, sub_bytes) = read_var_uint(body)
            .ok_or_else(|| SyncError::Crdt("Incomplete auth message".to_string()))?;
        let text = read_var_string(&body[sub_bytes..])
            .map(|(s, _)| s)
            .unwrap_or_default();
        match sub {
            auth_type::TOKEN => Ok(AuthMessage::Token(text)),
            auth_type::PERMISSION_DENIED => Ok(AuthMessage::PermissionDenied(text)),
            auth_type::AUTHENTICATED => Ok(AuthMessage::Authenticated(text)),
            other => Err(SyncError::Crdt(format!("Unknown auth type: {}", other))),
        }
    }
}

/// Decoded content of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// One or more sync sub-messages
    Sync(Vec<SyncMessage>),
    /// An auth message
    Auth(AuthMessage),
    /// Awareness or an unknown message type; ignored
    Other(u64),
}

/// One WebSocket frame addressed to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Room name; the document id, verbatim
    pub room: String,
    /// Message carried by the frame
    pub payload: Payload,
}

impl Frame {
    /// Frame carrying a single sync message.
    pub fn sync(room: impl Into<String>, message: SyncMessage) -> Self {
        Self {
            room: room.into(),
            payload: Payload::Sync(vec![message]),
        }
    }

    /// Frame carrying an auth message.
    pub fn auth(room: impl Into<String>, message: AuthMessage) -> Self {
        Self {
            room: room.into(),
            payload: Payload::Auth(message),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.room.len() + 16);
        write_var_string(&mut buf, &self.room);
        match &self.payload {
            Payload::Sync(messages) => {
                // Later sub-messages share the first one's type prefix
                if let Some((first, rest)) = messages.split_first() {
                    first.encode_into(&mut buf);
                    for msg in rest {
                        write_var_uint(&mut buf, msg.sub_type());
                        write_var_byte_array(&mut buf, msg.payload());
                    }
                }
            }
            Payload::Auth(message) => message.encode_into(&mut buf),
            Payload::Other(kind) => write_var_uint(&mut buf, *kind),
        }
        buf
    }

    /// Decode wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (room, room_bytes) = read_var_string(data)
            .ok_or_else(|| SyncError::Crdt("Frame without a room name".to_string()))?;
        let rest = &data[room_bytes..];
        let (kind, kind_bytes) = read_var_uint(rest)
            .ok_or_else(|| SyncError::Crdt(format!("Empty frame for room {}", room)))?;
        let body = &rest[kind_bytes..];

        let payload = match kind {
            msg_type::SYNC => Payload::Sync(SyncMessage::decode_all(body)?),
            msg_type::AUTH => Payload::Auth(AuthMessage::decode_body(body)?),
            msg_type::AWARENESS => Payload::Other(kind),
            other => {
                log::debug!("[Y-sync] Ignoring message type {} for {}", other, room);
                Payload::Other(other)
            }
        };
        Ok(Self { room, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_uint_boundaries() {
        for n in [0u64, 127, 128, 16_383, 16_384, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_var_uint(&mut buf, n);
            assert_eq!(read_var_uint(&buf), Some((n, buf.len())));
        }
        assert_eq!(read_var_uint(&[0x80]), None);
    }

    #[test]
    fn test_sync_message_wire_bytes() {
        let msg = SyncMessage::SyncStep1(vec![0xAA, 0xBB]);
        assert_eq!(msg.encode(), vec![0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_frame_prefixes_room_verbatim() {
        let frame = Frame::sync("doc 1/ü", SyncMessage::Update(vec![7]));
        let bytes = frame.encode();
        assert_eq!(bytes[0] as usize, "doc 1/ü".len());
        assert_eq!(&bytes[1..1 + "doc 1/ü".len()], "doc 1/ü".as_bytes());
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_combined_sync_messages() {
        let frame = Frame {
            room: "r".to_string(),
            payload: Payload::Sync(vec![
                SyncMessage::SyncStep2(vec![1, 2]),
                SyncMessage::SyncStep1(vec![3]),
            ]),
        };
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_auth_messages() {
        let frame = Frame::auth("r", AuthMessage::PermissionDenied("expired".into()));
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_awareness_is_ignored() {
        let mut bytes = Vec::new();
        write_var_string(&mut bytes, "r");
        write_var_uint(&mut bytes, 1);
        bytes.extend_from_slice(&[5, 6, 7]);
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.payload, Payload::Other(1));
    }

    #[test]
    fn test_truncated_frames_are_errors() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[5, b'a']).is_err());
        let mut bytes = Vec::new();
        write_var_string(&mut bytes, "r");
        write_var_uint(&mut bytes, 0);
        write_var_uint(&mut bytes, 9);
        write_var_byte_array(&mut bytes, &[1]);
        assert!(Frame::decode(&bytes).is_err());
    }
}
