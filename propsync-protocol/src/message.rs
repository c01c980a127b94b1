//! Property messages.
//!
//! Three message shapes travel inside a frame, distinguished by length:
//!
//! ```text
//! change notification   | id u16 |
//! operator-only request | id u16 | op u16 |
//! data-bearing request  | id u16 | op u16 | payload ... |
//! ```
//!
//! All integers are native endian.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Dense property id, identical in master and slaves.
pub type PropertyId = u16;

/// Reserved id that never names a property.
pub const INVALID_PROPERTY_ID: PropertyId = PropertyId::MAX;

/// Size of a change notification message.
pub const CHANGE_NOTIFICATION_SIZE: usize = std::mem::size_of::<PropertyId>();

/// Size of the request header (`id` + `op`).
pub const REQUEST_HEADER_SIZE: usize = CHANGE_NOTIFICATION_SIZE + std::mem::size_of::<u16>();

/// Payloads up to this size are sent in the same segment as the request header.
pub const INLINE_PAYLOAD_CAPACITY: usize = 16;

/// Operation codes carried in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    Set = 0,
    Add,
    Multiply,
    Divide,
    And,
    Or,
    Xor,
    Invert,
    Message,
    HandlesChangeNotifications,
    ReportIncompatibleClient,
}

impl TryFrom<u16> for OpCode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => OpCode::Set,
            1 => OpCode::Add,
            2 => OpCode::Multiply,
            3 => OpCode::Divide,
            4 => OpCode::And,
            5 => OpCode::Or,
            6 => OpCode::Xor,
            7 => OpCode::Invert,
            8 => OpCode::Message,
            9 => OpCode::HandlesChangeNotifications,
            10 => OpCode::ReportIncompatibleClient,
            other => return Err(ProtocolError::UnknownOperation(other)),
        })
    }
}

/// A decoded request addressed to one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Set(Bytes),
    Add(Bytes),
    Multiply(Bytes),
    Divide(Bytes),
    And(Bytes),
    Or(Bytes),
    Xor(Bytes),
    Invert,
    Message(String),
    /// Client asks to receive change notifications for the property.
    SubscribeChanges,
    /// Client found the shared segment incompatible with its own layout.
    ReportIncompatible,
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Set(_) => OpCode::Set,
            Request::Add(_) => OpCode::Add,
            Request::Multiply(_) => OpCode::Multiply,
            Request::Divide(_) => OpCode::Divide,
            Request::And(_) => OpCode::And,
            Request::Or(_) => OpCode::Or,
            Request::Xor(_) => OpCode::Xor,
            Request::Invert => OpCode::Invert,
            Request::Message(_) => OpCode::Message,
            Request::SubscribeChanges => OpCode::HandlesChangeNotifications,
            Request::ReportIncompatible => OpCode::ReportIncompatibleClient,
        }
    }

    /// Returns the value operand of a data-bearing operation.
    pub fn operand(&self) -> Option<&Bytes> {
        match self {
            Request::Set(b)
            | Request::Add(b)
            | Request::Multiply(b)
            | Request::Divide(b)
            | Request::And(b)
            | Request::Or(b)
            | Request::Xor(b) => Some(b),
            _ => None,
        }
    }

    /// Encodes the request for property `id`.
    pub fn encode(&self, id: PropertyId) -> EncodedRequest {
        let mut header = BytesMut::with_capacity(REQUEST_HEADER_SIZE + INLINE_PAYLOAD_CAPACITY);
        header.put_slice(&id.to_ne_bytes());
        header.put_slice(&(self.op_code() as u16).to_ne_bytes());

        let payload = match self {
            Request::Message(text) => {
                let mut buf = BytesMut::with_capacity(text.len() + 1);
                buf.put_slice(text.as_bytes());
                buf.put_u8(0);
                buf.freeze()
            }
            other => match other.operand() {
                Some(bytes) => bytes.clone(),
                None => {
                    return EncodedRequest {
                        primary: header.freeze(),
                        secondary: None,
                    }
                }
            },
        };

        if payload.len() <= INLINE_PAYLOAD_CAPACITY {
            header.put_slice(&payload);
            EncodedRequest {
                primary: header.freeze(),
                secondary: None,
            }
        } else {
            EncodedRequest {
                primary: header.freeze(),
                secondary: Some(payload),
            }
        }
    }
}

/// Wire form of a request: one segment, or header plus a separate payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
    pub primary: Bytes,
    pub secondary: Option<Bytes>,
}

impl EncodedRequest {
    /// Total message length across both segments.
    pub fn len(&self) -> usize {
        self.primary.len() + self.secondary.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encodes a change notification for property `id`.
pub fn encode_change_notification(id: PropertyId) -> Bytes {
    Bytes::copy_from_slice(&id.to_ne_bytes())
}

/// A decoded property message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    ChangeNotification(PropertyId),
    Request { id: PropertyId, request: Request },
}

impl Envelope {
    /// Decodes one reassembled message.
    pub fn decode(message: Bytes) -> Result<Self, ProtocolError> {
        let len = message.len();
        if len == CHANGE_NOTIFICATION_SIZE {
            return Ok(Envelope::ChangeNotification(read_u16(&message, 0)));
        }
        if len < REQUEST_HEADER_SIZE {
            return Err(ProtocolError::Truncated(len));
        }

        let id = read_u16(&message, 0);
        let op = OpCode::try_from(read_u16(&message, CHANGE_NOTIFICATION_SIZE))?;

        let request = if len == REQUEST_HEADER_SIZE {
            match op {
                OpCode::Invert => Request::Invert,
                OpCode::HandlesChangeNotifications => Request::SubscribeChanges,
                OpCode::ReportIncompatibleClient => Request::ReportIncompatible,
                other => return Err(ProtocolError::MissingPayload(other)),
            }
        } else {
            let payload = message.slice(REQUEST_HEADER_SIZE..);
            match op {
                OpCode::Set => Request::Set(payload),
                OpCode::Add => Request::Add(payload),
                OpCode::Multiply => Request::Multiply(payload),
                OpCode::Divide => Request::Divide(payload),
                OpCode::And => Request::And(payload),
                OpCode::Or => Request::Or(payload),
                OpCode::Xor => Request::Xor(payload),
                OpCode::Message => Request::Message(decode_text(&payload)?),
                other => return Err(ProtocolError::UnexpectedPayload(other)),
            }
        };

        Ok(Envelope::Request { id, request })
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn decode_text(payload: &[u8]) -> Result<String, ProtocolError> {
    if payload.last() != Some(&0) {
        return Err(ProtocolError::UnterminatedMessage);
    }
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(encoded: &EncodedRequest) -> Bytes {
        let mut buf = BytesMut::from(encoded.primary.as_ref());
        if let Some(secondary) = &encoded.secondary {
            buf.put_slice(secondary);
        }
        buf.freeze()
    }

    #[test]
    fn test_change_notification() {
        let msg = encode_change_notification(7);
        assert_eq!(msg.len(), CHANGE_NOTIFICATION_SIZE);
        assert_eq!(
            Envelope::decode(msg).unwrap(),
            Envelope::ChangeNotification(7)
        );
    }

    #[test]
    fn test_inline_vs_split_payload() {
        let small = Request::Set(Bytes::from(vec![1u8; INLINE_PAYLOAD_CAPACITY]));
        let encoded = small.encode(3);
        assert!(encoded.secondary.is_none());
        assert_eq!(encoded.len(), REQUEST_HEADER_SIZE + INLINE_PAYLOAD_CAPACITY);

        let large = Request::Set(Bytes::from(vec![1u8; INLINE_PAYLOAD_CAPACITY + 1]));
        let encoded = large.encode(3);
        assert_eq!(encoded.primary.len(), REQUEST_HEADER_SIZE);
        assert_eq!(
            encoded.secondary.as_ref().map(|s| s.len()),
            Some(INLINE_PAYLOAD_CAPACITY + 1)
        );

        let decoded = Envelope::decode(join(&encoded)).unwrap();
        assert_eq!(
            decoded,
            Envelope::Request {
                id: 3,
                request: large
            }
        );
    }

    #[test]
    fn test_header_only_requests() {
        for request in [
            Request::Invert,
            Request::SubscribeChanges,
            Request::ReportIncompatible,
        ] {
            let encoded = request.encode(1);
            assert_eq!(encoded.len(), REQUEST_HEADER_SIZE);
            assert_eq!(
                Envelope::decode(join(&encoded)).unwrap(),
                Envelope::Request { id: 1, request }
            );
        }
    }

    #[test]
    fn test_message_is_nul_terminated() {
        let encoded = Request::Message("volume up".to_string()).encode(2);
        let wire = join(&encoded);
        assert_eq!(wire.last(), Some(&0));
        assert_eq!(wire.len(), REQUEST_HEADER_SIZE + "volume up".len() + 1);

        match Envelope::decode(wire).unwrap() {
            Envelope::Request {
                id: 2,
                request: Request::Message(text),
            } => assert_eq!(text, "volume up"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_message_rejected() {
        let mut wire = BytesMut::new();
        wire.put_slice(&0u16.to_ne_bytes());
        wire.put_slice(&(OpCode::Message as u16).to_ne_bytes());
        wire.put_slice(b"abc");
        assert_eq!(
            Envelope::decode(wire.freeze()),
            Err(ProtocolError::UnterminatedMessage)
        );
    }

    #[test]
    fn test_unknown_operation() {
        let mut wire = BytesMut::new();
        wire.put_slice(&0u16.to_ne_bytes());
        wire.put_slice(&99u16.to_ne_bytes());
        assert_eq!(
            Envelope::decode(wire.freeze()),
            Err(ProtocolError::UnknownOperation(99))
        );
    }

    #[test]
    fn test_payload_shape_checks() {
        let mut wire = BytesMut::new();
        wire.put_slice(&0u16.to_ne_bytes());
        wire.put_slice(&(OpCode::Add as u16).to_ne_bytes());
        assert_eq!(
            Envelope::decode(wire.clone().freeze()),
            Err(ProtocolError::MissingPayload(OpCode::Add))
        );

        let mut wire = BytesMut::new();
        wire.put_slice(&0u16.to_ne_bytes());
        wire.put_slice(&(OpCode::Invert as u16).to_ne_bytes());
        wire.put_u8(1);
        assert_eq!(
            Envelope::decode(wire.freeze()),
            Err(ProtocolError::UnexpectedPayload(OpCode::Invert))
        );

        assert_eq!(
            Envelope::decode(Bytes::from_static(&[1, 2, 3])),
            Err(ProtocolError::Truncated(3))
        );
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(OpCode::Set as u16, 0);
        assert_eq!(OpCode::Invert as u16, 7);
        assert_eq!(OpCode::ReportIncompatibleClient as u16, 10);
        for code in 0..=10u16 {
            assert_eq!(OpCode::try_from(code).unwrap() as u16, code);
        }
    }
}
