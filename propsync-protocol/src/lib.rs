//! # propsync-protocol
//!
//! Wire protocol shared by propsync masters and slaves.
//!
//! This crate provides:
//! - The three stream framing disciplines (unframed, fixed-size, length-prefixed)
//! - A sans-IO frame decoder that reassembles messages from socket reads
//! - Property message encoding and the decoded request sum type
//!
//! Nothing here performs I/O; the transport crate drives the decoder.

pub mod error;
pub mod frame;
pub mod message;

pub use error::ProtocolError;
pub use frame::{
    decode_header, encode_header, FrameDecoder, Framing, FramingMode, DEFAULT_PACKET_SIZE, HEADER_SIZE, MAGIC,
};
pub use message::{
    encode_change_notification, EncodedRequest, Envelope, OpCode, PropertyId, Request,
    CHANGE_NOTIFICATION_SIZE, INLINE_PAYLOAD_CAPACITY, INVALID_PROPERTY_ID, REQUEST_HEADER_SIZE,
};
