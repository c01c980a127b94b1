//! Protocol error types.

use crate::message::OpCode;
use thiserror::Error;

/// Errors raised while framing or decoding property messages.
///
/// Every variant is a protocol violation: the connection that produced it
/// is shut down rather than repaired.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: i32, actual: i32 },

    #[error("invalid declared message size: {0}")]
    InvalidSize(i64),

    #[error("receive overrun: {received} bytes received, {expected} expected")]
    Overrun { expected: usize, received: usize },

    #[error("fixed-size packet mismatch: expected {expected} bytes, got {actual}")]
    FixedSizeMismatch { expected: usize, actual: usize },

    #[error("truncated message: {0} bytes")]
    Truncated(usize),

    #[error("unknown operation code: {0}")]
    UnknownOperation(u16),

    #[error("operation {0:?} requires a payload")]
    MissingPayload(OpCode),

    #[error("operation {0:?} does not take a payload")]
    UnexpectedPayload(OpCode),

    #[error("text message is not NUL-terminated")]
    UnterminatedMessage,

    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
}
