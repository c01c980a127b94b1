//! Transport error types.

use propsync_protocol::ProtocolError;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("endpoint name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("abstract socket names are not supported on this platform")]
    AbstractUnsupported,
}

impl TransportError {
    /// Returns whether a later connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(TransportError::Io(io).is_retryable());
        assert!(TransportError::NotConnected.is_retryable());
        assert!(!TransportError::NameTooLong { len: 200, max: 107 }.is_retryable());
        assert!(!TransportError::ShortWrite {
            written: 3,
            expected: 20,
        }
        .is_retryable());
        assert!(!TransportError::Protocol(ProtocolError::InvalidSize(0)).is_retryable());
    }
}
