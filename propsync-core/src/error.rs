//! Core error types.

use crate::segment::Fingerprint;
use propsync_protocol::{OpCode, PropertyId};
use propsync_transport::TransportError;
use thiserror::Error;

/// Errors raised while dispatching an operation to a property.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("property id {id} out of range ({count} properties)")]
    InvalidId { id: PropertyId, count: usize },

    #[error("invalid payload for property {id} ({actual} bytes, expected {expected})")]
    InvalidPayload {
        id: PropertyId,
        expected: usize,
        actual: usize,
    },

    #[error("operation {op:?} is not applicable to property {id}")]
    UnsupportedOperation { id: PropertyId, op: OpCode },

    #[error("operation {op:?} is not accepted by {role} property {id}")]
    UnexpectedOperation {
        id: PropertyId,
        op: OpCode,
        role: &'static str,
    },

    #[error("change notification received for master-owned property {0}")]
    UnexpectedNotification(PropertyId),

    #[error("client reported an incompatible shared segment (property {0})")]
    IncompatibleClient(PropertyId),
}

impl PropertyError {
    /// Whether the peer that caused this error must be disconnected.
    ///
    /// Other errors only drop the offending request.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PropertyError::UnexpectedOperation { .. }
                | PropertyError::UnexpectedNotification(_)
                | PropertyError::IncompatibleClient(_)
        )
    }
}

/// Errors from the POSIX shared memory segment.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("invalid segment name: {0:?}")]
    InvalidName(String),

    #[error("segment {0} already exists")]
    AlreadyExists(String),

    #[error("{op} failed for segment {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("segment {name} is incompatible: expected {expected}, found {}", describe_found(.found))]
    Incompatible {
        name: String,
        expected: Fingerprint,
        found: Option<Fingerprint>,
    },
}

fn describe_found(found: &Option<Fingerprint>) -> String {
    match found {
        Some(fingerprint) => fingerprint.to_string(),
        None => "no valid header".to_string(),
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("too many properties declared: {0}")]
    TooManyProperties(usize),

    #[error("registry has been shut down")]
    ShutDown,
}

impl RegistryError {
    /// Whether the failure is a shared segment layout mismatch.
    pub fn is_incompatible(&self) -> bool {
        matches!(
            self,
            RegistryError::Segment(SegmentError::Incompatible { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classes() {
        assert!(PropertyError::UnexpectedOperation {
            id: 0,
            op: OpCode::Invert,
            role: "client",
        }
        .is_protocol_violation());
        assert!(PropertyError::IncompatibleClient(0).is_protocol_violation());
        assert!(!PropertyError::InvalidId { id: 9, count: 2 }.is_protocol_violation());
        assert!(!PropertyError::InvalidPayload {
            id: 0,
            expected: 4,
            actual: 2,
        }
        .is_protocol_violation());
    }

    #[test]
    fn test_incompatible_display() {
        let err = SegmentError::Incompatible {
            name: "/seg".to_string(),
            expected: Fingerprint {
                segment_size: 40,
                property_count: 2,
            },
            found: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("/seg"));
        assert!(msg.contains("no valid header"));

        let err = RegistryError::from(err);
        assert!(err.is_incompatible());
    }
}
