//! Error types for whisper-net.

use thiserror::Error;

use crate::node::NodeId;

/// Errors that can occur in whisper operations.
#[derive(Debug, Error)]
pub enum WhisperError {
    /// A value or message field failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The node is not registered in the topology.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// No route between the two nodes is known.
    #[error("no route from {from} to {to}")]
    RouteNotFound {
        /// Source node of the lookup.
        from: NodeId,
        /// Destination node of the lookup.
        to: NodeId,
    },

    /// A peer violated the messaging protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An encoded message exceeds the datagram limit.
    #[error("message size {size} exceeds packet size of {max} bytes")]
    PayloadTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Maximum permitted size in bytes.
        max: usize,
    },

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The transport was closed.
    #[error("transport closed")]
    TransportClosed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WhisperError {
    /// Returns true if the error concerns a single inbound datagram
    /// rather than the transport itself.
    #[must_use]
    pub const fn is_datagram_fault(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NodeNotFound(_)
                | Self::RouteNotFound { .. }
                | Self::Protocol(_)
                | Self::PayloadTooLarge { .. }
                | Self::Codec(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = WhisperError::Validation("message id is required".to_string());
        assert_eq!(err.to_string(), "validation failed: message id is required");
    }

    #[test]
    fn payload_too_large_display() {
        let err = WhisperError::PayloadTooLarge {
            size: 5000,
            max: 4096,
        };
        assert_eq!(
            err.to_string(),
            "message size 5000 exceeds packet size of 4096 bytes"
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken");
        let err: WhisperError = io.into();
        assert!(matches!(err, WhisperError::Io(_)));
        assert!(!err.is_datagram_fault());
    }

    #[test]
    fn datagram_faults_are_classified() {
        assert!(WhisperError::Codec("bad".into()).is_datagram_fault());
        assert!(WhisperError::Protocol("bad".into()).is_datagram_fault());
        assert!(!WhisperError::TransportClosed.is_datagram_fault());
        assert!(!WhisperError::ChannelClosed.is_datagram_fault());
    }
}
