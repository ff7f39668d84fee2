//! Wire format.
//!
//! A datagram is a prost [`WireEnvelope`] holding the protocol version, the
//! JSON-encoded message header and the raw payload bytes.

use prost::Message as _;

use crate::error::WhisperError;
use crate::message::Message;

/// Current wire protocol version.
pub const WIRE_VERSION: u32 = 1;

/// Largest datagram accepted or produced, in bytes.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Wire envelope for a single datagram.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireEnvelope {
    /// Protocol version for forward compatibility.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// JSON-encoded [`Message`] without its payload.
    #[prost(bytes = "vec", tag = "2")]
    pub header: Vec<u8>,
    /// Message payload.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Encodes a message into a datagram.
///
/// # Errors
///
/// Returns [`WhisperError::PayloadTooLarge`] if the result exceeds
/// [`MAX_PACKET_SIZE`], or a codec error if the header can't be serialized.
pub fn encode(message: &Message) -> Result<Vec<u8>, WhisperError> {
    let header = serde_json::to_vec(message)
        .map_err(|e| WhisperError::Codec(format!("failed to serialize header: {e}")))?;

    let bytes = WireEnvelope {
        version: WIRE_VERSION,
        header,
        payload: message.payload.clone(),
    }
    .encode_to_vec();

    if bytes.len() > MAX_PACKET_SIZE {
        return Err(WhisperError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(bytes)
}

/// Decodes a datagram into a message.
///
/// # Errors
///
/// Returns a codec error if the envelope or header is malformed or the
/// version is newer than [`WIRE_VERSION`].
pub fn decode(bytes: &[u8]) -> Result<Message, WhisperError> {
    let envelope = WireEnvelope::decode(bytes)
        .map_err(|e| WhisperError::Codec(format!("failed to decode envelope: {e}")))?;

    if envelope.version > WIRE_VERSION {
        return Err(WhisperError::Codec(format!(
            "unsupported wire version: {} (max supported: {WIRE_VERSION})",
            envelope.version
        )));
    }

    let mut message: Message = serde_json::from_slice(&envelope.header)
        .map_err(|e| WhisperError::Codec(format!("failed to deserialize header: {e}")))?;
    message.payload = envelope.payload;
    Ok(message)
}
