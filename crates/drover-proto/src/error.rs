//! Error types for envelope encoding and decoding.

use drover_auth::AuthError;
use drover_types::codes;

/// Errors produced while framing or parsing the wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A length field points past the end of the buffer, or a region is
    /// truncated or malformed.
    #[error("incomplete packet")]
    IncompletePacket,

    /// The peer speaks a protocol version outside the supported window.
    #[error("unsupported protocol version 0x{version:04x}")]
    VersionMismatch {
        /// Version the peer announced.
        version: u16,
        /// Sender uid recovered from the credential, when derivable.
        uid: Option<u32>,
    },

    /// Header parse or transport-level read failure.
    #[error("receive error: {0}")]
    Receive(String),

    /// A payload or header region could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// The credential failed to unpack or verify.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
}

impl ProtoError {
    /// The numeric code this error surfaces as on the wire.
    pub fn code(&self) -> u32 {
        match self {
            ProtoError::IncompletePacket => codes::PROTOCOL_INCOMPLETE_PACKET,
            ProtoError::VersionMismatch { .. } => codes::PROTOCOL_VERSION_ERROR,
            ProtoError::Receive(_) => codes::COMM_RECEIVE_ERROR,
            ProtoError::Encode(_) => codes::COMM_SEND_ERROR,
            ProtoError::Auth(_) => codes::PROTOCOL_AUTH_ERROR,
        }
    }
}
