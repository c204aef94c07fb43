//! Error types for transport operations.

use drover_proto::ProtoError;
use drover_types::codes;

/// Errors surfaced at the transport boundary.
///
/// The controller variants mirror the four communication errors; callers
/// that talk to the controller remap through [`CommError::into_controller`]
/// after each call.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// Failed to establish a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Failed to send a framed message.
    #[error("send error: {0}")]
    Send(String),

    /// Failed to receive a framed message (I/O or timeout).
    #[error("receive error: {0}")]
    Receive(String),

    /// Failed to shut down a connection cleanly.
    #[error("shutdown error: {0}")]
    Shutdown(String),

    /// Could not reach any controller replica.
    #[error("controller connection error: {0}")]
    ControllerConnection(String),

    /// Send to the controller failed.
    #[error("controller send error: {0}")]
    ControllerSend(String),

    /// Receive from the controller failed.
    #[error("controller receive error: {0}")]
    ControllerReceive(String),

    /// Controller connection shutdown failed.
    #[error("controller shutdown error: {0}")]
    ControllerShutdown(String),

    /// No controllers (or no controller port) configured.
    #[error("no controllers configured")]
    NoControllers,

    /// Envelope-level failure: framing, version, or authentication.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl CommError {
    /// The numeric code this error surfaces as on the wire.
    pub fn code(&self) -> u32 {
        match self {
            CommError::Connection(_) => codes::COMM_CONNECTION_ERROR,
            CommError::Send(_) => codes::COMM_SEND_ERROR,
            CommError::Receive(_) => codes::COMM_RECEIVE_ERROR,
            CommError::Shutdown(_) => codes::COMM_SHUTDOWN_ERROR,
            CommError::ControllerConnection(_) | CommError::NoControllers => {
                codes::CONTROLLER_CONNECTION_ERROR
            }
            CommError::ControllerSend(_) => codes::CONTROLLER_SEND_ERROR,
            CommError::ControllerReceive(_) => codes::CONTROLLER_RECEIVE_ERROR,
            CommError::ControllerShutdown(_) => codes::CONTROLLER_SHUTDOWN_ERROR,
            CommError::Proto(e) => e.code(),
        }
    }

    /// Remap generic communication errors to their controller variants.
    pub fn into_controller(self) -> CommError {
        match self {
            CommError::Connection(s) => CommError::ControllerConnection(s),
            CommError::Send(s) => CommError::ControllerSend(s),
            CommError::Receive(s) => CommError::ControllerReceive(s),
            CommError::Shutdown(s) => CommError::ControllerShutdown(s),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_remap() {
        let remapped = CommError::Connection("refused".to_string()).into_controller();
        assert!(matches!(remapped, CommError::ControllerConnection(_)));
        assert_eq!(remapped.code(), codes::CONTROLLER_CONNECTION_ERROR);

        // Envelope errors keep their identity through the remap.
        let auth = CommError::Proto(ProtoError::IncompletePacket).into_controller();
        assert_eq!(auth.code(), codes::PROTOCOL_INCOMPLETE_PACKET);
    }
}
