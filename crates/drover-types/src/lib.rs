//! Shared types and identifiers for Drover.
//!
//! This crate defines the vocabulary used across the Drover workspace:
//! endpoints and cluster records ([`Endpoint`], [`ClusterRec`]), the message
//! tag space ([`MsgType`]), envelope flag bits ([`flags`]), numeric error
//! codes carried on the wire ([`codes`]), and the process-wide configuration
//! snapshot ([`config::ProtoConfig`]).

pub mod config;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel for "no 32-bit value".
pub const NO_VAL: u32 = 0xffff_fffe;

/// Sentinel for "no 16-bit value".
pub const NO_VAL16: u16 = 0xfffe;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// A host plus port, before DNS resolution.
///
/// Resolution to a `SocketAddr` happens in the transport's resolver, which
/// accepts endpoints everywhere a peer is named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or dotted-quad address.
    pub host: String,
    /// Port in host order.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host string and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `"host"` or `"host:port"` string.
    ///
    /// An embedded port wins over `default_port`; a trailing `:segment`
    /// that is not a port number is treated as part of the host.
    pub fn parse(spec: &str, default_port: u16) -> Self {
        match spec.rsplit_once(':') {
            Some((host, p)) => match p.parse::<u16>() {
                Ok(port) => Self::new(host, port),
                Err(_) => Self::new(spec, default_port),
            },
            None => Self::new(spec, default_port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Communication record for cross-cluster messaging.
///
/// When present, it overrides the configured controller set with an explicit
/// host/port/protocol-version triple, and the message is signed with the
/// process-wide auth key ([`flags::GLOBAL_AUTH_KEY`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRec {
    /// Controller host of the target cluster.
    pub host: String,
    /// Controller port of the target cluster.
    pub port: u16,
    /// Protocol version spoken by the target cluster.
    pub protocol_version: u16,
}

impl ClusterRec {
    /// The endpoint this record points at.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

// ---------------------------------------------------------------------------
// Message tags
// ---------------------------------------------------------------------------

/// 16-bit tag naming the payload schema of a message.
///
/// The transport core treats the tag as opaque except for the handful of
/// types it must recognize itself (return codes, reroutes, fan-out failure
/// markers, and the composite aggregator acknowledgement).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgType(pub u16);

impl MsgType {
    /// Generic return-code reply.
    pub const RETURN_CODE: MsgType = MsgType(0x1001);
    /// Controller instruction to resend to a different cluster.
    pub const REROUTE: MsgType = MsgType(0x1002);
    /// Synthetic per-node entry for an unreachable fan-out target.
    pub const FORWARD_FAILED: MsgType = MsgType(0x1003);
    /// Composite transport envelope; acked immediately on forwarding nodes.
    pub const COMPOSITE: MsgType = MsgType(0x1004);
    /// Liveness probe.
    pub const PING: MsgType = MsgType(0x2001);
    /// Reply to [`MsgType::PING`].
    pub const PONG: MsgType = MsgType(0x2002);
    /// Echo request carrying arbitrary bytes.
    pub const ECHO: MsgType = MsgType(0x2003);
    /// Reply to [`MsgType::ECHO`].
    pub const ECHO_REPLY: MsgType = MsgType(0x2004);
    /// Node agent announcing its listen addresses.
    pub const REGISTER_NODE: MsgType = MsgType(0x2005);
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl fmt::Debug for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgType(0x{:04x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope flags
// ---------------------------------------------------------------------------

/// Bit flags carried in the envelope header.
pub mod flags {
    /// Sign/verify this message with the process-wide auth key instead of
    /// the default configured secret.
    pub const GLOBAL_AUTH_KEY: u16 = 0x0001;
    /// Caller wants the raw received frame retained on the message.
    pub const KEEP_BUFFER: u16 = 0x0002;
}

// ---------------------------------------------------------------------------
// Wire error codes
// ---------------------------------------------------------------------------

/// Numeric error codes surfaced at the transport boundary.
///
/// These travel inside return-code payloads and per-node fan-out failure
/// entries, so they are stable u32 values rather than a Rust-only enum.
pub mod codes {
    pub const SUCCESS: u32 = 0;

    pub const COMM_CONNECTION_ERROR: u32 = 1001;
    pub const COMM_SEND_ERROR: u32 = 1002;
    pub const COMM_RECEIVE_ERROR: u32 = 1003;
    pub const COMM_SHUTDOWN_ERROR: u32 = 1004;

    pub const PROTOCOL_VERSION_ERROR: u32 = 1005;
    pub const PROTOCOL_AUTH_ERROR: u32 = 1006;
    pub const PROTOCOL_INCOMPLETE_PACKET: u32 = 1007;

    pub const CONTROLLER_CONNECTION_ERROR: u32 = 1011;
    pub const CONTROLLER_SEND_ERROR: u32 = 1012;
    pub const CONTROLLER_RECEIVE_ERROR: u32 = 1013;
    pub const CONTROLLER_SHUTDOWN_ERROR: u32 = 1014;

    /// The contacted controller replica has not assumed the primary role.
    pub const IN_STANDBY_MODE: u32 = 2058;
}
