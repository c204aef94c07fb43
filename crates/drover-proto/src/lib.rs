//! Wire envelope for the Drover transport.
//!
//! This crate owns everything between raw frame bytes and a typed
//! [`Message`]:
//!
//! - [`Header`] — the envelope header with its forwarding descriptor and
//!   inline return list.
//! - [`codec`] — frame pack/unpack, including the in-place body-length
//!   rewrite and credential region handling.
//! - [`payload`] — the tag-dispatched payload codec registry; the transport
//!   never interprets payload bytes beyond this dispatch.
//!
//! Socket I/O lives one layer up; this crate is pure bytes.

pub mod codec;
mod error;
mod header;
mod message;
pub mod payload;
pub mod wire;

pub use error::ProtoError;
pub use header::{BODY_LENGTH_OFFSET, ForwardInfo, Header};
pub use message::{ForwardPending, Message, RetEntry};
pub use payload::{PayloadValue, decode_payload, register_codec};

/// Current protocol version spoken by this build.
pub const PROTO_VERSION: u16 = 12 << 8;

/// Oldest protocol version this build still accepts.
pub const PROTO_VERSION_MIN: u16 = 10 << 8;

/// Hard cap on a single frame, applied before any allocation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
