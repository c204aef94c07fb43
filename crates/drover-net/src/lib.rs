//! TCP transport for the Drover RPC protocol.
//!
//! This crate connects the wire envelope of `drover-proto` to real
//! sockets:
//!
//! - [`resolver`] — active-controller resolution with port jitter and
//!   cross-cluster overrides.
//! - [`conn`] — per-exchange connections and long-lived listening sockets.
//! - [`engine`] — framed send/receive with the single-reply, aggregated,
//!   and relay receive paths.
//! - [`forward`] — tree fan-out with per-node success/failure results.
//! - [`controller`] — primary/backup failover, standby retry, reroute.
//!
//! Every exchange is one short-lived connection: open, one request, at
//! most one response (or an aggregated response set), close.

pub mod conn;
pub mod controller;
pub mod engine;
mod error;
pub mod forward;
pub mod resolver;

pub use controller::{
    open_controller_conn, send_only_controller_msg, send_recv_controller_msg,
    send_recv_controller_rc,
};
pub use engine::{
    recv_and_forward, recv_msg, recv_msgs, send_msg, send_recv_msg, send_recv_node_msgs,
};
pub use error::CommError;
pub use forward::set_span;
