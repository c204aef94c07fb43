//! Payload values and the tag-dispatched codec registry.
//!
//! The transport never interprets payload bytes itself: the header's
//! message type selects a codec, and unknown tags fall through to
//! [`PayloadValue::Raw`] so opaque bodies survive a relay hop untouched.
//! Built-in payloads are postcard-encoded, except the node registration,
//! which uses the fixed sockaddr-array wire form.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use bytes::{Bytes, BytesMut};
use drover_types::{ClusterRec, MsgType};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::wire;

/// A decoded (or opaque) message body.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    /// Generic return code ([`MsgType::RETURN_CODE`]).
    ReturnCode(ReturnCode),
    /// Cross-cluster redirection ([`MsgType::REROUTE`]).
    Reroute(Reroute),
    /// Liveness probe ([`MsgType::PING`]).
    Ping(Ping),
    /// Probe reply ([`MsgType::PONG`]).
    Pong(Pong),
    /// Echo request ([`MsgType::ECHO`]).
    Echo(Echo),
    /// Echo reply ([`MsgType::ECHO_REPLY`]).
    EchoReply(EchoReply),
    /// Agent address announcement ([`MsgType::REGISTER_NODE`]).
    Registration(NodeRegistration),
    /// Opaque body for tags without a registered codec.
    Raw(Bytes),
}

impl PayloadValue {
    /// An empty opaque body.
    pub fn empty() -> Self {
        PayloadValue::Raw(Bytes::new())
    }

    /// Serialize this value to its wire form.
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        fn pc<T: Serialize>(v: &T) -> Result<Bytes, ProtoError> {
            postcard::to_allocvec(v)
                .map(Bytes::from)
                .map_err(|e| ProtoError::Encode(e.to_string()))
        }
        match self {
            PayloadValue::ReturnCode(v) => pc(v),
            PayloadValue::Reroute(v) => pc(v),
            PayloadValue::Ping(v) => pc(v),
            PayloadValue::Pong(v) => pc(v),
            PayloadValue::Echo(v) => pc(v),
            PayloadValue::EchoReply(v) => pc(v),
            PayloadValue::Registration(v) => {
                let mut buf = BytesMut::new();
                wire::put_str(&mut buf, &v.node_name);
                wire::put_addr_array(&mut buf, &v.addrs);
                Ok(buf.freeze())
            }
            PayloadValue::Raw(b) => Ok(b.clone()),
        }
    }
}

/// Return-code reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnCode {
    /// One of [`drover_types::codes`], or an application code.
    pub code: u32,
}

/// Reroute instruction body: resend to this cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reroute {
    /// The cluster now responsible for the request.
    pub cluster: ClusterRec,
}

/// Liveness probe body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Sender clock, millis since the epoch.
    pub timestamp_ms: u64,
}

/// Probe reply body, echoing the probe clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Timestamp from the originating ping.
    pub timestamp_ms: u64,
}

/// Echo request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    /// Bytes to echo back.
    pub data: Vec<u8>,
}

/// Echo reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    /// Bytes the responder answered with.
    pub data: Vec<u8>,
}

/// Agent address announcement body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    /// The agent's node name.
    pub node_name: String,
    /// Listen addresses, fixed-size sockaddr records on the wire.
    pub addrs: Vec<std::net::SocketAddrV4>,
}

// ---------------------------------------------------------------------------
// Codec registry
// ---------------------------------------------------------------------------

/// A registered payload decoder.
pub type DecodeFn = fn(&[u8]) -> Result<PayloadValue, ProtoError>;

fn pc_decode<T>(wrap: fn(T) -> PayloadValue) -> impl Fn(&[u8]) -> Result<PayloadValue, ProtoError>
where
    T: for<'de> Deserialize<'de>,
{
    move |bytes| {
        postcard::from_bytes::<T>(bytes)
            .map(wrap)
            .map_err(|_| ProtoError::IncompletePacket)
    }
}

fn decode_return_code(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    pc_decode(PayloadValue::ReturnCode)(bytes)
}

fn decode_reroute(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    pc_decode(PayloadValue::Reroute)(bytes)
}

fn decode_ping(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    pc_decode(PayloadValue::Ping)(bytes)
}

fn decode_pong(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    pc_decode(PayloadValue::Pong)(bytes)
}

fn decode_echo(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    pc_decode(PayloadValue::Echo)(bytes)
}

fn decode_echo_reply(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    pc_decode(PayloadValue::EchoReply)(bytes)
}

fn decode_registration(bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let node_name = wire::get_str(&mut buf)?;
    let addrs = wire::get_addr_array(&mut buf)?;
    Ok(PayloadValue::Registration(NodeRegistration {
        node_name,
        addrs,
    }))
}

static REGISTRY: LazyLock<RwLock<HashMap<u16, DecodeFn>>> = LazyLock::new(|| {
    let mut map: HashMap<u16, DecodeFn> = HashMap::new();
    map.insert(MsgType::RETURN_CODE.0, decode_return_code);
    map.insert(MsgType::REROUTE.0, decode_reroute);
    map.insert(MsgType::PING.0, decode_ping);
    map.insert(MsgType::PONG.0, decode_pong);
    map.insert(MsgType::ECHO.0, decode_echo);
    map.insert(MsgType::ECHO_REPLY.0, decode_echo_reply);
    map.insert(MsgType::REGISTER_NODE.0, decode_registration);
    RwLock::new(map)
});

/// Register (or replace) the decoder for a message tag.
pub fn register_codec(tag: MsgType, decode: DecodeFn) {
    REGISTRY
        .write()
        .expect("codec registry lock poisoned")
        .insert(tag.0, decode);
}

/// Decode a payload body through the registered codec for `tag`.
///
/// Tags with no codec come back as [`PayloadValue::Raw`].
pub fn decode_payload(tag: MsgType, bytes: &[u8]) -> Result<PayloadValue, ProtoError> {
    let decode = REGISTRY
        .read()
        .expect("codec registry lock poisoned")
        .get(&tag.0)
        .copied();
    match decode {
        Some(f) => f(bytes),
        None => Ok(PayloadValue::Raw(Bytes::copy_from_slice(bytes))),
    }
}
