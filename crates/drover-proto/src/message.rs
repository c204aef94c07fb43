//! The logical exchange unit and per-node fan-out results.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use drover_auth::Credential;
use drover_types::{MsgType, flags};
use tokio::sync::mpsc;

use crate::PROTO_VERSION;
use crate::error::ProtoError;
use crate::header::ForwardInfo;
use crate::payload::{self, PayloadValue};
use crate::wire;

/// A message at the transport boundary.
///
/// Created by the sender, mutated only by the sending/receiving path during
/// its single exchange, and dropped (with payload, credential, buffer, and
/// return list) when the exchange ends.
#[derive(Debug)]
pub struct Message {
    /// Negotiated protocol version.
    pub protocol_version: u16,
    /// Payload schema tag.
    pub msg_type: MsgType,
    /// Envelope flag bits ([`flags`]).
    pub flags: u16,
    /// Authenticator plugin index for credential creation.
    pub auth_index: u32,
    /// Peer endpoint for this exchange.
    pub address: Option<SocketAddr>,
    /// Original source when the message traversed a forwarding tree.
    pub orig_addr: Option<SocketAddrV4>,
    /// Forwarding descriptor; uninitialized means "decide at send time".
    pub forward: ForwardInfo,
    /// Accumulated per-node responses (fan-out senders and receivers).
    pub ret_list: Vec<RetEntry>,
    /// Credential the message arrived with.
    pub auth: Option<Credential>,
    /// Decoded or opaque body.
    pub payload: PayloadValue,
    /// Raw received frame, retained when [`flags::KEEP_BUFFER`] is set.
    pub buffer: Option<Bytes>,
    /// In-flight fan-out whose results the response must absorb.
    pub pending: Option<ForwardPending>,
}

impl Message {
    /// A fresh outgoing message.
    pub fn new(msg_type: MsgType, payload: PayloadValue) -> Self {
        Self {
            protocol_version: PROTO_VERSION,
            msg_type,
            flags: 0,
            auth_index: 0,
            address: None,
            orig_addr: None,
            forward: ForwardInfo::default(),
            ret_list: Vec::new(),
            auth: None,
            payload,
            buffer: None,
            pending: None,
        }
    }

    /// A return-code reply.
    pub fn rc(code: u32) -> Self {
        Self::new(
            MsgType::RETURN_CODE,
            PayloadValue::ReturnCode(payload::ReturnCode { code }),
        )
    }

    /// Whether the caller asked to retain the raw frame.
    pub fn keep_buffer(&self) -> bool {
        self.flags & flags::KEEP_BUFFER != 0
    }
}

/// One per-node result from a fan-out exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RetEntry {
    /// Name of the node the entry describes.
    pub node_name: String,
    /// Tag of the node's reply, or [`MsgType::FORWARD_FAILED`].
    pub msg_type: MsgType,
    /// Error code for failure entries, zero otherwise.
    pub err: u32,
    /// Decoded reply body; absent on failure entries.
    pub payload: Option<PayloadValue>,
}

impl RetEntry {
    /// A failure marker for an unreachable or unresponsive node.
    pub fn failed(node_name: impl Into<String>, err: u32) -> Self {
        Self {
            node_name: node_name.into(),
            msg_type: MsgType::FORWARD_FAILED,
            err,
            payload: None,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        wire::put_str(buf, &self.node_name);
        buf.put_u16(self.msg_type.0);
        buf.put_u32(self.err);
        let body = match &self.payload {
            Some(value) => value.encode()?,
            None => Bytes::new(),
        };
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        let node_name = wire::get_str(buf)?;
        if buf.remaining() < 10 {
            return Err(ProtoError::IncompletePacket);
        }
        let msg_type = MsgType(buf.get_u16());
        let err = buf.get_u32();
        let len = buf.get_u32() as usize;
        if len > buf.remaining() {
            return Err(ProtoError::IncompletePacket);
        }
        let body = buf.split_to(len);
        let payload = if msg_type == MsgType::FORWARD_FAILED {
            None
        } else {
            Some(payload::decode_payload(msg_type, &body)?)
        };
        Ok(Self {
            node_name,
            msg_type,
            err,
            payload,
        })
    }
}

/// Handle to an in-flight fan-out.
///
/// Each branch task reports `(branch index, entries)` once; branches that
/// never report within the budget are marked failed node by node.
#[derive(Debug)]
pub struct ForwardPending {
    /// Per-branch results, one send per branch task.
    pub rx: mpsc::Receiver<(usize, Vec<RetEntry>)>,
    /// Node names per branch, used to synthesize failure entries.
    pub buckets: Vec<Vec<String>>,
    /// How long to wait for all branches.
    pub budget: Duration,
}

#[cfg(test)]
mod tests {
    use drover_types::codes;

    use super::*;
    use crate::payload::ReturnCode;

    #[test]
    fn test_ret_entry_roundtrip() {
        let entry = RetEntry {
            node_name: "node-9".to_string(),
            msg_type: MsgType::RETURN_CODE,
            err: 0,
            payload: Some(PayloadValue::ReturnCode(ReturnCode { code: 3 })),
        };
        let mut buf = BytesMut::new();
        entry.encode(&mut buf).unwrap();
        let mut wire = buf.freeze();
        assert_eq!(RetEntry::decode(&mut wire).unwrap(), entry);
        assert_eq!(wire.remaining(), 0);
    }

    #[test]
    fn test_failed_entry_has_no_payload() {
        let entry = RetEntry::failed("node-4", codes::COMM_CONNECTION_ERROR);
        let mut buf = BytesMut::new();
        entry.encode(&mut buf).unwrap();
        let mut wire = buf.freeze();
        let back = RetEntry::decode(&mut wire).unwrap();
        assert_eq!(back.msg_type, MsgType::FORWARD_FAILED);
        assert_eq!(back.err, codes::COMM_CONNECTION_ERROR);
        assert!(back.payload.is_none());
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = Message::new(MsgType::PING, PayloadValue::empty());
        assert_eq!(msg.protocol_version, PROTO_VERSION);
        assert!(!msg.forward.initialized());
        assert!(msg.ret_list.is_empty());
        assert!(!msg.keep_buffer());
    }
}
