//! Typed view of the envelope header.
//!
//! Field order on the wire: version, flags, message type, body length,
//! forwarding descriptor, return count, inline return list, origin address.
//! The body length sits at a fixed offset so the codec can rewrite it in
//! place after the payload has been packed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use drover_types::MsgType;

use crate::error::ProtoError;
use crate::message::{Message, RetEntry};
use crate::wire;
use crate::{PROTO_VERSION, PROTO_VERSION_MIN};

/// Byte offset of `body_length` within an encoded header.
pub const BODY_LENGTH_OFFSET: usize = 6;

/// Forwarding descriptor embedded in the header.
///
/// The `init` marker distinguishes a descriptor that was never set up from
/// an explicit "forward to zero nodes" value; senders that skip
/// initialization get forwarding disabled rather than garbage fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    /// Number of downstream nodes named in `hostlist`.
    pub cnt: u32,
    /// Nodes the receiver must forward to, first host per branch.
    pub hostlist: Vec<String>,
    /// Per-hop timeout in milliseconds; zero inherits the configured one.
    pub timeout_ms: u32,
    /// Fan-out width per hop; zero inherits the configured one.
    pub tree_width: u16,
    init: bool,
}

impl Default for ForwardInfo {
    fn default() -> Self {
        Self {
            cnt: 0,
            hostlist: Vec::new(),
            timeout_ms: 0,
            tree_width: 0,
            init: false,
        }
    }
}

impl ForwardInfo {
    /// An initialized descriptor meaning "no forwarding".
    pub fn reset() -> Self {
        Self {
            init: true,
            ..Self::default()
        }
    }

    /// A descriptor naming an explicit downstream host set.
    pub fn for_hosts(hostlist: Vec<String>, timeout_ms: u32, tree_width: u16) -> Self {
        Self {
            cnt: hostlist.len() as u32,
            hostlist,
            timeout_ms,
            tree_width,
            init: true,
        }
    }

    /// Whether the descriptor was explicitly initialized.
    pub fn initialized(&self) -> bool {
        self.init
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cnt);
        if self.cnt > 0 {
            wire::put_str(buf, &self.hostlist.join(","));
            buf.put_u32(self.timeout_ms);
            buf.put_u16(self.tree_width);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        if buf.remaining() < 4 {
            return Err(ProtoError::IncompletePacket);
        }
        let cnt = buf.get_u32();
        if cnt == 0 {
            return Ok(Self::reset());
        }
        let joined = wire::get_str(buf)?;
        if buf.remaining() < 6 {
            return Err(ProtoError::IncompletePacket);
        }
        let timeout_ms = buf.get_u32();
        let tree_width = buf.get_u16();
        let hostlist: Vec<String> = joined.split(',').map(str::to_string).collect();
        if hostlist.len() != cnt as usize {
            return Err(ProtoError::IncompletePacket);
        }
        Ok(Self {
            cnt,
            hostlist,
            timeout_ms,
            tree_width,
            init: true,
        })
    }
}

/// The envelope header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub msg_type: MsgType,
    /// Size of the payload region in bytes.
    pub body_length: u32,
    pub forward: ForwardInfo,
    /// Aggregated replies carried inline; empty on requests.
    pub ret_list: Vec<RetEntry>,
    /// Original source when the message traversed a forwarding tree.
    pub orig_addr: Option<std::net::SocketAddrV4>,
}

impl Header {
    /// Build a header for an outgoing message.
    pub fn new(msg: &Message, flags: u16) -> Self {
        Self {
            version: msg.protocol_version,
            flags,
            msg_type: msg.msg_type,
            body_length: 0,
            forward: msg.forward.clone(),
            ret_list: msg.ret_list.clone(),
            orig_addr: msg.orig_addr,
        }
    }

    /// Record the final payload size.
    pub fn update_body_length(&mut self, len: u32) {
        self.body_length = len;
    }

    /// Check the announced version against the supported window.
    pub fn check_version(&self) -> Result<(), ProtoError> {
        if (PROTO_VERSION_MIN..=PROTO_VERSION).contains(&self.version) {
            Ok(())
        } else {
            Err(ProtoError::VersionMismatch {
                version: self.version,
                uid: None,
            })
        }
    }

    /// Append the wire form of this header.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        buf.put_u16(self.version);
        buf.put_u16(self.flags);
        buf.put_u16(self.msg_type.0);
        buf.put_u32(self.body_length);
        self.forward.encode(buf);
        buf.put_u16(self.ret_list.len() as u16);
        for entry in &self.ret_list {
            entry.encode(buf)?;
        }
        wire::put_sockaddr(buf, self.orig_addr);
        Ok(())
    }

    /// Parse a header from the front of `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtoError> {
        if buf.remaining() < 10 {
            return Err(ProtoError::IncompletePacket);
        }
        let version = buf.get_u16();
        let flags = buf.get_u16();
        let msg_type = MsgType(buf.get_u16());
        let body_length = buf.get_u32();
        let forward = ForwardInfo::decode(buf)?;
        if buf.remaining() < 2 {
            return Err(ProtoError::IncompletePacket);
        }
        let ret_cnt = buf.get_u16();
        let mut ret_list = Vec::with_capacity(usize::from(ret_cnt));
        for _ in 0..ret_cnt {
            ret_list.push(RetEntry::decode(buf)?);
        }
        let orig_addr = wire::get_sockaddr(buf)?;
        Ok(Self {
            version,
            flags,
            msg_type,
            body_length,
            forward,
            ret_list,
            orig_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use drover_types::codes;

    use super::*;
    use crate::payload::{PayloadValue, ReturnCode};

    fn sample_header() -> Header {
        Header {
            version: PROTO_VERSION,
            flags: drover_types::flags::KEEP_BUFFER,
            msg_type: MsgType::ECHO,
            body_length: 11,
            forward: ForwardInfo::for_hosts(
                vec!["node-1".to_string(), "node-2".to_string()],
                4_000,
                3,
            ),
            ret_list: Vec::new(),
            orig_addr: Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 9), 6817)),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let mut wire = buf.freeze();
        let back = Header::decode(&mut wire).unwrap();
        assert_eq!(back, header);
        assert_eq!(wire.remaining(), 0);
    }

    #[test]
    fn test_header_roundtrip_with_ret_list() {
        let mut header = sample_header();
        header.forward = ForwardInfo::reset();
        header.ret_list = vec![
            RetEntry {
                node_name: "node-1".to_string(),
                msg_type: MsgType::RETURN_CODE,
                err: codes::SUCCESS,
                payload: Some(PayloadValue::ReturnCode(ReturnCode { code: 0 })),
            },
            RetEntry::failed("node-2", codes::COMM_CONNECTION_ERROR),
        ];
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let mut wire = buf.freeze();
        let back = Header::decode(&mut wire).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_body_length_offset() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let raw = &buf[BODY_LENGTH_OFFSET..BODY_LENGTH_OFFSET + 4];
        assert_eq!(u32::from_be_bytes(raw.try_into().unwrap()), 11);
    }

    #[test]
    fn test_check_version_window() {
        let mut header = sample_header();
        assert!(header.check_version().is_ok());
        header.version = PROTO_VERSION_MIN;
        assert!(header.check_version().is_ok());
        header.version = PROTO_VERSION + 1;
        assert!(matches!(
            header.check_version(),
            Err(ProtoError::VersionMismatch { .. })
        ));
        header.version = PROTO_VERSION_MIN - 1;
        assert!(header.check_version().is_err());
    }

    #[test]
    fn test_decode_truncated_everywhere() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let full = buf.freeze();
        for cut in 0..full.len() {
            let mut short = full.slice(..cut);
            assert!(
                Header::decode(&mut short).is_err(),
                "truncation at {cut} must fail"
            );
        }
    }

    #[test]
    fn test_uninitialized_descriptor_vs_reset() {
        assert!(!ForwardInfo::default().initialized());
        assert!(ForwardInfo::reset().initialized());
        assert_eq!(ForwardInfo::reset().cnt, 0);
    }
}
