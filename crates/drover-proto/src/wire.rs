//! Low-level wire primitives.
//!
//! All multi-byte integers on the wire are big-endian. Strings are
//! length-prefixed UTF-8 without a terminator. Socket addresses use a fixed
//! 8-byte IPv4 record so the header stays rewritable in place.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use drover_types::NO_VAL;

use crate::error::ProtoError;

/// Upper bound for a single length-prefixed string.
const MAX_STR_LEN: usize = 16 * 1024 * 1024;

/// Address family tag for an IPv4 record; zero means "no address".
const AF_INET: u16 = 2;

/// Append a length-prefixed string.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Read a length-prefixed string, bounds-checked against the buffer.
pub fn get_str(buf: &mut Bytes) -> Result<String, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::IncompletePacket);
    }
    let len = buf.get_u32() as usize;
    if len > MAX_STR_LEN || len > buf.remaining() {
        return Err(ProtoError::IncompletePacket);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProtoError::Receive(format!("invalid utf-8 string: {e}")))
}

/// Append an 8-byte IPv4 sockaddr record (family, port, address).
///
/// `None` writes an all-zero record, meaning "local / unset".
pub fn put_sockaddr(buf: &mut BytesMut, addr: Option<SocketAddrV4>) {
    match addr {
        Some(a) => {
            buf.put_u16(AF_INET);
            buf.put_u16(a.port());
            buf.put_u32(a.ip().to_bits());
        }
        None => {
            buf.put_u16(0);
            buf.put_u16(0);
            buf.put_u32(0);
        }
    }
}

/// Read an 8-byte IPv4 sockaddr record.
pub fn get_sockaddr(buf: &mut Bytes) -> Result<Option<SocketAddrV4>, ProtoError> {
    if buf.remaining() < 8 {
        return Err(ProtoError::IncompletePacket);
    }
    let family = buf.get_u16();
    let port = buf.get_u16();
    let ip = buf.get_u32();
    match family {
        0 => Ok(None),
        AF_INET => Ok(Some(SocketAddrV4::new(Ipv4Addr::from_bits(ip), port))),
        other => Err(ProtoError::Receive(format!(
            "unsupported address family {other}"
        ))),
    }
}

/// Append an address array: `u32` count followed by fixed-size records.
pub fn put_addr_array(buf: &mut BytesMut, addrs: &[SocketAddrV4]) {
    buf.put_u32(addrs.len() as u32);
    for a in addrs {
        put_sockaddr(buf, Some(*a));
    }
}

/// Read an address array, rejecting counts above [`NO_VAL`] or past the
/// end of the buffer.
pub fn get_addr_array(buf: &mut Bytes) -> Result<Vec<SocketAddrV4>, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::IncompletePacket);
    }
    let count = buf.get_u32();
    if count > NO_VAL || (count as usize).saturating_mul(8) > buf.remaining() {
        return Err(ProtoError::IncompletePacket);
    }
    let mut addrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match get_sockaddr(buf)? {
            Some(a) => addrs.push(a),
            None => {
                return Err(ProtoError::Receive(
                    "zero record inside address array".to_string(),
                ));
            }
        }
    }
    Ok(addrs)
}
