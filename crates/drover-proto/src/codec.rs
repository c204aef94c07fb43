//! Frame assembly and disassembly.
//!
//! Write order: header (with a placeholder body length) → credential blob →
//! payload, then the real payload size is written back into the header at
//! its fixed offset. The 4-byte big-endian length prefix that precedes the
//! frame on the wire is applied by the transport when it writes the socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use drover_auth::{AuthPlugin, Credential, secret_for_flags};

use crate::error::ProtoError;
use crate::header::{BODY_LENGTH_OFFSET, Header};
use crate::message::Message;

/// Pack an outgoing message into one contiguous frame.
///
/// The caller supplies the freshly created credential so it can refresh it
/// when header preparation took too long.
pub fn pack_msg(
    msg: &Message,
    plugin: &dyn AuthPlugin,
    cred: &Credential,
) -> Result<Bytes, ProtoError> {
    let header = Header::new(msg, msg.flags);
    let mut buf = BytesMut::with_capacity(256);
    header.encode(&mut buf)?;
    plugin.pack(cred, &mut buf, header.version);
    let body_start = buf.len();
    let payload = msg.payload.encode()?;
    buf.put_slice(&payload);
    let body_len = (buf.len() - body_start) as u32;
    patch_body_length(&mut buf, body_len);
    Ok(buf.freeze())
}

/// Re-frame an already-received body (credential + payload) under a new
/// header, as done when relaying a message down the forwarding tree.
pub fn pack_with_body(header: &Header, body: &[u8]) -> Result<Bytes, ProtoError> {
    let mut buf = BytesMut::with_capacity(64 + body.len());
    header.encode(&mut buf)?;
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Rewrite the body length in an encoded frame, in place at offset 0's
/// header.
fn patch_body_length(buf: &mut BytesMut, len: u32) {
    buf[BODY_LENGTH_OFFSET..BODY_LENGTH_OFFSET + 4].copy_from_slice(&len.to_be_bytes());
}

/// Unpack the credential region.
pub fn unpack_cred(
    buf: &mut Bytes,
    plugin: &dyn AuthPlugin,
    version: u16,
) -> Result<Credential, ProtoError> {
    Ok(plugin.unpack(buf, version)?)
}

/// Best-effort sender uid from the credential region of a frame whose
/// version we reject, for diagnostics only.
///
/// The credential must still verify under the default secret; otherwise the
/// uid claim is worthless and `None` is returned.
pub fn peek_uid(buf: &Bytes, plugin: &dyn AuthPlugin, version: u16) -> Option<u32> {
    let mut probe = buf.clone();
    let cred = plugin.unpack(&mut probe, version).ok()?;
    plugin.verify(&cred, &secret_for_flags(0)).ok()?;
    Some(plugin.uid(&cred))
}

/// Bounds-check the payload region against the header's announced size.
pub fn check_body(buf: &Bytes, body_length: u32) -> Result<(), ProtoError> {
    if body_length as usize > buf.remaining() {
        return Err(ProtoError::IncompletePacket);
    }
    Ok(())
}
