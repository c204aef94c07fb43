//! High-level send and receive over one connection.
//!
//! Three receive paths share the frame reader and differ in what they
//! tolerate:
//!
//! - [`recv_msg`] — single reply; rejects aggregated return lists and
//!   forwarding requests outright.
//! - [`recv_msgs`] — aggregated replies from a fan-out subtree; always
//!   produces a list, appending the peer's own reply last.
//! - [`recv_and_forward`] — node-agent path; relays the raw body down the
//!   tree before the local payload is even decoded.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use drover_auth::{default_plugin, secret_for_flags};
use drover_proto::{
    ForwardInfo, Header, MAX_FRAME_SIZE, Message, ProtoError, RetEntry, codec, decode_payload,
};
use drover_types::config::config;
use drover_types::{MsgType, codes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, warn};

use crate::error::CommError;
use crate::{conn, forward};

/// Delay inserted before returning a decode or authentication failure, to
/// discourage brute-force probing.
const DECODE_FAILURE_DELAY: Duration = Duration::from_millis(10);

/// Credential lifetime slack: recreate when header preparation stalled
/// this long waiting on fan-out results.
const CRED_REFRESH_AFTER: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

/// Serialize and send one message over an open connection.
///
/// Returns the number of bytes written. When the message carries an
/// in-flight fan-out, its per-node results are drained into the return list
/// first, so aggregated responses leave with their children's replies
/// inline.
pub async fn send_msg(stream: &mut TcpStream, msg: &mut Message) -> Result<usize, CommError> {
    let plugin = default_plugin();
    let started = Instant::now();
    let secret = secret_for_flags(msg.flags);
    let mut cred = plugin
        .create(msg.auth_index, &secret)
        .map_err(|e| CommError::Proto(e.into()))?;

    // A sender that never touched the descriptor gets forwarding disabled.
    if !msg.forward.initialized() {
        msg.forward = ForwardInfo::reset();
        msg.ret_list.clear();
    }
    if msg.forward.tree_width == 0 {
        msg.forward.tree_width = config().tree_width;
    }

    if let Some(pending) = msg.pending.take() {
        let entries = forward::collect_pending(pending).await;
        msg.ret_list.extend(entries);
    }

    // The fan-out wait above can outlive a credential TTL.
    if started.elapsed() >= CRED_REFRESH_AFTER {
        cred = plugin
            .create(msg.auth_index, &secret)
            .map_err(|e| CommError::Proto(e.into()))?;
    }

    let frame = codec::pack_msg(msg, plugin, &cred)?;
    match write_frame(stream, &frame).await {
        Ok(()) => Ok(frame.len()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
            debug!(msg_type = %msg.msg_type, "peer has disappeared");
            Err(CommError::Send(e.to_string()))
        }
        Err(e) => {
            match conn::peer_addr(stream) {
                Some(peer) => {
                    error!(%peer, msg_type = %msg.msg_type, error = %e, "send failed")
                }
                None => error!(msg_type = %msg.msg_type, error = %e, "send failed"),
            }
            Err(CommError::Send(e.to_string()))
        }
    }
}

/// Send an already-packed frame (tree relaying).
pub(crate) async fn send_frame(stream: &mut TcpStream, frame: &Bytes) -> Result<(), CommError> {
    write_frame(stream, frame)
        .await
        .map_err(|e| CommError::Send(e.to_string()))
}

async fn write_frame(stream: &mut TcpStream, frame: &Bytes) -> io::Result<()> {
    let budget = Duration::from_millis(config().msg_timeout_ms());
    timeout(budget, async {
        stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        stream.write_all(frame).await?;
        stream.flush().await
    })
    .await
    .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()))
}

// ---------------------------------------------------------------------------
// Frame reading
// ---------------------------------------------------------------------------

/// Read one length-prefixed frame within `budget`.
async fn read_frame(stream: &mut TcpStream, budget: Duration) -> Result<Bytes, CommError> {
    timeout(budget, async {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| CommError::Receive(format!("read length prefix: {e}")))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CommError::Receive(format!(
                "frame of {len} bytes exceeds limit"
            )));
        }
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| CommError::Receive(format!("read frame body: {e}")))?;
        Ok(Bytes::from(buf))
    })
    .await
    .unwrap_or_else(|_| Err(CommError::Receive("receive timed out".to_string())))
}

/// Apply the default receive timeout and log out-of-band values.
fn normalize_recv_timeout(timeout_ms: u64) -> Duration {
    let msg_timeout = config().msg_timeout_ms();
    if timeout_ms == 0 {
        return Duration::from_millis(msg_timeout);
    }
    if timeout_ms > msg_timeout * 10 {
        warn!(
            timeout_s = timeout_ms / 1000,
            "receiving a message with a very long timeout"
        );
    } else if timeout_ms < 1000 {
        warn!(timeout_ms, "receiving a message with a very short timeout");
    }
    Duration::from_millis(timeout_ms)
}

// ---------------------------------------------------------------------------
// Receive: single reply
// ---------------------------------------------------------------------------

/// Receive exactly one framed message.
///
/// `timeout_ms == 0` uses the configured message timeout.
pub async fn recv_msg(stream: &mut TcpStream, timeout_ms: u64) -> Result<Message, CommError> {
    let budget = normalize_recv_timeout(timeout_ms);
    let frame = read_frame(stream, budget).await?;
    let peer = conn::peer_addr(stream);
    match decode_single(&frame, peer) {
        Ok(msg) => Ok(msg),
        Err(e) => {
            sleep(DECODE_FAILURE_DELAY).await;
            Err(e)
        }
    }
}

fn decode_single(frame: &Bytes, peer: Option<SocketAddr>) -> Result<Message, CommError> {
    let plugin = default_plugin();
    let mut buf = frame.clone();
    let header = Header::decode(&mut buf)
        .map_err(|e| CommError::Proto(ProtoError::Receive(format!("header parse failed: {e}"))))?;

    if let Err(ProtoError::VersionMismatch { version, .. }) = header.check_version() {
        let uid = codec::peek_uid(&buf, plugin, header.version);
        log_version_mismatch(version, uid, peer);
        return Err(ProtoError::VersionMismatch { version, uid }.into());
    }

    if !header.ret_list.is_empty() {
        error!("aggregated reply received on the single-reply path");
        return Err(ProtoError::IncompletePacket.into());
    }
    if header.forward.cnt > 0 {
        error!(
            cnt = header.forward.cnt,
            "forwarding request received on a response-only path"
        );
        return Err(ProtoError::IncompletePacket.into());
    }

    finish_decode(header, buf, frame, peer)
}

/// Shared tail of the receive paths: credential, bounds check, payload.
fn finish_decode(
    header: Header,
    mut buf: Bytes,
    frame: &Bytes,
    peer: Option<SocketAddr>,
) -> Result<Message, CommError> {
    let plugin = default_plugin();
    let cred = match codec::unpack_cred(&mut buf, plugin, header.version) {
        Ok(cred) => cred,
        Err(e) => {
            error!(msg_type = %header.msg_type, error = %e, "credential unpack failed");
            return Err(ProtoError::IncompletePacket.into());
        }
    };
    let auth_index = plugin.index_of(&cred);
    if let Err(e) = plugin.verify(&cred, &secret_for_flags(header.flags)) {
        error!(msg_type = %header.msg_type, error = %e, "credential verify failed");
        return Err(ProtoError::Auth(e).into());
    }

    codec::check_body(&buf, header.body_length)?;
    let payload = decode_payload(header.msg_type, &buf[..header.body_length as usize])?;

    let mut msg = Message::new(header.msg_type, payload);
    msg.protocol_version = header.version;
    msg.flags = header.flags;
    msg.auth_index = auth_index;
    msg.auth = Some(cred);
    msg.address = peer;
    msg.orig_addr = header.orig_addr;
    msg.forward = ForwardInfo::reset();
    if msg.keep_buffer() {
        msg.buffer = Some(frame.clone());
    }
    Ok(msg)
}

fn log_version_mismatch(version: u16, uid: Option<u32>, peer: Option<SocketAddr>) {
    let uid = uid.map(i64::from).unwrap_or(-1);
    match peer {
        Some(peer) => error!(
            version = %format_args!("0x{version:04x}"),
            uid,
            %peer,
            "invalid protocol version"
        ),
        None => error!(
            version = %format_args!("0x{version:04x}"),
            uid,
            "invalid protocol version from problem connection"
        ),
    }
}

// ---------------------------------------------------------------------------
// Receive: aggregated replies
// ---------------------------------------------------------------------------

/// Receive an aggregated reply set from a fan-out subtree.
///
/// `steps` is the number of tree levels below the peer; the per-level
/// budget is derived from the total. Always returns at least one entry on
/// success (the peer's own reply, node name left empty for the caller to
/// fill). A failure after the inline return list was captured is reported
/// as a trailing failure entry rather than by discarding the replies.
pub async fn recv_msgs(
    stream: &mut TcpStream,
    steps: u64,
    timeout_ms: u64,
) -> Result<Vec<RetEntry>, CommError> {
    let cfg = config();
    let total_ms = if timeout_ms == 0 {
        cfg.msg_timeout_ms()
    } else {
        timeout_ms
    };
    let mut per_level_ms = total_ms;
    if steps > 0 {
        per_level_ms = total_ms.saturating_sub(cfg.msg_timeout_ms() * (steps - 1)) / steps;
    }
    debug!(total_ms, steps, per_level_ms, "aggregated receive budget");
    if per_level_ms >= cfg.msg_timeout_ms() * 10 {
        warn!(per_level_ms, "very long per-level timeout");
    } else if per_level_ms < 1000 {
        warn!(
            total_ms,
            per_level_ms, "very short per-level timeout for aggregated receive"
        );
    }

    let frame = read_frame(stream, Duration::from_millis(total_ms)).await?;
    let peer = conn::peer_addr(stream);
    let (mut entries, own) = decode_aggregated(&frame, peer);
    match own {
        Ok(msg) => {
            entries.push(RetEntry {
                node_name: String::new(),
                msg_type: msg.msg_type,
                err: codes::SUCCESS,
                payload: Some(msg.payload),
            });
            Ok(entries)
        }
        Err(e) => {
            error!(error = %e, "aggregated receive failed");
            sleep(DECODE_FAILURE_DELAY).await;
            if entries.is_empty() {
                Err(e)
            } else {
                entries.push(RetEntry::failed("", e.code()));
                Ok(entries)
            }
        }
    }
}

fn decode_aggregated(
    frame: &Bytes,
    peer: Option<SocketAddr>,
) -> (Vec<RetEntry>, Result<Message, CommError>) {
    let plugin = default_plugin();
    let mut buf = frame.clone();
    let header = match Header::decode(&mut buf) {
        Ok(h) => h,
        Err(e) => {
            return (
                Vec::new(),
                Err(CommError::Proto(ProtoError::Receive(format!(
                    "header parse failed: {e}"
                )))),
            );
        }
    };

    if let Err(ProtoError::VersionMismatch { version, .. }) = header.check_version() {
        let uid = codec::peek_uid(&buf, plugin, header.version);
        log_version_mismatch(version, uid, peer);
        return (
            Vec::new(),
            Err(ProtoError::VersionMismatch { version, uid }.into()),
        );
    }

    // Inline replies from the subtree, captured before anything can fail.
    let entries = header.ret_list.clone();

    if header.forward.cnt > 0 {
        error!(
            cnt = header.forward.cnt,
            "forwarding request received on a response-only path"
        );
        return (entries, Err(ProtoError::IncompletePacket.into()));
    }

    let own = finish_decode(header, buf, frame, peer);
    (entries, own)
}

// ---------------------------------------------------------------------------
// Receive: node-agent path
// ---------------------------------------------------------------------------

/// Receive a message on a node agent, relaying it down the forwarding tree
/// when the header names downstream nodes.
///
/// The returned message carries a pending-collection handle; sending the
/// reply with [`send_msg`] absorbs every child's response (or failure
/// marker) into the reply's return list.
pub async fn recv_and_forward(
    stream: &mut TcpStream,
    timeout_ms: u64,
) -> Result<Message, CommError> {
    let budget = normalize_recv_timeout(timeout_ms);
    let frame = read_frame(stream, budget).await?;
    let peer = conn::peer_addr(stream);
    match decode_and_forward(stream, &frame, peer).await {
        Ok(msg) => Ok(msg),
        Err(e) => {
            sleep(DECODE_FAILURE_DELAY).await;
            Err(e)
        }
    }
}

async fn decode_and_forward(
    stream: &mut TcpStream,
    frame: &Bytes,
    peer: Option<SocketAddr>,
) -> Result<Message, CommError> {
    let plugin = default_plugin();
    let mut buf = frame.clone();
    let mut header = Header::decode(&mut buf)
        .map_err(|e| CommError::Proto(ProtoError::Receive(format!("header parse failed: {e}"))))?;

    if let Err(ProtoError::VersionMismatch { version, .. }) = header.check_version() {
        let uid = codec::peek_uid(&buf, plugin, header.version);
        log_version_mismatch(version, uid, peer);
        return Err(ProtoError::VersionMismatch { version, uid }.into());
    }

    if !header.ret_list.is_empty() {
        error!("aggregated reply received on the request path");
        return Err(ProtoError::IncompletePacket.into());
    }

    // Track where the message entered the tree: either carried in the
    // header from an upstream relay, or this hop is the origin.
    let local_v4 = peer.and_then(|a| match a {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    });
    let origin: Option<SocketAddrV4> = header.orig_addr.or(local_v4);
    header.orig_addr = origin;

    let pending = if header.forward.cnt > 0 {
        debug!(
            cnt = header.forward.cnt,
            timeout_ms = header.forward.timeout_ms,
            "forwarding to downstream nodes"
        );
        Some(forward::start_forward(&header, buf.clone()).await)
    } else {
        None
    };

    let mut msg = finish_decode(header, buf, frame, peer)?;
    msg.orig_addr = origin;
    msg.pending = pending;

    // The composite aggregator is acked for transport before its content
    // is handled, so upstream stops waiting on this hop.
    if msg.msg_type == MsgType::COMPOSITE {
        let mut ack = Message::rc(codes::SUCCESS);
        send_msg(stream, &mut ack).await?;
    }

    Ok(msg)
}

// ---------------------------------------------------------------------------
// Convenience wrappers
// ---------------------------------------------------------------------------

/// One request/response exchange with a single node.
pub async fn send_recv_msg(
    addr: SocketAddr,
    msg: &mut Message,
    timeout_ms: u64,
) -> Result<Message, CommError> {
    msg.address = Some(addr);
    let mut stream = conn::open_conn(addr).await?;
    send_msg(&mut stream, msg).await?;
    recv_msg(&mut stream, timeout_ms).await
}

/// Send to a node (fanning out through its forwarding descriptor) and
/// collect one entry per named node.
///
/// Failures never vanish: an unreachable peer produces a failure entry
/// under `name`, and subtree failures arrive as failure entries from the
/// tree itself.
pub async fn send_recv_node_msgs(msg: &mut Message, name: &str, timeout_ms: u64) -> Vec<RetEntry> {
    let Some(addr) = msg.address else {
        warn!(node = name, "fan-out send without a resolved address");
        return vec![RetEntry::failed(name, codes::COMM_CONNECTION_ERROR)];
    };

    let mut stream = match conn::open_conn_retry(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(node = name, %addr, error = %e, "fan-out connect failed");
            return vec![RetEntry::failed(name, codes::COMM_CONNECTION_ERROR)];
        }
    };

    if msg.forward.initialized() && msg.forward.timeout_ms == 0 {
        let fallback = if timeout_ms == 0 {
            config().msg_timeout_ms()
        } else {
            timeout_ms
        };
        msg.forward.timeout_ms = fallback.min(u64::from(u32::MAX)) as u32;
    }

    if let Err(e) = send_msg(&mut stream, msg).await {
        warn!(node = name, error = %e, "fan-out send failed");
        return vec![RetEntry::failed(name, e.code())];
    }

    let (steps, total_ms) = if msg.forward.cnt > 0 {
        forward::fanout_budget(
            msg.forward.cnt,
            msg.forward.tree_width,
            u64::from(msg.forward.timeout_ms),
        )
    } else {
        (0, timeout_ms)
    };

    match recv_msgs(&mut stream, steps, total_ms).await {
        Ok(mut entries) => {
            for entry in &mut entries {
                if entry.node_name.is_empty() {
                    entry.node_name = name.to_string();
                }
            }
            entries
        }
        Err(e) => {
            warn!(node = name, error = %e, "fan-out receive failed");
            vec![RetEntry::failed(name, e.code())]
        }
    }
}
