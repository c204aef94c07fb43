//! Tree fan-out of one message to a named node set.
//!
//! A relaying node splits its hostlist into per-branch buckets with
//! [`set_span`], opens one connection per non-empty bucket, and re-frames
//! the original body under a reduced descriptor (the rest of the bucket
//! becomes the branch's own hostlist). Each branch is an independent task;
//! results flow back over a bounded channel that the reply path drains.
//! A branch that fails marks every node it was responsible for, so no node
//! ever drops out of the result set silently.

use bytes::Bytes;
use drover_proto::{ForwardInfo, ForwardPending, Header, RetEntry, codec};
use drover_types::codes;
use drover_types::config::config;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::CommError;
use crate::{conn, engine, resolver};

/// Distribute `total` nodes across at most `tree_width` branch buckets.
///
/// Buckets are filled left to right in passes of the full width; once the
/// remainder fits it is dumped on the current bucket, so the tree collapses
/// gracefully for small node sets and stays near-balanced for large ones.
/// Zero-sized buckets are unused branches. Bucket sizes always sum to
/// `total`.
pub fn set_span(total: u32, tree_width: u16) -> Vec<u32> {
    let width = if tree_width == 0 {
        config().tree_width
    } else {
        tree_width
    };
    let width = usize::from(width.max(1));
    let mut span = vec![0u32; width];
    let mut left = total;
    while left > 0 {
        let mut i = 0;
        while i < width && left > 0 {
            if (width - i) as u32 >= left || left <= width as u32 {
                span[i] += left;
                left = 0;
            } else {
                span[i] += width as u32;
                left -= width as u32;
            }
            i += 1;
        }
    }
    span
}

/// Receive budget for a subtree of `cnt` nodes at `tree_width` fan-out:
/// the number of levels to wait through and the total timeout, widened by
/// one message timeout per level.
pub(crate) fn fanout_budget(cnt: u32, tree_width: u16, hop_timeout_ms: u64) -> (u64, u64) {
    let width = if tree_width == 0 {
        config().tree_width
    } else {
        tree_width
    };
    let width = u64::from(width.max(1));
    let mut steps = (u64::from(cnt) + 1) / width;
    let mut total = config().msg_timeout_ms() * steps;
    steps += 1;
    total += hop_timeout_ms * steps;
    (steps, total)
}

/// Launch the fan-out for a received message.
///
/// `body` is the raw credential+payload region exactly as received; each
/// branch relays it untouched under its reduced header.
pub(crate) async fn start_forward(header: &Header, body: Bytes) -> ForwardPending {
    let fwd = &header.forward;
    let hop_timeout_ms = u64::from(fwd.timeout_ms).max(config().msg_timeout_ms());
    let span = set_span(fwd.cnt, fwd.tree_width);

    // Carve the hostlist into the non-empty buckets.
    let mut buckets: Vec<Vec<String>> = Vec::new();
    let mut at = 0usize;
    for &size in &span {
        let size = size as usize;
        if size == 0 || at >= fwd.hostlist.len() {
            continue;
        }
        let end = (at + size).min(fwd.hostlist.len());
        buckets.push(fwd.hostlist[at..end].to_vec());
        at = end;
    }

    let (tx, rx) = mpsc::channel(buckets.len().max(1));
    for (branch, bucket) in buckets.iter().enumerate() {
        let mut branch_header = header.clone();
        branch_header.ret_list.clear();
        let rest = bucket[1..].to_vec();
        branch_header.forward = if rest.is_empty() {
            ForwardInfo::reset()
        } else {
            ForwardInfo::for_hosts(
                rest,
                hop_timeout_ms.min(u64::from(u32::MAX)) as u32,
                fwd.tree_width,
            )
        };
        tokio::spawn(branch_task(
            branch,
            bucket.clone(),
            branch_header,
            body.clone(),
            hop_timeout_ms,
            tx.clone(),
        ));
    }

    // Outer drain budget: the deepest branch's budget plus one message
    // timeout of slack for the local scheduling.
    let (_, deepest_ms) = fanout_budget(fwd.cnt, fwd.tree_width, hop_timeout_ms);
    ForwardPending {
        rx,
        buckets,
        budget: Duration::from_millis(deepest_ms + config().msg_timeout_ms()),
    }
}

/// Drain an in-flight fan-out into per-node entries.
///
/// Branches that never report within the budget are marked failed node by
/// node; the result covers every node named in the original hostlist.
pub(crate) async fn collect_pending(mut pending: ForwardPending) -> Vec<RetEntry> {
    let deadline = Instant::now() + pending.budget;
    let mut reported = vec![false; pending.buckets.len()];
    let mut out = Vec::new();
    let mut seen = 0;
    while seen < pending.buckets.len() {
        match timeout_at(deadline, pending.rx.recv()).await {
            Ok(Some((branch, entries))) => {
                if let Some(flag) = reported.get_mut(branch) {
                    *flag = true;
                }
                out.extend(entries);
                seen += 1;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("fan-out collection timed out with branches outstanding");
                break;
            }
        }
    }
    for (branch, done) in reported.iter().enumerate() {
        if !*done {
            for node in &pending.buckets[branch] {
                out.push(RetEntry::failed(node, codes::COMM_RECEIVE_ERROR));
            }
        }
    }
    out
}

/// Relay to one branch head and gather its subtree's replies.
async fn branch_task(
    branch: usize,
    bucket: Vec<String>,
    header: Header,
    body: Bytes,
    hop_timeout_ms: u64,
    tx: mpsc::Sender<(usize, Vec<RetEntry>)>,
) {
    let head = bucket[0].clone();
    let entries = match forward_one(&head, &header, &body, hop_timeout_ms).await {
        Ok(mut entries) => {
            for entry in &mut entries {
                if entry.node_name.is_empty() {
                    entry.node_name = head.clone();
                }
            }
            entries
        }
        Err(e) => {
            warn!(node = %head, error = %e, "branch forward failed");
            bucket
                .iter()
                .map(|node| RetEntry::failed(node, e.code()))
                .collect()
        }
    };
    if tx.send((branch, entries)).await.is_err() {
        debug!(node = %head, "fan-out collector went away before branch finished");
    }
}

async fn forward_one(
    head: &str,
    header: &Header,
    body: &Bytes,
    hop_timeout_ms: u64,
) -> Result<Vec<RetEntry>, CommError> {
    let addr = resolver::resolve_host(head, config().agent_port).await?;
    let mut stream = conn::open_conn_retry(addr).await?;
    let frame = codec::pack_with_body(header, body)?;
    engine::send_frame(&mut stream, &frame).await?;
    let (steps, total_ms) = fanout_budget(header.forward.cnt, header.forward.tree_width, hop_timeout_ms);
    engine::recv_msgs(&mut stream, steps, total_ms).await
}
