//! Request/response exchanges with the active controller.
//!
//! The controller set is an ordered list of replicas: index 0 is the
//! primary, the rest are backups tried in order when the primary refuses.
//! The `use_backup` hint persists across calls so callers issued during a
//! failover window converge on the replica that actually answered. Two
//! responses receive special handling: a standby return code triggers a
//! half-window sleep and retry, and a reroute response redirects the whole
//! exchange to another cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use drover_proto::{ForwardInfo, Message, PayloadValue};
use drover_types::config::config;
use drover_types::{ClusterRec, MsgType, codes, flags};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::error::CommError;
use crate::{conn, engine, resolver};

/// Sticky hint: the primary was down recently, try backups first.
static USE_BACKUP: AtomicBool = AtomicBool::new(false);

/// Open a connection to the active controller.
///
/// With a cluster override the override's endpoint is used; otherwise the
/// VIP (when configured) or the primary/backup list, honoring and updating
/// the persistent backup hint. Connection attempts are retried for up to
/// the configured message timeout, one round per second.
pub async fn open_controller_conn(
    cluster: Option<&ClusterRec>,
) -> Result<TcpStream, CommError> {
    let set = match cluster {
        Some(_) => None,
        None => Some(resolver::resolve_controllers().await?),
    };

    let max_retry_period = config().msg_timeout.max(1);
    for retry in 0..max_retry_period {
        if retry > 0 {
            sleep(Duration::from_secs(1)).await;
        }

        if let Some(rec) = cluster {
            match resolver::resolve_cluster(rec).await {
                Ok(addr) => {
                    if let Ok(stream) = conn::open_conn(addr).await {
                        return Ok(stream);
                    }
                    debug!(%addr, "failed to contact cluster controller");
                }
                Err(e) => debug!(host = %rec.host, error = %e, "cannot resolve cluster controller"),
            }
            continue;
        }

        let set = set.as_ref().expect("controller set resolved above");
        if let Some(vip) = set.vip {
            if let Ok(stream) = conn::open_conn(vip).await {
                return Ok(stream);
            }
            debug!(%vip, "failed to contact controller");
            continue;
        }

        if !USE_BACKUP.load(Ordering::Relaxed) {
            if let Ok(stream) = conn::open_conn(set.addrs[0]).await {
                USE_BACKUP.store(false, Ordering::Relaxed);
                return Ok(stream);
            }
            debug!(primary = %set.addrs[0], "failed to contact primary controller");
        }
        if set.addrs.len() > 1 || USE_BACKUP.load(Ordering::Relaxed) {
            for (i, addr) in set.addrs.iter().enumerate().skip(1) {
                if let Ok(stream) = conn::open_conn(*addr).await {
                    debug!(attempt = i - 1, backup = %addr, "contacted backup controller");
                    USE_BACKUP.store(true, Ordering::Relaxed);
                    return Ok(stream);
                }
            }
            USE_BACKUP.store(false, Ordering::Relaxed);
            debug!("failed to contact any backup controller");
        }
    }

    Err(CommError::ControllerConnection(
        "unable to contact the controller".to_string(),
    ))
}

/// Send a request to the active controller and return its response.
///
/// Handles the failover window (standby retry), cross-cluster reroutes,
/// and the controller-specific error remapping.
pub async fn send_recv_controller_msg(
    req: &mut Message,
    cluster: Option<&ClusterRec>,
) -> Result<Message, CommError> {
    // The controller is a single node; forwarding state from a reused
    // message must not leak into this exchange.
    req.forward = ForwardInfo::reset();
    req.ret_list.clear();
    req.pending = None;

    let start = Instant::now();
    let mut adopted: Option<ClusterRec> = None;

    let result = 'reroute: loop {
        let rec: Option<ClusterRec> = adopted.clone().or_else(|| cluster.cloned());
        if let Some(rec) = &rec {
            req.flags |= flags::GLOBAL_AUTH_KEY;
            if rec.protocol_version != 0 {
                req.protocol_version = rec.protocol_version;
            }
        }

        let mut stream = match open_controller_conn(rec.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => break Err(e),
        };

        let cfg = config();
        let have_backup = cfg.control_addrs.len() > 1;
        let ctld_timeout = Duration::from_secs(u64::from(cfg.controller_timeout));

        loop {
            let resp = match send_and_recv(&mut stream, req).await {
                Ok(resp) => resp,
                Err(e) => break 'reroute Err(e),
            };

            if rec.is_none()
                && standby_code(&resp)
                && have_backup
                && start.elapsed() < ctld_timeout + ctld_timeout / 2
            {
                // The backup is mid-takeover; give it half a window.
                info!("primary not responding, backup not yet in control, retrying");
                sleep(ctld_timeout / 2).await;
                USE_BACKUP.store(false, Ordering::Relaxed);
                stream = match open_controller_conn(rec.as_ref()).await {
                    Ok(stream) => stream,
                    Err(e) => break 'reroute Err(e),
                };
                continue;
            }

            if resp.msg_type == MsgType::REROUTE {
                if let PayloadValue::Reroute(rr) = &resp.payload {
                    info!(cluster = %rr.cluster.host, "rerouted to another cluster");
                    adopted = Some(rr.cluster.clone());
                    continue 'reroute;
                }
            }

            break 'reroute Ok(resp);
        }
    };

    result.map_err(CommError::into_controller)
}

/// Send to the controller without waiting for a response.
pub async fn send_only_controller_msg(
    req: &mut Message,
    cluster: Option<&ClusterRec>,
) -> Result<(), CommError> {
    if cluster.is_some() {
        req.flags |= flags::GLOBAL_AUTH_KEY;
    }
    let mut stream = open_controller_conn(cluster)
        .await
        .map_err(CommError::into_controller)?;
    engine::send_msg(&mut stream, req)
        .await
        .map_err(CommError::into_controller)?;
    Ok(())
}

/// Send to the controller and reduce the response to its return code.
pub async fn send_recv_controller_rc(
    req: &mut Message,
    cluster: Option<&ClusterRec>,
) -> Result<u32, CommError> {
    let resp = send_recv_controller_msg(req, cluster).await?;
    match &resp.payload {
        PayloadValue::ReturnCode(rc) => Ok(rc.code),
        _ => Ok(codes::SUCCESS),
    }
}

fn standby_code(resp: &Message) -> bool {
    resp.msg_type == MsgType::RETURN_CODE
        && matches!(
            &resp.payload,
            PayloadValue::ReturnCode(rc) if rc.code == codes::IN_STANDBY_MODE
        )
}

async fn send_and_recv(stream: &mut TcpStream, req: &mut Message) -> Result<Message, CommError> {
    engine::send_msg(stream, req).await?;
    engine::recv_msg(stream, 0).await
}

/// Forget the sticky backup hint (tests and controller role changes).
#[doc(hidden)]
pub fn reset_backup_hint() {
    USE_BACKUP.store(false, Ordering::Relaxed);
}
