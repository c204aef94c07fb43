//! Resolution of the active controller and of node-agent endpoints.
//!
//! Every peer name is carried as an [`Endpoint`]: configured controller
//! hosts, cluster-record overrides, and hostlist entries all parse into one
//! (an embedded `"host:port"` wins over the configured base port) and
//! resolve here. The effective controller port for each attempt is jittered
//! across the configured port range so retry load spreads without
//! coordination.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use drover_types::config::{ProtoConfig, config};
use drover_types::{ClusterRec, Endpoint};
use tokio::net::lookup_host;
use tracing::warn;

use crate::error::CommError;

/// The resolved controller replica set for one connection attempt.
#[derive(Debug, Clone)]
pub struct ControllerSet {
    /// Replica addresses, index 0 = primary.
    pub addrs: Vec<SocketAddr>,
    /// Virtual-IP endpoint tried instead of the ordered list when set.
    pub vip: Option<SocketAddr>,
}

/// Build the controller set from the configuration snapshot.
pub async fn resolve_controllers() -> Result<ControllerSet, CommError> {
    let cfg = config();
    if cfg.control_addrs.is_empty() || cfg.control_addrs[0].is_empty() {
        return Err(CommError::NoControllers);
    }
    if cfg.controller_port == 0 {
        return Err(CommError::NoControllers);
    }

    let port = jitter_port(&cfg);
    let mut addrs = Vec::with_capacity(cfg.control_addrs.len());
    for (i, host) in cfg.control_addrs.iter().enumerate() {
        let ep = Endpoint::parse(host, port);
        match resolve_endpoint(&ep).await {
            Ok(addr) => addrs.push(addr),
            // The primary must resolve; unresolvable backups are skipped.
            Err(e) if i == 0 => return Err(e),
            Err(e) => warn!(endpoint = %ep, error = %e, "skipping unresolvable backup controller"),
        }
    }

    let vip = match &cfg.vip_addr {
        Some(host) if !host.is_empty() => {
            Some(resolve_endpoint(&Endpoint::parse(host, port)).await?)
        }
        _ => None,
    };

    Ok(ControllerSet { addrs, vip })
}

/// Resolve a cross-cluster record's endpoint.
pub async fn resolve_cluster(rec: &ClusterRec) -> Result<SocketAddr, CommError> {
    resolve_endpoint(&rec.endpoint()).await
}

/// Resolve a host name to a socket address.
///
/// `"host:port"` forms carry their own port; bare hosts use `port`.
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, CommError> {
    resolve_endpoint(&Endpoint::parse(host, port)).await
}

/// Resolve an endpoint to its first socket address.
pub async fn resolve_endpoint(ep: &Endpoint) -> Result<SocketAddr, CommError> {
    lookup_host((ep.host.as_str(), ep.port))
        .await
        .map_err(|e| CommError::Connection(format!("cannot resolve {ep}: {e}")))?
        .next()
        .ok_or_else(|| CommError::Connection(format!("no address for {ep}")))
}

/// Effective controller port for this attempt.
///
/// Folds the clock and process id into the configured port range so
/// co-scheduled clients spread across the controllers' listening ports.
pub(crate) fn jitter_port(cfg: &ProtoConfig) -> u16 {
    let count = cfg.controller_port_count.max(1);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let offset = (now + u64::from(std::process::id())) % u64::from(count);
    cfg.controller_port + offset as u16
}
