//! Process-wide configuration snapshot.
//!
//! Every transport entry point reads its tunables from a single shared
//! snapshot. Readers take a cheap clone of the current `Arc`; writers
//! replace the whole snapshot atomically. Mutating a live snapshot in
//! place is not possible, which keeps concurrent senders consistent
//! within one exchange.

use std::sync::{Arc, LazyLock, RwLock};

/// Configuration consumed by the transport core.
#[derive(Debug, Clone)]
pub struct ProtoConfig {
    /// Controller hosts, index 0 = primary, the rest = backups in order.
    pub control_addrs: Vec<String>,
    /// Virtual-IP endpoint tried instead of the ordered list when set.
    pub vip_addr: Option<String>,
    /// Base controller port.
    pub controller_port: u16,
    /// Number of consecutive ports the controllers listen on.
    pub controller_port_count: u16,
    /// Port node agents listen on.
    pub agent_port: u16,
    /// Message timeout in seconds.
    pub msg_timeout: u16,
    /// Controller failover window base in seconds.
    pub controller_timeout: u16,
    /// Default fan-out width per tree hop.
    pub tree_width: u16,
    /// Authenticator options (`key=value[,key=value]*`).
    pub authinfo: String,
    /// Process-wide auth secret used when `GLOBAL_AUTH_KEY` is set.
    pub global_auth_key: String,
    /// Comma-separated communication parameters
    /// (recognized: `NoInAddrAny`, `NoCtldInAddrAny`).
    pub comm_params: String,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        Self {
            control_addrs: vec!["127.0.0.1".to_string()],
            vip_addr: None,
            controller_port: 6817,
            controller_port_count: 1,
            agent_port: 6818,
            msg_timeout: 10,
            controller_timeout: 120,
            tree_width: 16,
            authinfo: String::new(),
            global_auth_key: String::new(),
            comm_params: String::new(),
        }
    }
}

impl ProtoConfig {
    /// Message timeout in milliseconds.
    pub fn msg_timeout_ms(&self) -> u64 {
        u64::from(self.msg_timeout) * 1000
    }

    /// Whether a comma-separated communication parameter is set.
    pub fn has_comm_param(&self, key: &str) -> bool {
        self.comm_params
            .split(',')
            .any(|p| p.trim().eq_ignore_ascii_case(key))
    }
}

static CURRENT: LazyLock<RwLock<Arc<ProtoConfig>>> =
    LazyLock::new(|| RwLock::new(Arc::new(ProtoConfig::default())));

/// Return the current configuration snapshot.
pub fn config() -> Arc<ProtoConfig> {
    CURRENT.read().expect("config lock poisoned").clone()
}

/// Replace the configuration snapshot.
///
/// Exchanges already in flight keep the snapshot they started with.
pub fn set_config(cfg: ProtoConfig) {
    *CURRENT.write().expect("config lock poisoned") = Arc::new(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ProtoConfig::default();
        assert_eq!(cfg.control_addrs, vec!["127.0.0.1".to_string()]);
        assert_eq!(cfg.controller_port, 6817);
        assert_eq!(cfg.msg_timeout_ms(), 10_000);
        assert!(cfg.vip_addr.is_none());
    }

    #[test]
    fn test_comm_params() {
        let cfg = ProtoConfig {
            comm_params: "NoInAddrAny, NoCtldInAddrAny".to_string(),
            ..ProtoConfig::default()
        };
        assert!(cfg.has_comm_param("NoInAddrAny"));
        assert!(cfg.has_comm_param("noctldinaddrany"));
        assert!(!cfg.has_comm_param("Compression"));
    }

    #[test]
    fn test_snapshot_replace() {
        let before = config();
        set_config(ProtoConfig {
            tree_width: 3,
            ..ProtoConfig::default()
        });
        // The old snapshot is unaffected; new readers see the new value.
        assert_ne!(before.tree_width, 0);
        assert_eq!(config().tree_width, 3);
        set_config(ProtoConfig::default());
    }
}
