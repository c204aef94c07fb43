//! TOML configuration for the Drover daemon.
//!
//! Every section and field has a default suiting a single-host test
//! cluster; a missing file or empty document is a valid configuration.
//! The parsed file is installed as the process-wide snapshot consumed by
//! the transport crates.

use std::path::{Path, PathBuf};

use drover_types::config::ProtoConfig;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Controller replica set and ports.
    pub controller: ControllerSection,
    /// Node-agent identity and listen port.
    pub agent: AgentSection,
    /// Exchange and failover timeouts.
    pub timeouts: TimeoutsSection,
    /// Fan-out and socket tuning.
    pub comm: CommSection,
    /// Authenticator options.
    pub auth: AuthSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[controller]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// Controller hosts, primary first. `"host:port"` pins a port.
    pub addrs: Vec<String>,
    /// Virtual-IP endpoint tried instead of the ordered list.
    pub vip: Option<String>,
    /// Base controller port.
    pub port: u16,
    /// Number of consecutive controller ports.
    pub port_count: u16,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            addrs: vec!["127.0.0.1".to_string()],
            vip: None,
            port: 6817,
            port_count: 1,
        }
    }
}

/// `[agent]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Port node agents listen on.
    pub port: u16,
    /// Node name announced to the controller; hostname when unset.
    pub node_name: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            port: 6818,
            node_name: None,
        }
    }
}

/// `[timeouts]` section, in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// Per-message exchange timeout.
    pub msg_timeout: u16,
    /// Controller failover window base.
    pub controller_timeout: u16,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            msg_timeout: 10,
            controller_timeout: 120,
        }
    }
}

/// `[comm]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommSection {
    /// Default fan-out width per tree hop.
    pub tree_width: u16,
    /// Comma-separated parameters (e.g. `"NoInAddrAny"`).
    pub params: String,
}

impl Default for CommSection {
    fn default() -> Self {
        Self {
            tree_width: 16,
            params: String::new(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Authenticator options (`key=value` pairs; the built-in
    /// authenticator reads `ttl=`); doubles as the default signing secret.
    pub authinfo: String,
    /// Process-wide secret for cross-cluster messages.
    pub global_key: String,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load from an explicit file, the default location, or defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => match default_config_path() {
                Some(p) if p.exists() => {
                    let content = std::fs::read_to_string(&p)?;
                    Ok(toml::from_str(&content)?)
                }
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// The transport snapshot this configuration describes.
    pub fn to_proto_config(&self) -> ProtoConfig {
        ProtoConfig {
            control_addrs: self.controller.addrs.clone(),
            vip_addr: self.controller.vip.clone(),
            controller_port: self.controller.port,
            controller_port_count: self.controller.port_count,
            agent_port: self.agent.port,
            msg_timeout: self.timeouts.msg_timeout,
            controller_timeout: self.timeouts.controller_timeout,
            tree_width: self.comm.tree_width,
            authinfo: self.auth.authinfo.clone(),
            global_auth_key: self.auth.global_key.clone(),
            comm_params: self.comm.params.clone(),
        }
    }
}

/// `~/.drover/droverd.toml`, when a home directory exists.
fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".drover").join("droverd.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[controller]
addrs = ["ctl-a", "ctl-b"]
vip = "ctl-vip"
port = 7817
port_count = 4

[agent]
port = 7818
node_name = "node-42"

[timeouts]
msg_timeout = 20
controller_timeout = 60

[comm]
tree_width = 50
params = "NoInAddrAny"

[auth]
authinfo = "ttl=300,socket=/run/auth.sock"
global_key = "federation-secret"

[log]
level = "debug"
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.controller.addrs, vec!["ctl-a", "ctl-b"]);
        assert_eq!(config.controller.vip.as_deref(), Some("ctl-vip"));
        assert_eq!(config.controller.port, 7817);
        assert_eq!(config.controller.port_count, 4);
        assert_eq!(config.agent.port, 7818);
        assert_eq!(config.agent.node_name.as_deref(), Some("node-42"));
        assert_eq!(config.timeouts.msg_timeout, 20);
        assert_eq!(config.timeouts.controller_timeout, 60);
        assert_eq!(config.comm.tree_width, 50);
        assert_eq!(config.comm.params, "NoInAddrAny");
        assert_eq!(config.auth.authinfo, "ttl=300,socket=/run/auth.sock");
        assert_eq!(config.auth.global_key, "federation-secret");
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = CliConfig::from_toml("").unwrap();
        assert_eq!(config.controller.addrs, vec!["127.0.0.1"]);
        assert_eq!(config.controller.port, 6817);
        assert_eq!(config.agent.port, 6818);
        assert_eq!(config.timeouts.msg_timeout, 10);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[timeouts]
msg_timeout = 5

[comm]
tree_width = 3
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.timeouts.msg_timeout, 5);
        assert_eq!(config.comm.tree_width, 3);
        // Unspecified sections keep their defaults.
        assert_eq!(config.controller.port, 6817);
        assert_eq!(config.timeouts.controller_timeout, 120);
    }

    #[test]
    fn test_to_proto_config() {
        let toml = r#"
[controller]
addrs = ["ctl-a"]
port = 7000

[auth]
authinfo = "ttl=60"
"#;
        let proto = CliConfig::from_toml(toml).unwrap().to_proto_config();
        assert_eq!(proto.control_addrs, vec!["ctl-a"]);
        assert_eq!(proto.controller_port, 7000);
        assert_eq!(proto.authinfo, "ttl=60");
        assert_eq!(proto.msg_timeout, 10);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("droverd.toml");
        std::fs::write(
            &path,
            r#"
[agent]
port = 9818
"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.agent.port, 9818);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("droverd.toml");
        std::fs::write(&path, "[controller\naddrs = 3").unwrap();
        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
