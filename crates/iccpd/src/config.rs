//! Daemon configuration
//!
//! Loaded from a TOML file; every field has a default so a minimal
//! config only names the peer relationship.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IccpError, Result};
use crate::session::Role;

fn default_keepalive_secs() -> u64 {
    1
}

fn default_warm_reboot_grace_secs() -> u64 {
    90
}

fn default_if_down_grace_secs() -> u64 {
    30
}

fn default_peer_link() -> String {
    "PortChannel100".to_string()
}

fn default_priority() -> u16 {
    32768
}

/// iccpd daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IccpConfig {
    /// Local ICCP endpoint address; also seeds the node identifier.
    pub local_addr: Ipv4Addr,
    /// Peer chassis ICCP endpoint address.
    pub peer_addr: Ipv4Addr,
    /// Which side pushes first during the bulk handshake.
    pub role: Role,
    /// Designated peer-link interface.
    #[serde(default = "default_peer_link")]
    pub peer_link: String,
    /// System priority announced in the system-config TLV.
    #[serde(default = "default_priority")]
    pub priority: u16,
    /// Keep-alive interval, measured from last send.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Warm-reboot grace window.
    #[serde(default = "default_warm_reboot_grace_secs")]
    pub warm_reboot_grace_secs: u64,
    /// How long an interface must stay down before its deferred MAC
    /// deletions run.
    #[serde(default = "default_if_down_grace_secs")]
    pub if_down_grace_secs: u64,
}

impl IccpConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| IccpError::Config(e.to_string()))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn warm_reboot_grace(&self) -> Duration {
        Duration::from_secs(self.warm_reboot_grace_secs)
    }

    pub fn if_down_grace(&self) -> Duration {
        Duration::from_secs(self.if_down_grace_secs)
    }
}

impl Default for IccpConfig {
    fn default() -> Self {
        Self {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            peer_addr: Ipv4Addr::new(10, 0, 0, 2),
            role: Role::Active,
            peer_link: default_peer_link(),
            priority: default_priority(),
            keepalive_secs: default_keepalive_secs(),
            warm_reboot_grace_secs: default_warm_reboot_grace_secs(),
            if_down_grace_secs: default_if_down_grace_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let cfg: IccpConfig = toml::from_str(
            r#"
            local_addr = "10.1.0.1"
            peer_addr = "10.1.0.2"
            role = "standby"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.role, Role::Standby);
        assert_eq!(cfg.keepalive(), Duration::from_secs(1));
        assert_eq!(cfg.warm_reboot_grace(), Duration::from_secs(90));
        assert_eq!(cfg.peer_link, "PortChannel100");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = toml::from_str::<IccpConfig>("local_addr = \"not-an-ip\"");
        assert!(err.is_err());
    }
}
