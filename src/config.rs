//! Node configuration.
//!
//! Built by the CLI, validated once at startup. Any error here is fatal.

use std::time::Duration;
use thiserror::Error;
use crate::network::{AdmissionConfig, GossipConfig, ServerConfig};
use crate::proof::CircuitParameters;
use crate::trail::{stale_timeout, ReconcilePolicy};

/// Invalid configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A circuit parameter is out of its supported range.
    #[error("invalid circuit parameter `{field}`: {reason}")]
    InvalidParameter {
        /// Parameter name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A node setting is invalid.
    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A bootstrap address is not `host:port`.
    #[error("unresolvable bootstrap address {0}")]
    Bootstrap(String),
}

/// Everything a node needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Display name shown in the UI.
    pub node_name: String,
    /// Movement rules shared with every peer.
    pub params: CircuitParameters,
    /// Time between batch cuts.
    pub batch_interval: Duration,
    /// Silent intervals before a peer goes stale.
    pub stale_after_intervals: u32,
    /// How long stale trails are kept.
    pub eviction_grace: Duration,
    /// Require genesis-anchored, gap-free chains.
    pub strict_ordering: bool,
    /// UI feed server.
    pub ui: ServerConfig,
    /// Peer mesh.
    pub gossip: GossipConfig,
    /// Lobby admission.
    pub admission: AdmissionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            params: CircuitParameters::default(),
            batch_interval: Duration::from_secs(crate::DEFAULT_BATCH_INTERVAL_SECS),
            stale_after_intervals: 3,
            eviction_grace: Duration::from_secs(30),
            strict_ordering: true,
            ui: ServerConfig::default(),
            gossip: GossipConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check every setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.params.validate()?;

        if self.node_name.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                field: "node_name",
                reason: "must not be empty".into(),
            });
        }
        if self.batch_interval.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "batch_interval",
                reason: "must be positive".into(),
            });
        }
        if self.stale_after_intervals == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "stale_after_intervals",
                reason: "must be at least 1".into(),
            });
        }
        if self.gossip.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "max_reconnect_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.ui.bind_addr.port() != 0 && self.ui.bind_addr.port() == self.gossip.listen_addr.port() {
            return Err(ConfigError::InvalidSetting {
                field: "ws_port",
                reason: "UI and peer ports must differ".into(),
            });
        }
        for addr in &self.gossip.bootstrap {
            if !is_host_port(addr) {
                return Err(ConfigError::Bootstrap(addr.clone()));
            }
        }
        Ok(())
    }

    /// Staleness and ordering rules for the reconciler.
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            strict_ordering: self.strict_ordering,
            stale_after: stale_timeout(self.batch_interval, self.stale_after_intervals),
            eviction_grace: self.eviction_grace,
        }
    }
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map(|p| p != 0).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconcile_policy().stale_after, Duration::from_secs(15));
    }

    #[test]
    fn test_bad_params_rejected() {
        let mut config = NodeConfig::default();
        config.params.reveal_ratio = 2.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidParameter { .. })));
    }

    #[test]
    fn test_bad_settings_rejected() {
        let config = NodeConfig { batch_interval: Duration::ZERO, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting { field: "batch_interval", .. })
        ));

        let config = NodeConfig { stale_after_intervals: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.gossip.listen_addr.set_port(config.ui.bind_addr.port());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bootstrap_format() {
        assert!(is_host_port("127.0.0.1:9000"));
        assert!(is_host_port("peer.local:9001"));
        assert!(is_host_port("[::1]:9000"));
        assert!(!is_host_port("localhost"));
        assert!(!is_host_port(":9000"));
        assert!(!is_host_port("host:0"));

        let mut config = NodeConfig::default();
        config.gossip.bootstrap.push("nonsense".into());
        assert_eq!(config.validate(), Err(ConfigError::Bootstrap("nonsense".into())));
    }
}
