//! Node configuration
//!
//! Settings consumed by [`crate::Node`] at start: identity, listen
//! endpoint, the endpoint advertised to peers, and the reconnect policy.

use crate::error::ConfigError;
use crate::network::ReconnectPolicy;
use std::net::SocketAddr;

/// Default listening port
pub const DEFAULT_PORT: u16 = 4300;

/// Default cap on concurrent links
pub const DEFAULT_MAX_LINKS: usize = 256;

/// Node configuration
///
/// The advertised endpoint is what goes into this node's `register`
/// envelopes. It defaults to the bound listen address, which is only
/// right on a flat network; nodes behind NAT set it explicitly.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique call-sign identifying this node
    pub call_sign: String,
    /// Address to bind the TCP listener on
    pub listen_addr: SocketAddr,
    /// IP address announced to peers; defaults to the bound address
    pub advertised_ip: Option<String>,
    /// Port announced to peers; defaults to the bound port
    pub advertised_port: Option<u16>,
    /// Reconnect policy for outbound links
    pub reconnect: ReconnectPolicy,
    /// Maximum number of concurrent links
    pub max_links: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            call_sign: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertised_ip: None,
            advertised_port: None,
            reconnect: ReconnectPolicy::default(),
            max_links: DEFAULT_MAX_LINKS,
        }
    }
}

impl NodeConfig {
    /// Check the configuration for internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the call-sign is missing or a field
    /// holds an unusable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_sign.is_empty() {
            return Err(ConfigError::MissingCallSign);
        }
        if let Some(ip) = &self.advertised_ip {
            if ip.is_empty() {
                return Err(ConfigError::InvalidField {
                    field: "advertised_ip",
                    reason: "must be non-empty when set".to_string(),
                });
            }
        }
        if self.advertised_port == Some(0) {
            return Err(ConfigError::InvalidField {
                field: "advertised_port",
                reason: "must be non-zero when set".to_string(),
            });
        }
        if self.max_links == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_links",
                reason: "must allow at least one link".to_string(),
            });
        }
        Ok(())
    }
}
