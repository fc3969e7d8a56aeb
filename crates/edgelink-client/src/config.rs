//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable registration parameters for one tunnel client instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Server type announced in `register_server`.
    pub server_type: String,
    /// Fully qualified hostname this client serves.
    pub server_fqdn: String,
    /// Local target host connections are bridged to.
    pub target_host: String,
    /// Local target port.
    pub target_port: u16,
}

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub registration: ServerRegistration,
    /// Grace before acting on an `_end` message, letting in-flight writes
    /// flush.
    #[serde(with = "duration_secs")]
    pub end_grace: Duration,
    /// Grace after channel loss before every remaining connection is
    /// force-closed.
    #[serde(with = "duration_secs")]
    pub disconnect_grace: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }
}

/// Builder for TunnelConfig
pub struct TunnelConfigBuilder {
    server_type: Option<String>,
    server_fqdn: Option<String>,
    target_host: String,
    target_port: Option<u16>,
    end_grace: Duration,
    disconnect_grace: Duration,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self {
            server_type: None,
            server_fqdn: None,
            target_host: "localhost".to_string(),
            target_port: None,
            end_grace: Duration::from_secs(1),
            disconnect_grace: Duration::from_secs(10),
        }
    }
}

impl TunnelConfigBuilder {
    pub fn server_type(mut self, server_type: impl Into<String>) -> Self {
        self.server_type = Some(server_type.into());
        self
    }

    pub fn server_fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.server_fqdn = Some(fqdn.into());
        self
    }

    pub fn target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = host.into();
        self
    }

    pub fn target_port(mut self, port: u16) -> Self {
        self.target_port = Some(port);
        self
    }

    pub fn end_grace(mut self, grace: Duration) -> Self {
        self.end_grace = grace;
        self
    }

    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, String> {
        let server_type = match self.server_type {
            Some(server_type) if !server_type.is_empty() => server_type,
            _ => return Err("server_type is required".to_string()),
        };
        let server_fqdn = match self.server_fqdn {
            Some(fqdn) if !fqdn.is_empty() => fqdn,
            _ => return Err("server_fqdn is required".to_string()),
        };
        if self.target_host.is_empty() {
            return Err("target_host cannot be empty".to_string());
        }
        let target_port = match self.target_port {
            Some(port) if port >= 1 => port,
            Some(_) => return Err("target_port must be in 1-65535".to_string()),
            None => return Err("target_port is required".to_string()),
        };

        Ok(TunnelConfig {
            registration: ServerRegistration {
                server_type,
                server_fqdn,
                target_host: self.target_host,
                target_port,
            },
            end_grace: self.end_grace,
            disconnect_grace: self.disconnect_grace,
        })
    }
}
