//! Proxy server and client configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tunnel_net::{DnsStrategy, Resolver, DEFAULT_TIMEOUT};

/// SOCKS5 server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_host: IpAddr,

    /// Port to listen on
    pub port: u16,

    /// Resolver used for direct outbound connections
    pub dns: DnsStrategy,

    /// Upstream SOCKS5 proxies. The last entry is dialed and the first one
    /// connects to the destination. When set, outbound connections are
    /// tunneled through the chain instead of dialed directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_chain: Option<Vec<String>>,

    /// Timeout settings
    pub timeouts: TimeoutConfig,
}

/// Timeout configuration, in milliseconds. Zero disables a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for each handshake message from the client
    pub handshake_ms: u64,

    /// Outbound connect, direct or through the forward chain
    pub connect_ms: u64,
}

/// Options shared by every hop of a SOCKS5 client chain
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Resolver for the proxy endpoint a client dials itself. Clones share
    /// one DNS client and its cache.
    pub resolver: Resolver,

    /// Deadline for the connect, hello and CONNECT exchanges
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1080,
            dns: DnsStrategy::DualStack,
            forward_chain: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Server on `port` with default settings
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get the listen address
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    /// Options handed to each client of the forward chain
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            resolver: Resolver::new(self.dns),
            timeout: self.timeouts.connect(),
        }
    }

    /// Reject a forward chain that is present but empty
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(chain) = &self.forward_chain {
            if chain.is_empty() {
                return Err(crate::ProxyError::config("Forward chain must not be empty"));
            }
            for url in chain {
                tunnel_net::parse_url(url)?.require_port()?;
            }
        }
        Ok(())
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::ProxyError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::ProxyError::config(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let default_ms = DEFAULT_TIMEOUT.as_millis() as u64;
        Self {
            handshake_ms: default_ms,
            connect_ms: default_ms,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            resolver: Resolver::new(DnsStrategy::DualStack),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientOptions {
    pub fn system_dns(mut self, system_dns: bool) -> Self {
        self.resolver = Resolver::new(DnsStrategy::from_system_flag(system_dns));
        self
    }

    /// Resolve through an existing resolver, sharing its cache
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
