//! HTTP/HTTPS requests over pluggable transports.
//!
//! The engine either dials the target itself or asks a
//! [`TransportProvider`] for an already established stream, for example
//! one tunneled through a SOCKS5 chain, and speaks HTTP/1.1 (optionally
//! inside TLS) over it.

mod agent;
mod builder;
mod requests;

pub use agent::Agent;
pub use builder::RequestBuilder;
pub use requests::{HttpRequests, HttpResponse, RequestOptions, SendOptions};

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream an agent can run HTTP over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Protocol used for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Strict lookup by name
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(ProxyError::config(format!(
                "Unsupported protocol for HTTP request '{}'",
                other
            ))),
        }
    }

    /// Scheme used for a URL: `https` selects TLS, anything else plain HTTP
    pub fn for_url_scheme(scheme: &str) -> Self {
        if scheme.eq_ignore_ascii_case("https") {
            Self::Https
        } else {
            Self::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a provider must connect for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub scheme: Scheme,
    pub hostname: String,
    pub port: u16,
}

/// Supplies the raw stream for a request instead of a direct dial.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_selection() {
        assert_eq!(Scheme::for_url_scheme("HTTPS"), Scheme::Https);
        assert_eq!(Scheme::for_url_scheme("ws"), Scheme::Http);
        assert_eq!(Scheme::from_name("https").unwrap(), Scheme::Https);
        assert!(Scheme::from_name("ftp")
            .unwrap_err()
            .to_string()
            .contains("Unsupported protocol"));
    }
}
