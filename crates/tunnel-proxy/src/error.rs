//! Error types for the tunnel proxy

use thiserror::Error;
use tunnel_net::NetError;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    #[error("Connection to host ({destination}) rejected by server with code {code}")]
    Rejected { destination: String, code: u8 },

    #[error("Operation timed out after {ms} milliseconds")]
    Timeout { ms: u128 },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP request failed with code {status}: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(NetError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn socks5(msg: impl Into<String>) -> Self {
        Self::Socks5(msg.into())
    }

    pub fn rejected(destination: impl Into<String>, code: u8) -> Self {
        Self::Rejected {
            destination: destination.into(),
            code,
        }
    }

    pub fn tls(msg: impl ToString) -> Self {
        Self::Tls(msg.to_string())
    }

    pub fn http(msg: impl ToString) -> Self {
        Self::Http(msg.to_string())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<NetError> for ProxyError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout { ms } => Self::Timeout { ms },
            NetError::IoError(e) => Self::Io(e),
            other => Self::Network(other),
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        Self::Http(err.to_string())
    }
}
