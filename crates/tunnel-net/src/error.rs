use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Could not parse URL: {0}")]
    InvalidUrl(String),

    #[error("Could not extract port from URL: {0}")]
    MissingPort(String),

    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("Operation timed out after {ms} milliseconds")]
    Timeout { ms: u128 },

    #[error("Connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl NetError {
    pub fn dns(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dns {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
