//! Single-use adapters between a supplied stream and the HTTP client.

use super::{BoxedStream, Scheme};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{self, ClientConfig, OwnedTrustAnchor, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Adapts one stream for one request.
///
/// Plain agents speak HTTP on the stream as is; TLS agents first run a
/// handshake over it with the target hostname as server name. `open`
/// consumes the agent, and the socket is closed when the returned
/// [`AgentSession`] is dropped, so teardown happens exactly once.
pub struct Agent {
    scheme: Scheme,
    stream: BoxedStream,
    hostname: String,
}

/// HTTP/1.1 connection owned by an agent
pub struct AgentSession {
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    hostname: String,
}

impl Agent {
    pub fn new(scheme: Scheme, stream: BoxedStream, hostname: impl Into<String>) -> Self {
        Self {
            scheme,
            stream,
            hostname: hostname.into(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Establish the connection: TLS when required, then the HTTP/1.1 handshake.
    pub async fn open(self, tls: &TlsConnector) -> Result<AgentSession> {
        let io: BoxedStream = match self.scheme {
            Scheme::Http => self.stream,
            Scheme::Https => {
                let server_name = rustls::ServerName::try_from(self.hostname.as_str())
                    .map_err(|e| ProxyError::tls(format!("Invalid server name {}: {}", self.hostname, e)))?;
                let tls_stream = tls
                    .connect(server_name, self.stream)
                    .await
                    .map_err(|e| ProxyError::tls(format!("Handshake with {} failed: {}", self.hostname, e)))?;
                Box::new(tls_stream)
            }
        };

        let (sender, connection) = http1::handshake(TokioIo::new(io)).await?;
        let hostname = self.hostname;
        let label = hostname.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP connection to {} ended: {}", label, e);
            }
        });

        Ok(AgentSession {
            sender,
            driver,
            hostname,
        })
    }
}

impl AgentSession {
    pub async fn send(&mut self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        self.sender.ready().await?;
        Ok(self.sender.send_request(request).await?)
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        debug!("Destroying agent for {}", self.hostname);
        self.driver.abort();
    }
}

/// Client TLS configuration trusting the webpki root set
pub fn default_tls_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));

    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
