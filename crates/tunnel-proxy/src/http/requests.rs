//! Request engine

use super::agent::{default_tls_config, Agent};
use super::{BoxedStream, ConnectTarget, RequestBuilder, Scheme, TransportProvider};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use tunnel_net::{dial, parse_url, with_timeout, DnsStrategy, Resolver, DEFAULT_TIMEOUT};

/// What to send: the target and the request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub hostname: String,
    pub port: u16,
    /// Origin-form target, path plus query
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

/// Per-call extras for the URL based helpers
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Deadline for the exchange, overriding the engine default
    pub timeout: Option<Duration>,
    /// Headers added to the request
    pub headers: Vec<(String, String)>,
}

/// A complete response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP/HTTPS request engine.
///
/// Cheap to clone. Without a provider every request dials its target
/// directly; with one, the provider supplies the stream.
#[derive(Clone)]
pub struct HttpRequests {
    provider: Option<Arc<dyn TransportProvider>>,
    tls: TlsConnector,
    resolver: Resolver,
    timeout: Duration,
}

impl Default for HttpRequests {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpRequests {
    pub fn new(provider: Option<Arc<dyn TransportProvider>>) -> Self {
        Self {
            provider,
            tls: TlsConnector::from(default_tls_config()),
            resolver: Resolver::new(DnsStrategy::DualStack),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Engine whose streams come from `provider`
    pub fn with_provider(provider: Arc<dyn TransportProvider>) -> Self {
        Self::new(Some(provider))
    }

    /// Shared engine that always dials directly.
    ///
    /// It resolves with the system resolver: a dual-stack DNS client is
    /// bound to the runtime that first uses it, and this engine may be
    /// driven from any runtime in the process.
    pub fn direct() -> &'static HttpRequests {
        static DIRECT: OnceLock<HttpRequests> = OnceLock::new();
        DIRECT.get_or_init(|| HttpRequests::default().with_dns(DnsStrategy::System))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dns(mut self, strategy: DnsStrategy) -> Self {
        self.resolver = Resolver::new(strategy);
        self
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = TlsConnector::from(config);
        self
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Send one request and collect the whole response.
    ///
    /// The stream comes from the provider when one is configured. The
    /// exchange runs under `timeout` (the engine default when `None`); on
    /// timeout or error the agent is destroyed before this returns.
    pub async fn send_request(
        &self,
        scheme: Scheme,
        options: &RequestOptions,
        body: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        if options.hostname.is_empty() || options.port == 0 {
            return Err(ProxyError::config(
                "Could not create agent: request options need a hostname and a port",
            ));
        }
        let timeout = timeout.unwrap_or(self.timeout);

        let stream: BoxedStream = match &self.provider {
            Some(provider) => {
                let target = ConnectTarget {
                    scheme,
                    hostname: options.hostname.clone(),
                    port: options.port,
                };
                provider.connect(&target).await?
            }
            None => {
                let stream = dial(&options.hostname, options.port, &self.resolver, timeout).await?;
                Box::new(stream) as BoxedStream
            }
        };
        let agent = Agent::new(scheme, stream, options.hostname.clone());

        debug!(
            "{} {}://{}:{}{}",
            options.method, scheme, options.hostname, options.port, options.path
        );
        with_timeout(timeout, self.exchange(agent, options, body)).await?
    }

    async fn exchange(&self, agent: Agent, options: &RequestOptions, body: Option<Bytes>) -> Result<HttpResponse> {
        let mut session = agent.open(&self.tls).await?;
        let request = build_request(options, body)?;

        let response = session.send(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await?.to_bytes();
        drop(session);

        debug!("Response {} with {} bytes from {}", status, body.len(), options.hostname);
        Ok(HttpResponse { status, headers, body })
    }

    /// Send a request to `url` and return the body of a 2xx response.
    ///
    /// Any other status fails with an error naming the status and the URL.
    pub async fn send_buffer(
        &self,
        url: &str,
        method: &str,
        body: Option<Bytes>,
        content_type: Option<&str>,
        extra: &SendOptions,
    ) -> Result<Bytes> {
        let parsed = parse_url(url)?;
        let port = parsed.require_port()?;

        let mut headers = extra.headers.clone();
        if let Some(body) = &body {
            headers.push((
                CONTENT_TYPE.to_string(),
                content_type.unwrap_or("application/octet-stream").to_string(),
            ));
            headers.push((CONTENT_LENGTH.to_string(), body.len().to_string()));
        }

        let options = RequestOptions {
            hostname: parsed.host.clone(),
            port,
            path: parsed.path_and_query(),
            method: method.to_string(),
            headers,
        };

        let response = self
            .send_request(Scheme::for_url_scheme(&parsed.scheme), &options, body, extra.timeout)
            .await?;
        if !(200..300).contains(&response.status) {
            warn!("HTTP {} {} failed with status {}", method, url, response.status);
            return Err(ProxyError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }

        Ok(response.body)
    }

    /// [`send_buffer`](Self::send_buffer) with UTF-8 text in and out
    pub async fn send_text(
        &self,
        url: &str,
        method: &str,
        text: Option<&str>,
        content_type: Option<&str>,
        extra: &SendOptions,
    ) -> Result<String> {
        let body = text.map(|t| Bytes::copy_from_slice(t.as_bytes()));
        let response = self.send_buffer(url, method, body, content_type, extra).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    pub async fn get_buffer(&self, url: &str) -> Result<Bytes> {
        self.send_buffer(url, "GET", None, None, &SendOptions::default())
            .await
    }

    pub async fn post_buffer(&self, url: &str, body: Bytes, content_type: Option<&str>) -> Result<Bytes> {
        self.send_buffer(url, "POST", Some(body), content_type, &SendOptions::default())
            .await
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        self.send_text(url, "GET", None, None, &SendOptions::default())
            .await
    }

    pub async fn post_text(&self, url: &str, text: &str) -> Result<String> {
        self.send_text(url, "POST", Some(text), Some("text/plain"), &SendOptions::default())
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let text = self.get_text(url).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// POST `value` as JSON. A response that is not JSON comes back as a
    /// JSON string holding the raw text.
    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, value: Option<&T>) -> Result<serde_json::Value> {
        let json = value.map(serde_json::to_string).transpose()?;
        let text = self
            .send_text(
                url,
                "POST",
                json.as_deref(),
                Some("application/json"),
                &SendOptions::default(),
            )
            .await?;

        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// Start a fluent request to `url`
    pub fn create(&self, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), url.into())
    }
}

fn build_request(options: &RequestOptions, body: Option<Bytes>) -> Result<Request<Full<Bytes>>> {
    let method = Method::from_bytes(options.method.to_ascii_uppercase().as_bytes()).map_err(ProxyError::http)?;
    let host = if options.hostname.contains(':') {
        format!("[{}]:{}", options.hostname, options.port)
    } else {
        format!("{}:{}", options.hostname, options.port)
    };

    let mut headers = HeaderMap::new();
    headers.insert(HOST, HeaderValue::from_str(&host).map_err(ProxyError::http)?);
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(ProxyError::http)?;
        let value = HeaderValue::from_str(value).map_err(ProxyError::http)?;
        headers.insert(name, value);
    }

    let mut request = Request::builder()
        .method(method)
        .uri(options.path.as_str())
        .body(Full::new(body.unwrap_or_default()))?;
    *request.headers_mut() = headers;
    Ok(request)
}
