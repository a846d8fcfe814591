//! SOCKS5 client and proxy chains

use super::protocol::{encode_connect, hello_request, read_reply, TargetAddr, HELLO_REPLY};
use super::Reply;
use crate::config::ClientOptions;
use crate::error::{ProxyError, Result};
use crate::http::{BoxedStream, ConnectTarget, HttpRequests, TransportProvider};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunnel_net::{dial, parse_url, with_timeout};

/// How a client reaches its proxy.
enum Transport {
    /// The client dials its proxy itself; holds the socket once open.
    Direct(Option<TcpStream>),
    /// The client is reached through `parent`, whose tunnel it adopts.
    Chained {
        parent: Box<SocksClient>,
        stream: Option<TcpStream>,
    },
}

/// Client for one SOCKS5 proxy endpoint.
///
/// Moves from idle to negotiated (`connect_socks`) to tunneled
/// (`connect_host`). Any I/O failure, timeout or rejection on the way
/// goes through [`close`](Self::close), which drops the socket and resets
/// both flags.
pub struct SocksClient {
    endpoint: String,
    options: ClientOptions,
    transport: Transport,
    socks_negotiated: bool,
    destination_connected: bool,
}

impl SocksClient {
    pub fn new(endpoint: impl Into<String>, options: ClientOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
            transport: Transport::Direct(None),
            socks_negotiated: false,
            destination_connected: false,
        }
    }

    /// Link clients so each one is reached through the next.
    ///
    /// The returned head is the first URL. The last URL is the proxy that
    /// is dialed; traffic leaves the chain at the head.
    pub fn create_chain<S: AsRef<str>>(urls: &[S], options: ClientOptions) -> Result<Self> {
        let mut parent: Option<SocksClient> = None;
        for url in urls.iter().rev() {
            let mut client = SocksClient::new(url.as_ref(), options.clone());
            if let Some(parent) = parent.take() {
                client.set_parent(parent);
            }
            parent = Some(client);
        }
        parent.ok_or_else(|| ProxyError::config("Cannot create empty chain"))
    }

    /// Use an already connected socket to the proxy. Fails once a socket
    /// or parent is assigned.
    pub fn set_socket(&mut self, stream: TcpStream) -> bool {
        match &mut self.transport {
            Transport::Direct(slot @ None) => {
                *slot = Some(stream);
                true
            }
            _ => false,
        }
    }

    /// Reach this proxy through `parent`. Fails once a socket or parent is
    /// assigned.
    pub fn set_parent(&mut self, parent: SocksClient) -> bool {
        match self.transport {
            Transport::Direct(None) => {
                self.transport = Transport::Chained {
                    parent: Box::new(parent),
                    stream: None,
                };
                true
            }
            _ => false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Negotiated and the proxy has not closed the socket since
    pub fn socks_connected(&self) -> bool {
        self.socks_negotiated && !self.peer_closed()
    }

    pub fn host_connected(&self) -> bool {
        self.destination_connected && !self.peer_closed()
    }

    /// Number of proxies in the chain headed by this client
    pub fn chain_len(&self) -> usize {
        match &self.transport {
            Transport::Direct(_) => 1,
            Transport::Chained { parent, .. } => 1 + parent.chain_len(),
        }
    }

    /// The socket to the proxy, unless the proxy has closed it
    pub fn socket(&self) -> Option<&TcpStream> {
        self.held_socket().filter(|_| !self.peer_closed())
    }

    fn held_socket(&self) -> Option<&TcpStream> {
        match &self.transport {
            Transport::Direct(stream) | Transport::Chained { stream, .. } => stream.as_ref(),
        }
    }

    /// Whether the proxy ended or broke the held socket. Peeks without
    /// consuming, so buffered tunnel bytes stay readable.
    fn peer_closed(&self) -> bool {
        let Some(socket) = self.held_socket() else {
            return false;
        };
        let waker = Waker::from(Arc::new(IgnoreWake));
        let mut cx = Context::from_waker(&waker);
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        matches!(
            socket.poll_peek(&mut cx, &mut buf),
            Poll::Ready(Ok(0)) | Poll::Ready(Err(_))
        )
    }

    /// Tear down state for a socket the proxy has already closed
    fn reap(&mut self) {
        if self.peer_closed() {
            debug!("SOCKS5 proxy {} closed the connection", self.endpoint);
            self.close();
        }
    }

    fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.transport {
            Transport::Direct(stream) | Transport::Chained { stream, .. } => stream.as_mut(),
        }
    }

    /// Hand the socket over, typically once the tunnel is established.
    /// The state flags are kept so the client cannot be reused.
    pub fn take_socket(&mut self) -> Option<TcpStream> {
        match &mut self.transport {
            Transport::Direct(stream) | Transport::Chained { stream, .. } => stream.take(),
        }
    }

    /// Negotiate SOCKS5 with this proxy, bringing up the chain below it
    /// first. Returns `false` when already negotiated.
    pub async fn connect_socks(&mut self) -> Result<bool> {
        self.reap();
        if self.socks_negotiated {
            return Ok(false);
        }

        match self.negotiate().await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn connect_socks_boxed(&mut self) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(self.connect_socks())
    }

    async fn negotiate(&mut self) -> Result<()> {
        match &mut self.transport {
            Transport::Chained { parent, stream } => {
                if stream.is_none() {
                    parent.connect_socks_boxed().await?;
                    parent.connect_host(&self.endpoint).await?;
                    let adopted = parent
                        .take_socket()
                        .ok_or_else(|| ProxyError::socks5("Could not get SOCKS socket from parent"))?;
                    *stream = Some(adopted);
                }
            }
            Transport::Direct(stream) => {
                if stream.is_none() {
                    let url = parse_url(&self.endpoint)?;
                    let port = url.require_port()?;
                    *stream = Some(
                        dial(&url.host, port, &self.options.resolver, self.options.timeout).await?,
                    );
                }
            }
        }

        let timeout = self.options.timeout;
        let endpoint = self.endpoint.clone();
        let socket = self
            .socket_mut()
            .ok_or_else(|| ProxyError::internal("SOCKS socket missing after connect"))?;

        socket.write_all(&hello_request()).await?;
        let mut reply = [0u8; 2];
        with_timeout(timeout, socket.read_exact(&mut reply)).await??;

        if reply != HELLO_REPLY {
            return Err(ProxyError::socks5(format!(
                "Unsupported version or method from {}: {:?}",
                endpoint, reply
            )));
        }

        debug!("SOCKS5 negotiated with {}", endpoint);
        self.socks_negotiated = true;
        Ok(())
    }

    /// Ask the proxy to CONNECT to the host and port of `url`.
    ///
    /// Returns `false` without doing anything when not negotiated, when no
    /// socket is held, or when a destination is already connected.
    pub async fn connect_host(&mut self, url: &str) -> Result<bool> {
        self.reap();
        if self.destination_connected || !self.socks_negotiated || self.socket().is_none() {
            return Ok(false);
        }

        let parsed = parse_url(url)?;
        let port = parsed.require_port()?;
        let target = TargetAddr::from_host(&parsed.host)?;

        match self.request_connect(&target, port, url).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    async fn request_connect(&mut self, target: &TargetAddr, port: u16, url: &str) -> Result<()> {
        let timeout = self.options.timeout;
        let endpoint = self.endpoint.clone();
        let socket = self
            .socket_mut()
            .ok_or_else(|| ProxyError::internal("SOCKS socket missing"))?;

        debug!("SOCKS5 CONNECT {}:{} via {}", target, port, endpoint);
        socket.write_all(&encode_connect(target, port)).await?;
        let reply = with_timeout(timeout, read_reply(socket)).await??;

        if reply.code != Reply::Success as u8 {
            let reason = Reply::from_byte(reply.code)
                .map_or_else(|| format!("code {}", reply.code), |r| format!("{:?}", r));
            warn!("SOCKS5 CONNECT to {} via {} rejected: {}", url, endpoint, reason);
            return Err(ProxyError::rejected(url, reply.code));
        }

        self.destination_connected = true;
        Ok(())
    }

    /// Drop the socket and reset both flags. Safe to call repeatedly.
    pub fn close(&mut self) {
        drop(self.take_socket());
        if let Transport::Chained { parent, .. } = &mut self.transport {
            parent.close();
        }
        self.socks_negotiated = false;
        self.destination_connected = false;
    }

    /// HTTP engine whose requests travel through this client.
    ///
    /// The client serves exactly one destination: the first request
    /// negotiates and connects, any later one is refused.
    pub fn http_requests(self) -> HttpRequests {
        HttpRequests::with_provider(Arc::new(SocksTunnel::new(self)))
    }
}

struct IgnoreWake;

impl Wake for IgnoreWake {
    fn wake(self: Arc<Self>) {}
}

impl std::fmt::Debug for SocksClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocksClient")
            .field("endpoint", &self.endpoint)
            .field("chain_len", &self.chain_len())
            .field("socks_negotiated", &self.socks_negotiated)
            .field("destination_connected", &self.destination_connected)
            .finish()
    }
}

/// Transport provider backed by a SOCKS5 client
#[derive(Clone)]
pub struct SocksTunnel {
    client: Arc<Mutex<SocksClient>>,
}

impl SocksTunnel {
    pub fn new(client: SocksClient) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }

    pub fn client(&self) -> Arc<Mutex<SocksClient>> {
        Arc::clone(&self.client)
    }
}

#[async_trait]
impl TransportProvider for SocksTunnel {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedStream> {
        let mut client = self.client.lock().await;
        if client.host_connected() {
            return Err(ProxyError::socks5(
                "Cannot use this SOCKS client for a new HTTP request",
            ));
        }
        if !client.socks_connected() {
            client.connect_socks().await?;
        }

        let host = TargetAddr::from_host(&target.hostname)?.host();
        client
            .connect_host(&format!("http://{}:{}/", host, target.port))
            .await?;
        let stream = client.take_socket().ok_or_else(|| {
            ProxyError::socks5("Could not get SOCKS socket while making HTTP request")
        })?;

        info!("Tunnel to {}:{} ready via {}", target.hostname, target.port, client.endpoint());
        Ok(Box::new(stream))
    }
}
