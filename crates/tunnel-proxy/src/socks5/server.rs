//! SOCKS5 server

use super::client::SocksClient;
use super::protocol::{encode_reply, parse_hello, parse_request, ParsedRequest, TargetAddr, HELLO_REPLY};
use super::Reply;
use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};
use crate::tunnel::pipe;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tunnel_net::{dial, with_timeout, Resolver};

/// Size of the buffer a single handshake message must fit in
const MESSAGE_BUFFER: usize = 512;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications published by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A client connection was accepted
    Connection { peer: SocketAddr },
    /// A CONNECT request was parsed; published before dialing out
    Request { peer: SocketAddr, host: String, port: u16 },
    /// The handshake completed and the tunnel is being piped
    Connected { peer: SocketAddr },
    /// The connection was torn down before piping
    ConnectError { peer: SocketAddr, reason: String },
}

/// State shared by the accept loop and every session
struct ServerContext {
    settings: Arc<RwLock<ServerConfig>>,
    events: broadcast::Sender<ServerEvent>,
    resolver: Resolver,
}

impl ServerContext {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// SOCKS5 server accepting "no authentication" CONNECT requests
pub struct SocksServer {
    settings: Arc<RwLock<ServerConfig>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl SocksServer {
    pub fn new(config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings: Arc::new(RwLock::new(config)),
            events,
            shutdown: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Server on `port` with default settings
    pub fn with_port(port: u16) -> Self {
        Self::new(ServerConfig::with_port(port))
    }

    /// Receive server events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn config(&self) -> ServerConfig {
        self.settings.read().await.clone()
    }

    /// Replace the forwarding chain used by connections accepted from now on
    pub async fn set_forward_chain(&self, chain: Option<Vec<String>>) -> Result<()> {
        let mut updated = self.settings.read().await.clone();
        updated.forward_chain = chain;
        updated.validate()?;
        *self.settings.write().await = updated;
        Ok(())
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Resolves with the bound address once listening; a bind error is
    /// returned to the caller.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.accept_task.is_some() {
            return Err(ProxyError::config("Server already started"));
        }

        let config = self.settings.read().await.clone();
        config.validate()?;

        let listener = TcpListener::bind(config.bind_address()).await?;
        let local_addr = listener.local_addr()?;
        info!("Starting SOCKS5 server on {}", local_addr);

        let context = Arc::new(ServerContext {
            settings: Arc::clone(&self.settings),
            events: self.events.clone(),
            resolver: Resolver::new(config.dns),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.accept_task = Some(tokio::spawn(accept_loop(listener, context, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting connections. Sessions already running are left to
    /// finish on their own.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("Accept task failed: {}", e);
            }
            info!("SOCKS5 server stopped");
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let session = Session::new(socket, peer, Arc::clone(&context));
                    tokio::spawn(session.run());
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    AwaitingHello,
    AwaitingRequest,
    Connecting,
    Piping,
}

/// One accepted connection, moving strictly through its phases
struct Session {
    socket: TcpStream,
    peer: SocketAddr,
    phase: Phase,
    context: Arc<ServerContext>,
}

impl Session {
    fn new(socket: TcpStream, peer: SocketAddr, context: Arc<ServerContext>) -> Self {
        Self {
            socket,
            peer,
            phase: Phase::AwaitingHello,
            context,
        }
    }

    async fn run(mut self) {
        debug!("New SOCKS5 connection from {}", self.peer);
        self.context.emit(ServerEvent::Connection { peer: self.peer });

        let settings = self.context.settings.read().await.clone();
        match self.handshake(&settings).await {
            Ok(upstream) => {
                self.phase = Phase::Piping;
                self.context.emit(ServerEvent::Connected { peer: self.peer });
                pipe(self.socket, upstream).await;
            }
            Err(e) => self.terminate(e).await,
        }
    }

    async fn handshake(&mut self, settings: &ServerConfig) -> Result<TcpStream> {
        let timeout = settings.timeouts.handshake();

        accept_hello(&mut self.socket, timeout).await?;
        self.phase = Phase::AwaitingRequest;

        let (target, port) = read_request(&mut self.socket, timeout).await?;
        self.phase = Phase::Connecting;
        debug!("SOCKS5 CONNECT from {} to {}:{}", self.peer, target, port);
        self.context.emit(ServerEvent::Request {
            peer: self.peer,
            host: target.to_string(),
            port,
        });

        let upstream = match self.connect_outbound(settings, &target, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let reply = encode_reply(Reply::GeneralFailure, unspecified_address());
                let _ = self.socket.write_all(&reply).await;
                return Err(e);
            }
        };

        let bound = upstream.local_addr()?;
        self.socket
            .write_all(&encode_reply(Reply::Success, bound))
            .await?;
        info!("SOCKS5 tunnel {} -> {}:{} established", self.peer, target, port);
        Ok(upstream)
    }

    async fn connect_outbound(
        &self,
        settings: &ServerConfig,
        target: &TargetAddr,
        port: u16,
    ) -> Result<TcpStream> {
        match &settings.forward_chain {
            Some(chain) => {
                let options = settings
                    .client_options()
                    .with_resolver(self.context.resolver.clone());
                let mut client = SocksClient::create_chain(chain, options)?;
                client.connect_socks().await?;
                client
                    .connect_host(&format!("http://{}:{}", target.host(), port))
                    .await?;
                if !client.host_connected() {
                    return Err(ProxyError::socks5("Forward chain did not connect to host"));
                }
                client
                    .take_socket()
                    .ok_or_else(|| ProxyError::internal("Forward chain lost its socket"))
            }
            None => Ok(dial(
                &target.dial_host(),
                port,
                &self.context.resolver,
                settings.timeouts.connect(),
            )
            .await?),
        }
    }

    /// Tear the connection down and report why. Consumes the session, so
    /// it runs at most once.
    async fn terminate(mut self, reason: ProxyError) {
        warn!(
            "SOCKS5 connection from {} failed while {:?}: {}",
            self.peer, self.phase, reason
        );
        let _ = self.socket.shutdown().await;
        self.context.emit(ServerEvent::ConnectError {
            peer: self.peer,
            reason: reason.to_string(),
        });
    }
}

fn unspecified_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

/// Read one handshake message with a single read
async fn read_message<S>(stream: &mut S, buf: &mut [u8], timeout: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let n = with_timeout(timeout, stream.read(buf)).await??;
    if n == 0 {
        return Err(ProxyError::socks5("Connection closed during handshake"));
    }
    Ok(n)
}

async fn accept_hello<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; MESSAGE_BUFFER];
    let n = read_message(stream, &mut buf, timeout).await?;
    parse_hello(&buf[..n])?;
    stream.write_all(&HELLO_REPLY).await?;
    Ok(())
}

/// Read the CONNECT request; unsupported requests are answered before
/// the error is returned.
async fn read_request<S>(stream: &mut S, timeout: Duration) -> Result<(TargetAddr, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; MESSAGE_BUFFER];
    let n = read_message(stream, &mut buf, timeout).await?;

    match parse_request(&buf[..n])? {
        ParsedRequest::Connect { target, port } => Ok((target, port)),
        ParsedRequest::UnsupportedCommand(command) => {
            let reply = encode_reply(Reply::CommandNotSupported, unspecified_address());
            stream.write_all(&reply).await?;
            Err(ProxyError::socks5(format!("Unsupported command: {}", command)))
        }
        ParsedRequest::UnsupportedAddressType(atyp) => {
            let reply = encode_reply(Reply::AddressTypeNotSupported, unspecified_address());
            stream.write_all(&reply).await?;
            Err(ProxyError::socks5(format!("Unsupported address type: {}", atyp)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_hello_is_answered() {
        let mut stream = Builder::new().read(&[5, 1, 0]).write(&[5, 0]).build();
        accept_hello(&mut stream, TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_version_hello_writes_nothing() {
        let mut stream = Builder::new().read(&[4, 1, 0]).build();
        let err = accept_hello(&mut stream, TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported SOCKS version"));
    }

    #[tokio::test]
    async fn test_hello_with_two_methods_is_rejected() {
        let mut stream = Builder::new().read(&[5, 2, 0, 2]).build();
        assert!(accept_hello(&mut stream, TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_before_hello() {
        let mut stream = Builder::new().build();
        let err = accept_hello(&mut stream, TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("Connection closed"));
    }

    #[tokio::test]
    async fn test_request_domain_target() {
        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        let mut stream = Builder::new().read(&request).build();

        let (target, port) = read_request(&mut stream, TIMEOUT).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".to_string()));
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_bind_command_gets_code_7() {
        let mut stream = Builder::new()
            .read(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .write(&[5, 7, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let err = read_request(&mut stream, TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported command: 2"));
    }

    #[tokio::test]
    async fn test_unknown_address_type_gets_code_8() {
        let mut stream = Builder::new()
            .read(&[5, 1, 0, 9, 1, 2, 3, 4, 0, 80])
            .write(&[5, 8, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let err = read_request(&mut stream, TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported address type: 9"));
    }

    #[tokio::test]
    async fn test_request_read_times_out() {
        let (mut stream, _peer) = tokio::io::duplex(64);
        let err = read_request(&mut stream, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_invalid_forward_chain_is_refused() {
        let server = SocksServer::with_port(0);
        assert!(server.set_forward_chain(Some(vec![])).await.is_err());
        assert!(server.config().await.forward_chain.is_none());

        let chain = vec!["socks5://127.0.0.1:1081".to_string()];
        server.set_forward_chain(Some(chain.clone())).await.unwrap();
        assert_eq!(server.config().await.forward_chain, Some(chain));
    }
}
