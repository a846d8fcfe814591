//! Direct TCP connections.

use crate::deadline::with_timeout;
use crate::dns::Resolver;
use crate::error::{NetError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Open a TCP connection to `host:port`.
///
/// Resolution and every connection attempt share one deadline. Resolved
/// addresses are tried in order until one accepts.
pub async fn dial(host: &str, port: u16, resolver: &Resolver, timeout: Duration) -> Result<TcpStream> {
    let target = format!("{host}:{port}");
    let stream = with_timeout(timeout, connect_any(host, port, resolver)).await??;
    stream.set_nodelay(true)?;
    debug!("Connected to {} via {}", target, stream.peer_addr()?);
    Ok(stream)
}

async fn connect_any(host: &str, port: u16, resolver: &Resolver) -> Result<TcpStream> {
    let addresses = resolver.lookup(host).await?;

    let mut last_error = None;
    for ip in addresses {
        let addr = SocketAddr::new(ip, port);
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connection attempt to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(NetError::Connect {
        target: format!("{host}:{port}"),
        source: last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")
        }),
    })
}
