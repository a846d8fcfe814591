//! Bidirectional splice between an accepted client and its upstream

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

/// Copy bytes both ways until either side ends or fails.
///
/// The first direction to finish shuts down its writer; the other
/// direction is then aborted and both streams are dropped, so neither
/// socket outlives its peer.
pub async fn pipe<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_reader, client_writer) = tokio::io::split(client);
    let (upstream_reader, upstream_writer) = tokio::io::split(upstream);

    let mut client_to_upstream = tokio::spawn(pipe_direction(
        client_reader,
        upstream_writer,
        "client->upstream",
    ));
    let mut upstream_to_client = tokio::spawn(pipe_direction(
        upstream_reader,
        client_writer,
        "upstream->client",
    ));

    tokio::select! {
        result = &mut client_to_upstream => {
            if let Err(e) = result {
                error!("Client to upstream task failed: {}", e);
            }
            upstream_to_client.abort();
        }
        result = &mut upstream_to_client => {
            if let Err(e) = result {
                error!("Upstream to client task failed: {}", e);
            }
            client_to_upstream.abort();
        }
    }

    debug!("Tunnel closed");
}

async fn pipe_direction<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    let mut total_bytes = 0u64;

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Read error ({}): {}", direction, e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            debug!("Write error ({}): {}", direction, e);
            break;
        }
        total_bytes += n as u64;
    }

    let _ = writer.shutdown().await;
    debug!("Tunnel {} closed after {} bytes", direction, total_bytes);
    total_bytes
}
