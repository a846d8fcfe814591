//! Integration tests for the SOCKS5 server, client chains and HTTP engine

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tunnel_proxy::http::SendOptions;
use tunnel_proxy::{
    ClientOptions, DnsStrategy, HttpRequests, ProxyError, ServerConfig, ServerEvent, SocksClient,
    SocksServer,
};

const WAIT: Duration = Duration::from_secs(5);

/// Minimal HTTP/1.1 server: `/missing` answers 404, any other path answers
/// 200 with the request body echoed, or a greeting when there is none.
/// Each connection serves one response and is then closed.
async fn spawn_http_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (path, body) = read_http_request(&mut socket).await;
                let (status, payload) = if path == "/missing" {
                    ("404 Not Found", b"not found".to_vec())
                } else if body.is_empty() {
                    ("200 OK", b"hello through the tunnel".to_vec())
                } else {
                    ("200 OK", body)
                };
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    payload.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&payload).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });

    addr
}

async fn read_http_request<S>(socket: &mut S) -> (String, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a request");
        data.extend_from_slice(&chunk[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let path = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed in the middle of the body");
        body.extend_from_slice(&chunk[..n]);
    }
    (path, body)
}

/// HTTPS server for `localhost` with a fresh self-signed certificate,
/// plus a client TLS configuration that trusts only that certificate
async fn spawn_https_server() -> (SocketAddr, Arc<rustls::ClientConfig>) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let cert_der = cert.der().to_vec();

    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert_der.clone())],
            rustls::PrivateKey(key_pair.serialize_der()),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let mut roots = rustls::RootCertStore::empty();
    roots.add(&rustls::Certificate(cert_der)).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let mut tls = acceptor.accept(socket).await.unwrap();
                read_http_request(&mut tls).await;
                let payload = b"hello over tls";
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    payload.len()
                );
                tls.write_all(head.as_bytes()).await.unwrap();
                tls.write_all(payload).await.unwrap();
                tls.shutdown().await.unwrap();
            });
        }
    });

    (addr, Arc::new(client_config))
}

fn local_config() -> ServerConfig {
    ServerConfig {
        bind_host: Ipv4Addr::LOCALHOST.into(),
        port: 0,
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> (SocksServer, SocketAddr, broadcast::Receiver<ServerEvent>) {
    let mut server = SocksServer::new(config);
    let events = server.subscribe();
    let addr = server.start().await.unwrap();
    (server, addr, events)
}

async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

/// Port with nothing listening on it
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_send_buffer_status_handling() {
    let http = spawn_http_server().await;
    let requests = HttpRequests::default();

    let url = format!("http://{}/missing", http);
    let err = requests.get_buffer(&url).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("404"));
    assert!(message.contains(&url));

    let body = requests.get_buffer(&format!("http://{}/", http)).await.unwrap();
    assert_eq!(&body[..], b"hello through the tunnel");
}

#[tokio::test]
async fn test_post_helpers_send_bodies() {
    let http = spawn_http_server().await;
    let requests = HttpRequests::default();
    let url = format!("http://{}/echo", http);

    let text = requests.post_text(&url, "plain body").await.unwrap();
    assert_eq!(text, "plain body");

    let value = serde_json::json!({ "answer": 42 });
    let echoed = requests.post_json(&url, Some(&value)).await.unwrap();
    assert_eq!(echoed, value);

    let built = requests
        .create(url.as_str())
        .method("post")
        .body_text("from the builder")
        .response_text()
        .await
        .unwrap();
    assert_eq!(built, "from the builder");
}

#[tokio::test]
async fn test_http_through_socks_server() {
    let http = spawn_http_server().await;
    let (mut server, proxy, mut events) = start_server(local_config()).await;

    let client = SocksClient::new(format!("socks5://{}", proxy), ClientOptions::default());
    let requests = client.http_requests();
    let body = requests.get_text(&format!("http://{}/", http)).await.unwrap();
    assert_eq!(body, "hello through the tunnel");

    assert!(matches!(next_event(&mut events).await, ServerEvent::Connection { .. }));
    match next_event(&mut events).await {
        ServerEvent::Request { host, port, .. } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, http.port());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(next_event(&mut events).await, ServerEvent::Connected { .. }));

    server.stop().await;
}

#[tokio::test]
async fn test_tunnel_serves_a_single_request() {
    let http = spawn_http_server().await;
    let (mut server, proxy, _events) = start_server(local_config()).await;

    let requests =
        SocksClient::new(format!("socks5://{}", proxy), ClientOptions::default()).http_requests();
    let url = format!("http://{}/", http);
    requests.get_text(&url).await.unwrap();

    let err = requests.get_text(&url).await.unwrap_err();
    assert!(err.to_string().contains("Cannot use this SOCKS client"));

    server.stop().await;
}

#[tokio::test]
async fn test_client_chain_through_two_servers() {
    let http = spawn_http_server().await;
    let (mut exit, exit_addr, mut exit_events) = start_server(local_config()).await;
    let (mut entry, entry_addr, mut entry_events) = start_server(local_config()).await;

    let urls = [
        format!("socks5://{}", exit_addr),
        format!("socks5://{}", entry_addr),
    ];
    let mut chain = SocksClient::create_chain(&urls, ClientOptions::default()).unwrap();
    assert_eq!(chain.chain_len(), 2);

    assert!(chain.connect_socks().await.unwrap());
    assert!(!chain.connect_socks().await.unwrap());
    assert!(chain.connect_host(&format!("http://{}/", http)).await.unwrap());
    assert!(chain.host_connected());

    let socket = chain.socket().unwrap();
    assert_eq!(socket.peer_addr().unwrap(), entry_addr);

    let mut stream = chain.take_socket().unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response)).await.unwrap().unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hello through the tunnel"));

    assert!(matches!(next_event(&mut entry_events).await, ServerEvent::Connection { .. }));
    match next_event(&mut entry_events).await {
        ServerEvent::Request { port, .. } => assert_eq!(port, exit_addr.port()),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(next_event(&mut exit_events).await, ServerEvent::Connection { .. }));
    match next_event(&mut exit_events).await {
        ServerEvent::Request { port, .. } => assert_eq!(port, http.port()),
        other => panic!("unexpected event {:?}", other),
    }

    entry.stop().await;
    exit.stop().await;
}

#[tokio::test]
async fn test_server_forwards_through_chain() {
    let http = spawn_http_server().await;
    let (mut upstream, upstream_addr, mut upstream_events) = start_server(local_config()).await;
    let (mut server, proxy, _events) = start_server(local_config()).await;
    server
        .set_forward_chain(Some(vec![format!("socks5://{}", upstream_addr)]))
        .await
        .unwrap();

    let requests =
        SocksClient::new(format!("socks5://{}", proxy), ClientOptions::default()).http_requests();
    let body = requests.get_text(&format!("http://{}/", http)).await.unwrap();
    assert_eq!(body, "hello through the tunnel");

    assert!(matches!(next_event(&mut upstream_events).await, ServerEvent::Connection { .. }));
    match next_event(&mut upstream_events).await {
        ServerEvent::Request { host, port, .. } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, http.port());
        }
        other => panic!("unexpected event {:?}", other),
    }

    server.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn test_unreachable_destination_gets_general_failure() {
    let (mut server, proxy, mut events) = start_server(local_config()).await;
    let port = closed_port().await;

    let mut socket = TcpStream::connect(proxy).await.unwrap();
    socket.write_all(&[5, 1, 0]).await.unwrap();
    let mut hello = [0u8; 2];
    socket.read_exact(&mut hello).await.unwrap();
    assert_eq!(hello, [5, 0]);

    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    socket.write_all(&request).await.unwrap();

    let mut rest = Vec::new();
    timeout(WAIT, socket.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(rest, vec![5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);

    let mut saw_error = false;
    for _ in 0..3 {
        if let ServerEvent::ConnectError { .. } = next_event(&mut events).await {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);

    server.stop().await;
}

#[tokio::test]
async fn test_client_reports_rejection_and_closes() {
    let (mut server, proxy, _events) = start_server(local_config()).await;
    let port = closed_port().await;

    let mut client = SocksClient::new(format!("socks5://{}", proxy), ClientOptions::default());
    assert!(client.connect_socks().await.unwrap());

    let url = format!("http://127.0.0.1:{}/", port);
    let err = client.connect_host(&url).await.unwrap_err();
    match err {
        ProxyError::Rejected { destination, code } => {
            assert_eq!(destination, url);
            assert_eq!(code, 1);
        }
        other => panic!("unexpected error {}", other),
    }
    assert!(!client.socks_connected());
    assert!(!client.host_connected());
    assert!(client.socket().is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_version_hello_gets_no_reply() {
    let (mut server, proxy, _events) = start_server(local_config()).await;

    let mut socket = TcpStream::connect(proxy).await.unwrap();
    socket.write_all(&[4, 1, 0]).await.unwrap();

    let mut rest = Vec::new();
    timeout(WAIT, socket.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
    let (mut server, proxy, _events) = start_server(local_config()).await;
    assert!(server.is_running());

    server.stop().await;
    assert!(!server.is_running());
    assert!(TcpStream::connect(proxy).await.is_err());
}

#[tokio::test]
async fn test_bind_error_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ServerConfig {
        port: taken.local_addr().unwrap().port(),
        ..local_config()
    };

    let mut server = SocksServer::new(config);
    assert!(matches!(server.start().await, Err(ProxyError::Io(_))));
}

#[tokio::test]
async fn test_https_through_socks_tunnel() {
    let (https, tls_config) = spawn_https_server().await;
    let config = ServerConfig {
        dns: DnsStrategy::System,
        ..local_config()
    };
    let (mut server, proxy, mut events) = start_server(config).await;

    let requests = SocksClient::new(format!("socks5://{}", proxy), ClientOptions::default())
        .http_requests()
        .with_tls_config(tls_config);
    let body = requests
        .get_text(&format!("https://localhost:{}/", https.port()))
        .await
        .unwrap();
    assert_eq!(body, "hello over tls");

    assert!(matches!(next_event(&mut events).await, ServerEvent::Connection { .. }));
    match next_event(&mut events).await {
        ServerEvent::Request { host, port, .. } => {
            assert_eq!(host, "localhost");
            assert_eq!(port, https.port());
        }
        other => panic!("unexpected event {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_exchange_timeout_closes_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_http_request(&mut socket).await;
        let mut rest = Vec::new();
        let eof = matches!(socket.read_to_end(&mut rest).await, Ok(0));
        let _ = closed_tx.send(eof);
    });

    let options = SendOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let err = HttpRequests::default()
        .send_buffer(&format!("http://{}/slow", addr), "GET", None, None, &options)
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    assert!(timeout(WAIT, closed_rx).await.unwrap().unwrap());
}
