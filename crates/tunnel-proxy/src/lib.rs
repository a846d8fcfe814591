//! SOCKS5 proxying with chain support and a transport-pluggable HTTP client
//!
//! This crate provides a SOCKS5 client that can be chained through any
//! number of proxies, a SOCKS5 server that optionally forwards through such
//! a chain, and an HTTP/HTTPS request engine whose connections can be
//! supplied by a SOCKS tunnel instead of a direct dial.

pub mod config;
pub mod error;
pub mod http;
pub mod socks5;
pub mod tunnel;

pub use config::{ClientOptions, ServerConfig, TimeoutConfig};
pub use error::{ProxyError, Result};
pub use http::{HttpRequests, HttpResponse, RequestBuilder, Scheme, TransportProvider};
pub use socks5::{ServerEvent, SocksClient, SocksServer, SocksTunnel};
pub use tunnel_net::DnsStrategy;
