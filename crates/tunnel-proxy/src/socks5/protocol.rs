//! SOCKS5 wire format: address blocks, hello and CONNECT messages, replies

use super::{AddressType, Command, Reply, METHOD_NO_AUTH, SOCKS_VERSION};
use crate::error::{ProxyError, Result};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Server answer to an accepted hello: version 5, no authentication
pub const HELLO_REPLY: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// Destination of a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    IPv4(Ipv4Addr),
    Domain(String),
    IPv6(Ipv6Addr),
}

impl TargetAddr {
    /// Classify a host string.
    ///
    /// Literal forms win over the domain form so the remote proxy never
    /// resolves an address it was already given: an IPv4 dotted quad first,
    /// then an IPv6 literal (bracketed or bare), otherwise a domain name.
    pub fn from_host(host: &str) -> Result<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(Self::IPv4(ip));
        }

        let unbracketed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = unbracketed.parse::<Ipv6Addr>() {
            return Ok(Self::IPv6(ip));
        }

        if host.is_empty() || host.len() > u8::MAX as usize {
            return Err(ProxyError::socks5(format!(
                "Domain name must be 1 to 255 bytes, got {}",
                host.len()
            )));
        }
        Ok(Self::Domain(host.to_string()))
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Self::IPv4(_) => AddressType::IPv4,
            Self::Domain(_) => AddressType::Domain,
            Self::IPv6(_) => AddressType::IPv6,
        }
    }

    /// Host as it appears in a URL, IPv6 bracketed
    pub fn host(&self) -> String {
        match self {
            Self::IPv4(ip) => ip.to_string(),
            Self::Domain(name) => name.clone(),
            Self::IPv6(ip) => format!("[{}]", ip),
        }
    }

    /// Host as handed to a resolver, IPv6 without brackets
    pub fn dial_host(&self) -> String {
        match self {
            Self::IPv6(ip) => ip.to_string(),
            other => other.host(),
        }
    }

    /// Append ATYP and the address bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.address_type() as u8);
        match self {
            Self::IPv4(ip) => buf.extend_from_slice(&ip.octets()),
            Self::Domain(name) => {
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            Self::IPv6(ip) => buf.extend_from_slice(&ip.octets()),
        }
    }

    /// Decode an address block starting at its ATYP byte.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf
            .first()
            .ok_or_else(|| ProxyError::socks5("Missing address type"))?;
        let truncated = || ProxyError::socks5("Truncated address");

        match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let octets: [u8; 4] = buf.get(1..5).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
                Ok((Self::IPv4(Ipv4Addr::from(octets)), 5))
            }
            Some(AddressType::Domain) => {
                let len = *buf.get(1).ok_or_else(truncated)? as usize;
                if len == 0 {
                    return Err(ProxyError::socks5("Empty domain name"));
                }
                let name = buf.get(2..2 + len).ok_or_else(truncated)?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| ProxyError::socks5("Invalid domain encoding"))?;
                Ok((Self::Domain(name.to_string()), 2 + len))
            }
            Some(AddressType::IPv6) => {
                let octets: [u8; 16] = buf.get(1..17).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
                Ok((Self::IPv6(Ipv6Addr::from(octets)), 17))
            }
            None => Err(ProxyError::socks5(format!("Invalid address type: {}", atyp))),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host())
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => Self::IPv4(*addr.ip()),
            SocketAddr::V6(addr) => Self::IPv6(*addr.ip()),
        }
    }
}

/// Outcome of parsing a request message on the server
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRequest {
    Connect { target: TargetAddr, port: u16 },
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
}

/// Parsed reply to a CONNECT request
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReply {
    pub code: u8,
    /// Bound address, present on success
    pub bound: Option<(TargetAddr, u16)>,
}

/// Client hello: version 5, one method, "no authentication"
pub fn hello_request() -> [u8; 3] {
    [SOCKS_VERSION, 1, METHOD_NO_AUTH]
}

/// Validate a client hello. Anything but `[5, 1, 0]` is fatal.
pub fn parse_hello(data: &[u8]) -> Result<()> {
    if data.len() < 3 {
        return Err(ProxyError::socks5(format!("Truncated hello of {} bytes", data.len())));
    }
    if data[0] != SOCKS_VERSION {
        return Err(ProxyError::socks5(format!("Unsupported SOCKS version: {}", data[0])));
    }
    if data[1] != 1 {
        return Err(ProxyError::socks5(format!("Unsupported number of methods: {}", data[1])));
    }
    if data[2] != METHOD_NO_AUTH {
        return Err(ProxyError::socks5(format!("Unsupported method: {}", data[2])));
    }
    if data.len() > 3 {
        return Err(ProxyError::socks5(format!(
            "Unexpected {} bytes after hello; requests must wait for the hello reply",
            data.len() - 3
        )));
    }
    Ok(())
}

/// Build a CONNECT request: `[5, 1, 0]`, address block, big-endian port
pub fn encode_connect(target: &TargetAddr, port: u16) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, Command::Connect as u8, 0x00];
    target.encode_into(&mut buf);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Parse a complete request message.
///
/// Unsupported commands and address types are reported as outcomes so
/// the caller can answer with the matching reply code; malformed
/// messages are errors.
pub fn parse_request(data: &[u8]) -> Result<ParsedRequest> {
    if data.len() < 4 {
        return Err(ProxyError::socks5(format!("Truncated request of {} bytes", data.len())));
    }
    if data[0] != SOCKS_VERSION {
        return Err(ProxyError::socks5(format!("Invalid SOCKS version: {}", data[0])));
    }
    if Command::from_byte(data[1]) != Some(Command::Connect) {
        return Ok(ParsedRequest::UnsupportedCommand(data[1]));
    }
    if AddressType::from_byte(data[3]).is_none() {
        return Ok(ParsedRequest::UnsupportedAddressType(data[3]));
    }

    let (target, consumed) = TargetAddr::decode(&data[3..])?;
    let port_at = 3 + consumed;
    if data.len() != port_at + 2 {
        return Err(ProxyError::socks5(format!(
            "Request length mismatch: expected {} bytes, got {}",
            port_at + 2,
            data.len()
        )));
    }
    let port = u16::from_be_bytes([data[port_at], data[port_at + 1]]);

    Ok(ParsedRequest::Connect { target, port })
}

/// Build a reply carrying `bound` as BND.ADDR and BND.PORT
pub fn encode_reply(reply: Reply, bound: SocketAddr) -> Vec<u8> {
    let mut response = vec![SOCKS_VERSION, reply as u8, 0x00];
    TargetAddr::from(bound).encode_into(&mut response);
    response.extend_from_slice(&bound.port().to_be_bytes());
    response
}

/// Read a reply to a CONNECT request.
///
/// A failure is reported as soon as VER and REP arrive, since a rejecting
/// proxy may send a truncated reply or none of the rest. On success the
/// bound address is consumed in full so no tunneled byte is swallowed.
pub async fn read_reply<S>(stream: &mut S) -> Result<ConnectReply>
where
    S: AsyncRead + Unpin,
{
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;

    if status[0] != SOCKS_VERSION {
        return Err(ProxyError::socks5(format!("Invalid SOCKS version in reply: {}", status[0])));
    }
    let code = status[1];
    if code != Reply::Success as u8 {
        return Ok(ConnectReply { code, bound: None });
    }

    // RSV, ATYP
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    let mut block = vec![header[1]];
    match AddressType::from_byte(header[1]) {
        Some(AddressType::IPv4) => block.resize(5, 0),
        Some(AddressType::IPv6) => block.resize(17, 0),
        Some(AddressType::Domain) => {
            let len = stream.read_u8().await?;
            block.push(len);
            block.resize(2 + len as usize, 0);
        }
        None => {
            return Err(ProxyError::socks5(format!(
                "Invalid address type in reply: {}",
                header[1]
            )))
        }
    }
    let filled = if header[1] == AddressType::Domain as u8 { 2 } else { 1 };
    stream.read_exact(&mut block[filled..]).await?;
    let port = stream.read_u16().await?;

    let (address, _) = TargetAddr::decode(&block)?;
    Ok(ConnectReply {
        code,
        bound: Some((address, port)),
    })
}
