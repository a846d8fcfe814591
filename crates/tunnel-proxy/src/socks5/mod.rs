//! SOCKS5 (RFC 1928) client, server and wire codec.
//!
//! Only the "no authentication" method and the CONNECT command are
//! supported.

mod client;
mod protocol;
mod server;

pub use client::{SocksClient, SocksTunnel};
pub use protocol::{
    encode_connect, encode_reply, hello_request, parse_hello, parse_request, read_reply,
    ConnectReply, ParsedRequest, TargetAddr, HELLO_REPLY,
};
pub use server::{ServerEvent, SocksServer};

/// Protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// The only authentication method offered or accepted
pub const METHOD_NO_AUTH: u8 = 0x00;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            0x03 => Some(Self::UdpAssociate),
            _ => None,
        }
    }
}

/// SOCKS5 address type
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum AddressType {
    IPv4 = 0x01,
    Domain = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IPv4),
            0x03 => Some(Self::Domain),
            0x04 => Some(Self::IPv6),
            _ => None,
        }
    }
}

/// SOCKS5 reply code
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::GeneralFailure),
            0x02 => Some(Self::ConnectionNotAllowed),
            0x03 => Some(Self::NetworkUnreachable),
            0x04 => Some(Self::HostUnreachable),
            0x05 => Some(Self::ConnectionRefused),
            0x06 => Some(Self::TtlExpired),
            0x07 => Some(Self::CommandNotSupported),
            0x08 => Some(Self::AddressTypeNotSupported),
            _ => None,
        }
    }
}
