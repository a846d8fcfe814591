//! URL decomposition per RFC 3986 appendix B.

use crate::error::{NetError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Well-known ports, consulted when a URL carries no explicit port.
const SCHEME_PORTS: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("whois", 43),
    ("dns", 53),
    ("http", 80),
    ("ws", 80),
    ("pop2", 109),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("https", 443),
    ("wss", 443),
    ("ftps", 990),
    ("imaps", 993),
    ("pop3s", 995),
    ("socks", 1080),
    ("socks4", 1080),
    ("socks5", 1080),
];

/// Components of a parsed URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUrl {
    pub scheme: String,
    pub userinfo: String,
    /// Host without the brackets of an IPv6 literal
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl ParsedUrl {
    /// Port of the URL, failing when neither explicit nor known for the scheme
    pub fn require_port(&self) -> Result<u16> {
        self.port.ok_or_else(|| {
            NetError::MissingPort(format!("{}://{}", self.scheme, self.host))
        })
    }

    /// Path plus `?query` when a query is present
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// Default port for a scheme, case-insensitive.
pub fn default_port(scheme: &str) -> Option<u16> {
    let scheme = scheme.to_ascii_lowercase();
    SCHEME_PORTS
        .iter()
        .find(|(name, _)| *name == scheme)
        .map(|(_, port)| *port)
}

fn url_regex() -> &'static Regex {
    static URL_REGEX: OnceLock<Regex> = OnceLock::new();
    URL_REGEX.get_or_init(|| {
        Regex::new(r"^(([^:/?#]+):)?(//([^/?#]*))?([^?#]*)(\?([^#]*))?(#(.*))?")
            .expect("static URL pattern is valid")
    })
}

/// Split a URL into its components.
///
/// The port falls back to [`default_port`] when absent or zero. An IPv6
/// host such as `[::1]` is returned without brackets.
pub fn parse_url(url: &str) -> Result<ParsedUrl> {
    let captures = url_regex()
        .captures(url)
        .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
    let group = |i: usize| captures.get(i).map(|m| m.as_str()).unwrap_or("");

    let scheme = group(2).to_string();
    let mut authority = captures
        .get(4)
        .map(|m| m.as_str())
        .ok_or_else(|| NetError::InvalidUrl(format!("{url} has no authority")))?;
    let path = match group(5) {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    let query = group(7).to_string();
    let fragment = group(9).to_string();

    let userinfo = match authority.split_once('@') {
        Some((info, rest)) => {
            authority = rest;
            info.to_string()
        }
        None => String::new(),
    };

    let (host, port_part) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| NetError::InvalidUrl(format!("{url} has an unterminated IPv6 host")))?;
        (host.to_string(), after.strip_prefix(':'))
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host.to_string(), Some(port)),
            None => (authority.to_string(), None),
        }
    };

    let explicit_port = match port_part {
        Some(p) if !p.is_empty() => Some(
            p.parse::<u16>()
                .map_err(|_| NetError::InvalidUrl(format!("{url} has an invalid port '{p}'")))?,
        ),
        _ => None,
    };
    let port = explicit_port.filter(|p| *p != 0).or_else(|| default_port(&scheme));

    Ok(ParsedUrl {
        scheme,
        userinfo,
        host,
        port,
        path,
        query,
        fragment,
    })
}

/// Decode a query string into key/value pairs; pairs with an empty key are skipped.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    ::url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}
