//! Networking primitives shared by the tunnel proxy: URL parsing, the
//! scheme→port table, dual-stack hostname resolution, deadlines and
//! direct TCP dialing.

pub mod deadline;
pub mod dial;
pub mod dns;
pub mod error;
pub mod uri;

pub use deadline::{sleep, with_timeout, DEFAULT_TIMEOUT};
pub use dial::dial;
pub use dns::{DnsStrategy, Resolver};
pub use error::{NetError, Result};
pub use uri::{default_port, parse_query, parse_url, ParsedUrl};
