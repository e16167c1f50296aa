//! Endpoint addressing for configured targets and allow-lists.
//!
//! A [`SocketEndpoint`] names a remote host/port together with the weight and
//! priority used by the selection strategies. Live connections are tagged
//! with the endpoint they were matched against.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Configured endpoint: host, port, weight and priority.
///
/// Weight and priority are fixed for the lifetime of the endpoint. A port of
/// `0` in an allow-list entry matches any remote port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketEndpoint {
    host: String,
    port: u16,
    weight: u32,
    priority: u32,
}

impl SocketEndpoint {
    /// Create an endpoint with weight 1 and priority 0.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            priority: 0,
        }
    }

    /// Endpoint derived from a live socket address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// Set selection weight (clamped to at least 1).
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Set priority tier. Larger values are preferred.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Parse an endpoint string.
    ///
    /// Supported formats:
    /// - `tcp://10.0.0.1:6000`
    /// - `tcp://10.0.0.1:6000?weight=3&priority=1`
    /// - `10.0.0.1:6000` (scheme optional)
    ///
    /// # Examples
    ///
    /// ```
    /// use isoswitch_core::endpoint::SocketEndpoint;
    ///
    /// let ep = SocketEndpoint::parse("tcp://10.0.0.1:6000?weight=3").unwrap();
    /// assert_eq!(ep.port(), 6000);
    /// assert_eq!(ep.weight(), 3);
    /// assert_eq!(ep.priority(), 0);
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    /// Index key (`host:port`) used by the connection pool.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this endpoint's host names the given address.
    ///
    /// Hosts that parse as IP addresses are compared numerically, so
    /// `::ffff:10.0.0.1` and `10.0.0.1` are treated alike.
    pub fn host_matches(&self, ip: IpAddr) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(host_ip) => canonical(host_ip) == canonical(ip),
            Err(_) => self.host == ip.to_string(),
        }
    }

    /// Whether a remote address is admitted by this allow-list entry.
    ///
    /// Port 0 admits any remote port.
    pub fn admits(&self, remote: SocketAddr) -> bool {
        self.host_matches(remote.ip()) && (self.port == 0 || self.port == remote.port())
    }

    /// Whether this endpoint names exactly the given socket address.
    pub fn matches_addr(&self, addr: SocketAddr) -> bool {
        self.port == addr.port() && self.host_matches(addr.ip())
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Whether a configured listen host accepts traffic bound to `ip`.
pub fn listen_host_matches(host: &str, ip: IpAddr) -> bool {
    match host {
        "" | "*" | "0.0.0.0" | "::" | "[::]" => true,
        other => SocketEndpoint::new(other, 0).host_matches(ip),
    }
}

impl FromStr for SocketEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("tcp://").unwrap_or(s);
        if rest.contains("://") {
            return Err(EndpointError::InvalidScheme(s.to_string()));
        }

        let (addr, query) = match rest.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (rest, None),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::InvalidAddress(addr.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(EndpointError::InvalidAddress(addr.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidAddress(addr.to_string()))?;

        let mut endpoint = Self::new(host, port);

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| EndpointError::InvalidParameter(pair.to_string()))?;
            let value = value
                .parse::<u32>()
                .map_err(|_| EndpointError::InvalidParameter(pair.to_string()))?;
            match name {
                "weight" => endpoint = endpoint.with_weight(value),
                "priority" => endpoint = endpoint.with_priority(value),
                _ => return Err(EndpointError::InvalidParameter(pair.to_string())),
            }
        }

        Ok(endpoint)
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp://)")]
    InvalidScheme(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid endpoint parameter: {0}")]
    InvalidParameter(String),
}

/// Remote endpoint allow-list applied by a connection pool.
///
/// An empty list admits every remote. Entries may pin a remote port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    entries: Vec<SocketEndpoint>,
}

impl AccessList {
    /// Allow-list that admits everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Allow-list for a listener pool (host and optional port).
    pub fn for_listener(entries: Vec<SocketEndpoint>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[SocketEndpoint] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the endpoint a remote address is admitted as.
    ///
    /// Returns `None` when the remote is not allowed. With an empty list the
    /// remote is admitted as itself with default weight and priority.
    pub fn resolve(&self, remote: SocketAddr) -> Option<SocketEndpoint> {
        if self.entries.is_empty() {
            return Some(SocketEndpoint::from_addr(remote));
        }
        self.entries
            .iter()
            .find(|entry| entry.admits(remote))
            .cloned()
    }
}
