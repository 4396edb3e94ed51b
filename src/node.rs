//! Endpoint addressing.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// A `{host, service}` pair identifying an endpoint.
///
/// The service is usually a TCP port, but the in-process family accepts any
/// name since nothing is ever resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub host: String,
    pub service: String,
}

impl Node {
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
        }
    }

    /// Parses a `host:service` connect string. The last colon separates the
    /// service so bracketed IPv6 hosts survive.
    pub fn parse(connect_string: &str) -> io::Result<Node> {
        let (host, service) = connect_string.rsplit_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Node must be of form host:service")
        })?;
        if host.is_empty() || service.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Incomplete node connect string '{connect_string}'"),
            ));
        }
        Ok(Node::new(host.trim_start_matches('[').trim_end_matches(']'), service))
    }

    pub fn connect_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.service)
        } else {
            format!("{}:{}", self.host, self.service)
        }
    }

    /// Resolves the node to socket addresses, in resolver order.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self.connect_string().to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{self} did not resolve to any address"),
            ));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Node {
    fn from(addr: SocketAddr) -> Self {
        Node::new(addr.ip().to_string(), addr.port().to_string())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connect_string())
    }
}
