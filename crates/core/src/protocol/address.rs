//! IPv4 addressing used by the transport.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::Serialize;

use crate::protocol::TransportError;

/// Address family reported by socket name queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressFamily {
    #[serde(rename = "IPv4")]
    Ipv4,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
        }
    }
}

/// Result of a socket-name or peer-name query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SocketName {
    pub address: Ipv4Addr,
    pub family: AddressFamily,
    pub port: u16,
}

impl SocketName {
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl TryFrom<SocketAddr> for SocketName {
    type Error = TransportError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self { address: *v4.ip(), family: AddressFamily::Ipv4, port: v4.port() }),
            SocketAddr::V6(_) => Err(TransportError::UnsupportedFamily { addr }),
        }
    }
}

impl fmt::Display for SocketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Resolves a dotted-decimal IPv4 string and a port into a socket address.
///
/// No name lookup is performed.
///
/// # Errors
///
/// Returns [`TransportError::Address`] if `ip` is not a dotted-decimal IPv4 address.
pub fn resolve_ipv4(ip: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let address = ip.parse::<Ipv4Addr>().map_err(|_| TransportError::address(ip))?;
    Ok(SocketAddr::V4(SocketAddrV4::new(address, port)))
}
