//! # Node Addressing
//!
//! [`SockAddr`] is a concrete IPv4 endpoint. [`NodeAddress`] is the logical
//! identity of a node: its primary socket address plus an optional proxy (NAT)
//! address through which it can be reached when it is not directly routable.
//!
//! ## Special values
//! - **null**: `0.0.0.0:0`, "no address"
//! - **unroutable**: non-null address with port 0; a connection cannot be
//!   initiated to it (the node sits behind a NAT and must be reached over a
//!   connection it opened itself)

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// Serialized size of a [`SockAddr`] (address + port).
pub const SOCK_ADDR_SIZE: usize = 6;

/// Serialized size of a [`NodeAddress`] (local + proxy).
pub const NODE_ADDRESS_SIZE: usize = 2 * SOCK_ADDR_SIZE;

/// An IPv4 socket address as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SockAddr {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl SockAddr {
    /// The null address.
    pub const NULL: SockAddr = SockAddr {
        addr: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Does not refer to an actual socket address.
    pub fn is_null(&self) -> bool {
        self.addr.is_unspecified() && self.port == 0
    }

    /// A connection cannot be initiated to this address.
    pub fn is_unroutable(&self) -> bool {
        !self.is_null() && self.port == 0
    }

    /// Socket address to dial or bind, with the transport's port offset applied.
    pub fn to_socket_addr(&self, port_offset: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            self.addr,
            self.port.wrapping_add(port_offset),
        ))
    }

    pub(crate) fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32(u32::from(self.addr));
        buf.put_u16(self.port);
    }

    pub(crate) fn get(buf: &mut impl Buf) -> Self {
        let addr = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        Self { addr, port }
    }
}

impl Default for SockAddr {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<SocketAddrV4> for SockAddr {
    fn from(sa: SocketAddrV4) -> Self {
        Self::new(*sa.ip(), sa.port())
    }
}

impl TryFrom<SocketAddr> for SockAddr {
    type Error = TransportError;

    fn try_from(sa: SocketAddr) -> Result<Self> {
        match sa {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Ok(Self::new(ip, v6.port())),
                None => Err(TransportError::ConfigError(format!(
                    "IPv6 address not supported: {sa}"
                ))),
            },
        }
    }
}

impl FromStr for SockAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let sa: SocketAddrV4 = s
            .parse()
            .map_err(|_| TransportError::ConfigError(format!("Invalid IPv4 address: '{s}'")))?;
        Ok(sa.into())
    }
}

/// The routable identity of a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct NodeAddress {
    /// Primary socket address.
    pub local: SockAddr,
    /// Proxy / NAT address, or [`SockAddr::NULL`].
    pub proxy: SockAddr,
}

impl NodeAddress {
    pub const NULL: NodeAddress = NodeAddress {
        local: SockAddr::NULL,
        proxy: SockAddr::NULL,
    };

    pub const fn new(local: SockAddr, proxy: SockAddr) -> Self {
        Self { local, proxy }
    }

    /// A node reachable directly at `local`.
    pub const fn direct(local: SockAddr) -> Self {
        Self {
            local,
            proxy: SockAddr::NULL,
        }
    }

    pub fn is_null(&self) -> bool {
        self.local.is_null() && self.proxy.is_null()
    }

    pub fn is_unroutable(&self) -> bool {
        self.local.is_unroutable()
    }

    /// Same node with the proxy address removed.
    pub fn without_proxy(&self) -> Self {
        Self::direct(self.local)
    }

    pub(crate) fn put(&self, buf: &mut impl BufMut) {
        self.local.put(buf);
        self.proxy.put(buf);
    }

    pub(crate) fn get(buf: &mut impl Buf) -> Self {
        let local = SockAddr::get(buf);
        let proxy = SockAddr::get(buf);
        Self { local, proxy }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.proxy.is_null() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{}/{}", self.local, self.proxy)
        }
    }
}

impl From<SockAddr> for NodeAddress {
    fn from(local: SockAddr) -> Self {
        Self::direct(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_unroutable() {
        assert!(SockAddr::NULL.is_null());
        assert!(!SockAddr::NULL.is_unroutable());

        let natted = SockAddr::new(Ipv4Addr::new(10, 0, 0, 7), 0);
        assert!(!natted.is_null());
        assert!(natted.is_unroutable());

        let normal = SockAddr::new(Ipv4Addr::LOCALHOST, 5377);
        assert!(!normal.is_unroutable());
    }

    #[test]
    fn port_offset_applied_on_dial() {
        let sa = SockAddr::new(Ipv4Addr::LOCALHOST, 5000);
        assert_eq!(sa.to_socket_addr(3).port(), 5003);
    }

    #[test]
    fn parse_and_display() {
        let sa: SockAddr = "192.168.1.4:80".parse().unwrap_or_default();
        assert_eq!(sa.to_string(), "192.168.1.4:80");
        assert!("not-an-address".parse::<SockAddr>().is_err());

        let node = NodeAddress::new(sa, SockAddr::new(Ipv4Addr::new(1, 2, 3, 4), 9));
        assert_eq!(node.to_string(), "192.168.1.4:80/1.2.3.4:9");
        assert_eq!(node.without_proxy().to_string(), "192.168.1.4:80");
    }
}
