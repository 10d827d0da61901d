//! Peer addresses and per-peer connections.
//!
//! A [`Connection`] speaks Bitcoin P2P framing over one of several
//! transports (TCP, in-process, or an accepted inbound stream) and reports
//! decoded messages to the pool as [`PeerEvent`]s.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use bitcoin::p2p::{message::NetworkMessage, ServiceFlags};

use crate::{error::DecodeError, types::PeerId};

pub mod connection;
pub mod frame;
pub mod inproc;

pub use connection::{Connection, Listener, Stream};
pub use inproc::InprocHub;

/// Application protocol spoken on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Public Bitcoin P2P nodes.
    Bitcoin,
    /// Relay nodes run alongside this node (same framing, trusted to serve filters).
    Relay,
}

/// How bytes reach the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Raw stream socket.
    Tcp,
    /// In-process message bus endpoint.
    Inproc,
}

/// Address family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4 host.
    Ipv4,
    /// IPv6 host.
    Ipv6,
    /// Named in-process endpoint.
    Inproc,
}

/// Where a peer lives. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    protocol: Protocol,
    transport: Transport,
    family: Family,
    host: String,
    port: u16,
    services: ServiceFlags,
}

impl PeerAddress {
    /// A TCP peer.
    pub fn tcp(protocol: Protocol, socket: SocketAddr, services: ServiceFlags) -> Self {
        let family = match socket.ip() {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        };
        Self {
            protocol,
            transport: Transport::Tcp,
            family,
            host: socket.ip().to_string(),
            port: socket.port(),
            services,
        }
    }

    /// An in-process peer reachable at endpoint `name`.
    pub fn inproc(protocol: Protocol, name: impl Into<String>, services: ServiceFlags) -> Self {
        Self {
            protocol,
            transport: Transport::Inproc,
            family: Family::Inproc,
            host: name.into(),
            port: 0,
            services,
        }
    }

    /// Same address advertising different services.
    pub fn with_services(&self, services: ServiceFlags) -> Self {
        Self {
            services,
            ..self.clone()
        }
    }

    /// Application protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Transport.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Address family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Host (IP literal or endpoint name).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port; zero for in-process endpoints.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Advertised services.
    pub fn services(&self) -> ServiceFlags {
        self.services
    }

    /// Whether this is an in-process endpoint.
    pub fn is_inproc(&self) -> bool {
        self.transport == Transport::Inproc
    }

    /// Socket address of a TCP peer.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.transport {
            Transport::Tcp => IpAddr::from_str(&self.host)
                .ok()
                .map(|ip| SocketAddr::new(ip, self.port)),
            Transport::Inproc => None,
        }
    }

    /// Identity used to avoid connecting twice to the same peer.
    pub fn key(&self) -> (Transport, &str, u16) {
        (self.transport, &self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::Inproc => write!(f, "inproc://{}", self.host),
            Family::Ipv4 => write!(f, "{}:{}", self.host, self.port),
            Family::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
        }
    }
}

impl FromStr for PeerAddress {
    type Err = DecodeError;

    /// Parses `inproc://name` or `ip:port`; parsed peers speak [`Protocol::Bitcoin`]
    /// and advertise no services until their `version` arrives.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(DecodeError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::inproc(Protocol::Bitcoin, name, ServiceFlags::NONE));
        }
        let socket =
            SocketAddr::from_str(s).map_err(|_| DecodeError::InvalidAddress(s.to_string()))?;
        Ok(Self::tcp(Protocol::Bitcoin, socket, ServiceFlags::NONE))
    }
}

/// What a connection reports to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded message.
    Message(PeerId, NetworkMessage),
    /// The connection is gone; the owner tears the peer down.
    Disconnected(PeerId, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        let v4: PeerAddress = "127.0.0.1:8333".parse().unwrap();
        assert_eq!(v4.family(), Family::Ipv4);
        assert_eq!(v4.socket_addr(), Some("127.0.0.1:8333".parse().unwrap()));

        let v6: PeerAddress = "[::1]:18444".parse().unwrap();
        assert_eq!(v6.family(), Family::Ipv6);
        assert_eq!(v6.to_string(), "[::1]:18444");

        let local: PeerAddress = "inproc://relay-0".parse().unwrap();
        assert!(local.is_inproc());
        assert_eq!(local.host(), "relay-0");
        assert_eq!(local.socket_addr(), None);

        assert!("inproc://".parse::<PeerAddress>().is_err());
        assert!("nonsense".parse::<PeerAddress>().is_err());
    }
}
