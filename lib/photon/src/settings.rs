//! Connection settings shared by server and client endpoints.

use serde_derive::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Data required to create a connection. The server uses
/// `ip_local`/`port_in`; the client uses `ip_destination`/`port_out` and
/// optionally binds locally through `ip_local`/`port_in`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub ip_local: IpAddr,
    pub ip_destination: Option<IpAddr>,
    pub port_in: u16,
    pub port_out: u16,
}

impl Default for ConnectionSettings {
    fn default() -> ConnectionSettings {
        ConnectionSettings {
            ip_local: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ip_destination: None,
            port_in: 0,
            port_out: 0,
        }
    }
}

impl ConnectionSettings {
    /// Settings for a listening endpoint.
    pub fn listen(ip: IpAddr, port: u16) -> ConnectionSettings {
        ConnectionSettings {
            ip_local: ip,
            port_in: port,
            ..ConnectionSettings::default()
        }
    }

    /// Settings for a connecting endpoint.
    pub fn connect(ip: IpAddr, port: u16) -> ConnectionSettings {
        ConnectionSettings {
            ip_destination: Some(ip),
            port_out: port,
            ..ConnectionSettings::default()
        }
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_local, self.port_in)
    }

    #[inline]
    pub fn destination_addr(&self) -> Option<SocketAddr> {
        self.ip_destination.map(|ip| SocketAddr::new(ip, self.port_out))
    }

    /// True when the local side asks for an explicit bind.
    #[inline]
    pub fn wants_local_bind(&self) -> bool {
        !self.ip_local.is_unspecified() || self.port_in != 0
    }
}
