//! The reply path: encodes the synthesized packet into a pooled
//! buffer and routes it out the right socket.
//!
//! Destination rule: a relayed request goes back to the relay on the
//! server port; a client with the broadcast flag set, or without an
//! address yet, gets a limited broadcast; everyone else is unicast
//! on the client port.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::core::packet::DhcpV4Packet;

use super::capture::{CLIENT_PORT, SERVER_PORT};

/// Where the reply to `request` must go.
pub fn reply_destination(request: &DhcpV4Packet) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, SERVER_PORT)
    } else if request.broadcast() || request.ciaddr.is_unspecified() {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
    } else {
        SocketAddrV4::new(request.ciaddr, CLIENT_PORT)
    }
}

/// The outbound seam, mirroring [`PacketSource`] on the way in.
///
/// [`PacketSource`]: super::capture::PacketSource
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(
        &self,
        frame: &[u8],
        destination: SocketAddrV4,
        interface: Option<&str>,
    ) -> std::io::Result<usize>;
}

/// Sends through a per-interface socket when the capture layer knows
/// the interface, else through the fallback socket.
pub struct UdpReplySink {
    per_interface: HashMap<String, Arc<UdpSocket>>,
    fallback: Arc<UdpSocket>,
}

impl UdpReplySink {
    /// Portable profile: replies leave through the shared wildcard
    /// socket.
    pub fn shared(socket: Arc<UdpSocket>) -> Self {
        Self {
            per_interface: HashMap::new(),
            fallback: socket,
        }
    }

    /// Raw profile: one send socket per interface, each bound to its
    /// device so broadcasts leave on the right wire.
    pub fn per_interface(interfaces: &[String]) -> std::io::Result<Self> {
        let mut per_interface = HashMap::new();
        for name in interfaces {
            per_interface.insert(name.clone(), open_send_socket(Some(name))?);
        }
        Ok(Self {
            per_interface,
            fallback: open_send_socket(None)?,
        })
    }
}

#[async_trait]
impl ReplySink for UdpReplySink {
    async fn send(
        &self,
        frame: &[u8],
        destination: SocketAddrV4,
        interface: Option<&str>,
    ) -> std::io::Result<usize> {
        let socket = interface
            .and_then(|name| self.per_interface.get(name))
            .unwrap_or(&self.fallback);
        socket.send_to(frame, SocketAddr::V4(destination)).await
    }
}

fn open_send_socket(interface: Option<&str>) -> std::io::Result<Arc<UdpSocket>> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    #[cfg(target_os = "linux")]
    if let Some(name) = interface {
        socket.bind_device(Some(name.as_bytes()))?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = interface;
    let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SERVER_PORT).into();
    socket.bind(&bind.into())?;
    Ok(Arc::new(UdpSocket::from_std(socket.into())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::FLAG_BROADCAST;

    fn request() -> DhcpV4Packet {
        let raw = crate::core::packet::build_request(
            [1, 2, 3, 4],
            crate::core::packet::HardwareAddress::new([0xAA, 0, 0, 0, 0, 1]),
            &[(crate::core::options::codes::MESSAGE_TYPE, vec![1])],
        );
        DhcpV4Packet::decode(&raw).unwrap()
    }

    #[test]
    fn relayed_requests_go_to_the_relay() {
        let mut req = request();
        req.giaddr = "10.0.1.1".parse().unwrap();
        req.ciaddr = "10.0.0.50".parse().unwrap();
        assert_eq!(
            reply_destination(&req),
            SocketAddrV4::new("10.0.1.1".parse().unwrap(), 67)
        );
    }

    #[test]
    fn broadcast_flag_forces_broadcast() {
        let mut req = request();
        req.flags = FLAG_BROADCAST;
        req.ciaddr = "10.0.0.50".parse().unwrap();
        assert_eq!(
            reply_destination(&req),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)
        );
    }

    #[test]
    fn addressless_clients_get_broadcast() {
        let req = request();
        assert_eq!(
            reply_destination(&req),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)
        );
    }

    #[test]
    fn renewing_clients_get_unicast() {
        let mut req = request();
        req.ciaddr = "10.0.0.50".parse().unwrap();
        assert_eq!(
            reply_destination(&req),
            SocketAddrV4::new("10.0.0.50".parse().unwrap(), 68)
        );
    }
}
