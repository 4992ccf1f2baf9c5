//! NIC-bound UDP socket construction.
//!
//! Responders listen on the wildcard address but bind to a specific NIC
//! (SO_BINDTODEVICE) so the kernel only delivers packets arriving on that
//! interface. The v6 socket additionally joins the
//! All_DHCP_Relay_Agents_and_Servers multicast group on the NIC.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tokio::net::UdpSocket;

use crate::error::{DhcpError, Result};

pub const DHCPV4_SERVER_PORT: u16 = 67;
pub const DHCPV4_CLIENT_PORT: u16 = 68;
pub const DHCPV6_SERVER_PORT: u16 = 547;

/// ff02::1:2, the well-known DHCPv6 servers-and-relays group.
const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x2);

fn bind_failed(addr: SocketAddr, nic: &str) -> impl FnOnce(std::io::Error) -> DhcpError + '_ {
    move |source| DhcpError::BindFailed {
        addr,
        nic: nic.to_string(),
        source,
    }
}

/// Bind `0.0.0.0:67` scoped to `nic`, broadcast-capable.
///
/// The wildcard bind is required: discovers are broadcast and would not
/// reach a socket bound to the interface address.
pub fn bind_v4(nic: &str) -> Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCPV4_SERVER_PORT);
    let err = bind_failed(addr.into(), nic);

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(err)?;

    let err = bind_failed(addr.into(), nic);
    socket.set_reuse_address(true).ok();
    socket.set_broadcast(true).ok();
    socket.bind_device(Some(nic.as_bytes())).map_err(err)?;

    let err = bind_failed(addr.into(), nic);
    socket.bind(&addr.into()).map_err(err)?;

    let err = bind_failed(addr.into(), nic);
    socket.set_nonblocking(true).map_err(err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed(addr.into(), nic))
}

/// Bind `[::]:547` scoped to `nic` and join ff02::1:2 on its ifindex.
pub fn bind_v6(nic: &str) -> Result<UdpSocket> {
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, DHCPV6_SERVER_PORT, 0, 0);
    let err = bind_failed(addr.into(), nic);

    let socket = socket2::Socket::new(
        socket2::Domain::IPV6,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(err)?;

    let err = bind_failed(addr.into(), nic);
    socket.set_reuse_address(true).ok();
    socket.set_only_v6(true).ok();
    socket.bind_device(Some(nic.as_bytes())).map_err(err)?;

    let index = nix::net::if_::if_nametoindex(nic)
        .map_err(|errno| bind_failed(addr.into(), nic)(std::io::Error::from(errno)))?;
    let err = bind_failed(addr.into(), nic);
    socket.join_multicast_v6(&ALL_DHCP_SERVERS, index).map_err(err)?;

    let err = bind_failed(addr.into(), nic);
    socket.bind(&addr.into()).map_err(err)?;

    let err = bind_failed(addr.into(), nic);
    socket.set_nonblocking(true).map_err(err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed(addr.into(), nic))
}
