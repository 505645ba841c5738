use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Type};
use std::fmt;
use std::net::UdpSocket;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
};

use crate::error::{Error, Result};

/// Multicast group and port a capture listens on or a replay sends to.
///
/// Unicast addresses are accepted as well; no group is joined for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MulticastTarget {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl MulticastTarget {
    /// Validate a group/port pair, rejecting ports that need more than 16 bits
    pub fn new(group: Ipv4Addr, port: u32) -> Result<Self> {
        let port = u16::try_from(port).map_err(|_| Error::InvalidPort(port))?;
        Ok(Self { group, port })
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port)
    }

    pub fn is_multicast(&self) -> bool {
        self.group.is_multicast()
    }
}

impl fmt::Display for MulticastTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.port)
    }
}

impl From<SocketAddrV4> for MulticastTarget {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            group: *addr.ip(),
            port: addr.port(),
        }
    }
}

// this will be common for all our sockets
pub fn new_socket() -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Blocking sockets: the capture worker parks in recv, closing the socket is what wakes it
    socket.set_nonblocking(false)?;
    socket.set_reuse_address(true)?;

    Ok(socket)
}

/// On Windows, unlike all Unix variants, it is improper to bind to the multicast address
///
/// see https://msdn.microsoft.com/en-us/library/windows/desktop/ms737550(v=vs.85).aspx
#[cfg(windows)]
fn bind_to_multicast(
    socket: &socket2::Socket,
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
) -> io::Result<()> {
    socket.join_multicast_v4(addr.ip(), nic_addr)?;

    let socketaddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
    socket.bind(&socket2::SockAddr::from(socketaddr))?;
    log::trace!("Binding multicast socket to {}", socketaddr);

    Ok(())
}

/// On unixes we bind to the multicast address, which causes multicast packets to be filtered
#[cfg(unix)]
fn bind_to_multicast(
    socket: &socket2::Socket,
    addr: &SocketAddrV4,
    nic_addr: &Ipv4Addr,
) -> io::Result<()> {
    // Linux is special, if we don't disable IP_MULTICAST_ALL the kernel forgets on
    // which device the multicast packet arrived and sends it to all sockets.
    #[cfg(target_os = "linux")]
    {
        use std::{mem, os::unix::io::AsRawFd};

        unsafe {
            let optval: libc::c_int = 0;
            let ret = libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_IP,
                libc::IP_MULTICAST_ALL,
                &optval as *const _ as *const libc::c_void,
                mem::size_of_val(&optval) as libc::socklen_t,
            );
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    let socketaddr = SocketAddr::new(IpAddr::V4(*addr.ip()), addr.port());
    socket.bind(&socket2::SockAddr::from(socketaddr))?;

    socket.join_multicast_v4(addr.ip(), nic_addr)?;

    log::trace!(
        "Binding multicast socket to {} for multicast group {} nic {}",
        socketaddr,
        addr.ip(),
        nic_addr
    );

    Ok(())
}

/// Open a blocking receive socket on `addr`.
///
/// Multicast addresses are joined on `nic_addr`; any other address is bound
/// directly, which is how loopback captures work.
pub fn create_udp_listen(addr: &SocketAddrV4, nic_addr: &Ipv4Addr) -> io::Result<UdpSocket> {
    let socket: socket2::Socket = new_socket()?;

    if addr.ip().is_multicast() {
        bind_to_multicast(&socket, addr, nic_addr)?;
    } else {
        socket.bind(&socket2::SockAddr::from(*addr))?;
        log::trace!("Binding socket to {}", addr);
    }

    Ok(socket.into())
}

/// Open a send socket for datagrams to `addr`.
///
/// For a multicast destination the outgoing interface, TTL and loopback are
/// set so that receivers on this host see the traffic too.
pub fn create_udp_send(addr: &SocketAddrV4, nic_addr: &Ipv4Addr, ttl: u32) -> io::Result<UdpSocket> {
    let socket: socket2::Socket = new_socket()?;

    if addr.ip().is_multicast() {
        if !nic_addr.is_unspecified() {
            socket.set_multicast_if_v4(nic_addr)?;
        }
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_multicast_loop_v4(true)?;
    }

    let socketaddr_nic = SocketAddr::new(IpAddr::V4(*nic_addr), 0);
    socket.bind(&socket2::SockAddr::from(socketaddr_nic))?;
    log::trace!("Send socket bound to {} for {}", socketaddr_nic, addr);

    Ok(socket.into())
}

/// Wake any thread blocked on `socket`.
///
/// Errors are ignored: an unconnected UDP socket may report `ENOTCONN` while
/// still waking its readers, and a socket that is already shut down is fine.
pub fn shutdown(socket: &UdpSocket) {
    if let Err(e) = socket2::SockRef::from(socket).shutdown(std::net::Shutdown::Both) {
        log::trace!("Socket shutdown: {}", e);
    }
}

/// IPv4 address of the network interface called `name`
pub fn interface_addr(name: &str) -> Option<Ipv4Addr> {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};

    let interfaces = NetworkInterface::show().ok()?;

    for itf in interfaces.iter().filter(|itf| itf.name == name) {
        for addr in &itf.addr {
            if let IpAddr::V4(nic_ip) = addr.ip() {
                log::debug!("Interface {} has address {}", itf.name, nic_ip);
                return Some(nic_ip);
            }
        }
    }

    None
}

/// Resolve an optional interface name to the address multicast is joined on.
///
/// No name means "let the kernel choose" (`0.0.0.0`).
pub fn resolve_interface(name: Option<&str>) -> Result<Ipv4Addr> {
    match name {
        None => Ok(Ipv4Addr::UNSPECIFIED),
        Some(name) => {
            if let Ok(addr) = name.parse::<Ipv4Addr>() {
                return Ok(addr);
            }
            interface_addr(name).ok_or_else(|| Error::InvalidInterface(name.to_string()))
        }
    }
}
