use crate::ptp::{PtpPort, PTP_PRIMARY_MULTICAST};
use crate::traits::PtpNetwork;
use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};

/// Pick the IPv4 address to join multicast on: the named interface if given,
/// otherwise the first non-loopback interface with an IPv4 address.
pub fn interface_ip(name: Option<&str>) -> Result<Ipv4Addr> {
    let ifaces = if_addrs::get_if_addrs()?;

    for iface in &ifaces {
        if iface.is_loopback() {
            continue;
        }
        if let Some(want) = name {
            if iface.name != want {
                continue;
            }
        }
        if let IpAddr::V4(ip) = iface.ip() {
            log::debug!("using interface {} ({})", iface.name, ip);
            return Ok(ip);
        }
    }

    match name {
        Some(n) => Err(anyhow!("no usable IPv4 address on interface '{}'", n)),
        None => Err(anyhow!("no usable IPv4 network interface found")),
    }
}

fn create_multicast_socket(port: u16, interface_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    let group = Ipv4Addr::from(PTP_PRIMARY_MULTICAST);
    socket.join_multicast_v4(&group, &interface_ip)?;

    socket.set_multicast_loop_v4(false)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// The real two-socket transport: event on 319, general on 320.
pub struct MulticastPtpNetwork {
    interface_ip: Ipv4Addr,
    sock_event: Option<UdpSocket>,
    sock_general: Option<UdpSocket>,
}

impl MulticastPtpNetwork {
    pub fn new(interface_ip: Ipv4Addr) -> Self {
        MulticastPtpNetwork {
            interface_ip,
            sock_event: None,
            sock_general: None,
        }
    }
}

impl PtpNetwork for MulticastPtpNetwork {
    fn open(&mut self) -> Result<()> {
        // all-or-nothing: both sockets are kept only if both joins succeed
        let event = create_multicast_socket(PtpPort::Event.number(), self.interface_ip)?;
        let general = create_multicast_socket(PtpPort::General.number(), self.interface_ip)?;

        self.sock_event = Some(event);
        self.sock_general = Some(general);
        Ok(())
    }

    fn close(&mut self) {
        self.sock_event = None;
        self.sock_general = None;
    }

    fn recv(&mut self, port: PtpPort, buf: &mut [u8]) -> Result<Option<usize>> {
        let sock = match port {
            PtpPort::Event => self.sock_event.as_ref(),
            PtpPort::General => self.sock_general.as_ref(),
        };
        let sock = match sock {
            Some(s) => s,
            None => return Ok(None),
        };

        match sock.recv_from(buf) {
            Ok((len, _addr)) => Ok(Some(len)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
