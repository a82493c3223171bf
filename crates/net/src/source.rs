use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Port used when connecting the lookup socket. Nothing is ever sent.
const LOOKUP_PORT: u16 = 9;

/// Picks the local address used as the source of generated ICMP notices.
pub trait SourceAddressSelector: Send {
    fn select(&mut self, dst: IpAddr) -> io::Result<IpAddr>;
}

/// Asks the kernel which source address it would use towards a
/// destination, by connecting an unbound UDP socket and reading back its
/// local address.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSourceSelector;

impl SourceAddressSelector for KernelSourceSelector {
    fn select(&mut self, dst: IpAddr) -> io::Result<IpAddr> {
        let target = SocketAddr::new(dst, LOOKUP_PORT);
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
        socket.connect(&SockAddr::from(target))?;
        socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no local address"))
    }
}

/// Always answers with a fixed address per family.
#[derive(Debug, Clone, Copy)]
pub struct FixedSourceSelector {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

impl SourceAddressSelector for FixedSourceSelector {
    fn select(&mut self, dst: IpAddr) -> io::Result<IpAddr> {
        Ok(match dst {
            IpAddr::V4(_) => IpAddr::V4(self.ipv4),
            IpAddr::V6(_) => IpAddr::V6(self.ipv6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_selector_uses_loopback_for_loopback() {
        let mut selector = KernelSourceSelector;
        let selected = selector.select(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(selected, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn fixed_selector_matches_family() {
        let mut selector = FixedSourceSelector {
            ipv4: Ipv4Addr::new(192, 0, 2, 254),
            ipv6: "2001:db8::fe".parse().unwrap(),
        };
        assert_eq!(
            selector.select(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))).unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 254))
        );
        assert!(selector.select(IpAddr::V6(Ipv6Addr::LOCALHOST)).unwrap().is_ipv6());
    }
}
