use std::fmt;
use std::net::IpAddr;

/// Ethertype carried in the Linux tun packet-information header for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Ethertype carried in the Linux tun packet-information header for IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Network-layer family of a packet or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn ethertype(self) -> u16 {
        match self {
            AddressFamily::Inet => ETHERTYPE_IPV4,
            AddressFamily::Inet6 => ETHERTYPE_IPV6,
        }
    }

    pub fn from_ethertype(ethertype: u16) -> Option<Self> {
        match ethertype {
            ETHERTYPE_IPV4 => Some(AddressFamily::Inet),
            ETHERTYPE_IPV6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    /// Host route prefix length for this family (32 or 128).
    pub fn host_prefix_len(self) -> u8 {
        match self {
            AddressFamily::Inet => 32,
            AddressFamily::Inet6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
        }
    }
}
