use crate::error::Result;
use crate::types::AddressFamily;
use std::net::IpAddr;

/// Installs the routes that steer mapped traffic into the translator.
///
/// Implementations talk to the host routing table. The translator only
/// decides what to install; how it is installed is up to the router.
pub trait Router: Send {
    /// Route a single address (/32 or /128) to the translator interface.
    fn add_host_route(&mut self, addr: IpAddr) -> Result<()>;

    /// Route a prefix to the translator interface.
    fn add_network_route(&mut self, prefix: IpAddr, prefix_len: u8) -> Result<()>;

    /// Add a policy rule so that traffic for `addr/prefix_len` is looked up
    /// in the translator's routing table.
    fn add_policy_rule(&mut self, addr: IpAddr, prefix_len: u8) -> Result<()>;

    /// Remove everything this router installed for `family`.
    fn remove_all(&mut self, family: AddressFamily) -> Result<()>;
}

impl<R: Router + ?Sized> Router for Box<R> {
    fn add_host_route(&mut self, addr: IpAddr) -> Result<()> {
        (**self).add_host_route(addr)
    }

    fn add_network_route(&mut self, prefix: IpAddr, prefix_len: u8) -> Result<()> {
        (**self).add_network_route(prefix, prefix_len)
    }

    fn add_policy_rule(&mut self, addr: IpAddr, prefix_len: u8) -> Result<()> {
        (**self).add_policy_rule(addr, prefix_len)
    }

    fn remove_all(&mut self, family: AddressFamily) -> Result<()> {
        (**self).remove_all(family)
    }
}
