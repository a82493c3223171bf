//! Static address mapping table.
//!
//! Holds the IPv4↔IPv6 pairs (`map-static`), the IPv6↔IPv6 pairs
//! (`map66-static`) and the /96 prefix used to embed IPv4 sources
//! (`mapping-prefix`). Every address appears in at most one pair of each
//! kind; later duplicates are skipped with a warning.

use map646_core::config::{self, Directive, DirectiveKind, INCLUDE_DEPTH_LIMIT};
use map646_core::{AddressFamily, Error, Router};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{debug, info, warn};

/// Number of leading bits of the mapping prefix. The low 32 bits carry an
/// IPv4 address.
pub const MAPPING_PREFIX_LEN: u8 = 96;

/// Host prefix length used for 6-to-6 policy rules.
const HOST_PREFIX_LEN_V6: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

/// Pair of an internal IPv6 address and the global address it is known by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping66Entry {
    pub internal: Ipv6Addr,
    pub global: Ipv6Addr,
}

/// Translation direction of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FourToSix,
    SixToFour,
    SixToSix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("no mapping for {0}")]
    NoMapping(IpAddr),

    #[error("both {src} and {dst} have 6-to-6 mappings")]
    Ambiguous { src: Ipv6Addr, dst: Ipv6Addr },
}

/// Address mapping table.
#[derive(Debug, Default)]
pub struct MappingTable {
    entries: Vec<MappingEntry>,
    by_ipv4: HashMap<Ipv4Addr, Ipv6Addr>,
    by_ipv6: HashMap<Ipv6Addr, Ipv4Addr>,
    entries66: Vec<Mapping66Entry>,
    /// Both directions of every 6-to-6 pair.
    map66: HashMap<Ipv6Addr, Ipv6Addr>,
    prefix: Option<Ipv6Addr>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load directives into the table.
    ///
    /// Bad lines are skipped with a warning. Only an `include` chain
    /// deeper than [`INCLUDE_DEPTH_LIMIT`] fails the whole load.
    pub fn load(&mut self, directives: &[Directive]) -> Result<(), Error> {
        self.load_nested(directives, 0)
    }

    fn load_nested(&mut self, directives: &[Directive], depth: usize) -> Result<(), Error> {
        for directive in directives {
            match &directive.kind {
                DirectiveKind::MapStatic { ipv4, ipv6 } => {
                    let (Ok(ipv4), Ok(ipv6)) = (ipv4.parse::<Ipv4Addr>(), ipv6.parse::<Ipv6Addr>()) else {
                        warn!("{directive}: invalid address in map-static {ipv4} {ipv6}, skipped");
                        continue;
                    };
                    self.insert(ipv4, ipv6, directive);
                }
                DirectiveKind::Map66Static { internal, global } => {
                    let (Ok(internal), Ok(global)) =
                        (internal.parse::<Ipv6Addr>(), global.parse::<Ipv6Addr>())
                    else {
                        warn!(
                            "{directive}: invalid address in map66-static {internal} {global}, skipped"
                        );
                        continue;
                    };
                    self.insert66(internal, global, directive);
                }
                DirectiveKind::MappingPrefix(prefix) => {
                    let Ok(prefix) = prefix.parse::<Ipv6Addr>() else {
                        warn!("{directive}: invalid mapping prefix {prefix}, skipped");
                        continue;
                    };
                    let masked = mask_prefix(prefix);
                    if masked != prefix {
                        warn!("{directive}: mapping prefix {prefix} truncated to {masked}/96");
                    }
                    self.prefix = Some(masked);
                }
                DirectiveKind::Include(path) => self.include(path, depth + 1)?,
                DirectiveKind::Malformed { keyword, expected } => {
                    warn!("{directive}: {keyword} expects {expected} operand(s), skipped");
                }
                DirectiveKind::Unknown(keyword) => {
                    warn!("{directive}: unknown directive {keyword}, skipped");
                }
            }
        }
        Ok(())
    }

    fn include(&mut self, path: &Path, depth: usize) -> Result<(), Error> {
        if depth > INCLUDE_DEPTH_LIMIT {
            return Err(Error::IncludeDepthExceeded {
                path: path.to_path_buf(),
                limit: INCLUDE_DEPTH_LIMIT,
            });
        }
        match config::read_directives(path) {
            Ok(directives) => {
                debug!("including {} at depth {depth}", path.display());
                self.load_nested(&directives, depth)
            }
            Err(e) => {
                warn!("skipping include: {e}");
                Ok(())
            }
        }
    }

    fn insert(&mut self, ipv4: Ipv4Addr, ipv6: Ipv6Addr, directive: &Directive) {
        if self.by_ipv4.contains_key(&ipv4) || self.by_ipv6.contains_key(&ipv6) {
            warn!("{directive}: duplicate mapping {ipv4} {ipv6}, skipped");
            return;
        }
        self.by_ipv4.insert(ipv4, ipv6);
        self.by_ipv6.insert(ipv6, ipv4);
        self.entries.push(MappingEntry { ipv4, ipv6 });
    }

    fn insert66(&mut self, internal: Ipv6Addr, global: Ipv6Addr, directive: &Directive) {
        if internal == global
            || self.map66.contains_key(&internal)
            || self.map66.contains_key(&global)
        {
            warn!("{directive}: duplicate 6-to-6 mapping {internal} {global}, skipped");
            return;
        }
        self.map66.insert(internal, global);
        self.map66.insert(global, internal);
        self.entries66.push(Mapping66Entry { internal, global });
    }

    /// Drop every mapping and the prefix.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of 4-to-6 plus 6-to-6 pairs.
    pub fn len(&self) -> usize {
        self.entries.len() + self.entries66.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn entries66(&self) -> &[Mapping66Entry] {
        &self.entries66
    }

    /// The /96 mapping prefix, `::` when none was configured.
    pub fn prefix(&self) -> Ipv6Addr {
        self.prefix.unwrap_or(Ipv6Addr::UNSPECIFIED)
    }

    pub fn lookup_by_ipv4(&self, addr: Ipv4Addr) -> Option<Ipv6Addr> {
        self.by_ipv4.get(&addr).copied()
    }

    pub fn lookup_by_ipv6(&self, addr: Ipv6Addr) -> Option<Ipv4Addr> {
        self.by_ipv6.get(&addr).copied()
    }

    /// Counterpart of `addr` in a 6-to-6 pair, in either direction.
    pub fn lookup66_by_ipv6(&self, addr: Ipv6Addr) -> Option<Ipv6Addr> {
        self.map66.get(&addr).copied()
    }

    /// Whether `addr` lies inside the /96 mapping prefix.
    pub fn in_prefix(&self, addr: Ipv6Addr) -> bool {
        mask_prefix(addr) == self.prefix()
    }

    /// IPv4 → IPv6. The destination must be mapped; the source is embedded
    /// in the mapping prefix.
    pub fn convert_4to6(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Result<(Ipv6Addr, Ipv6Addr), MappingError> {
        let dst6 = self
            .lookup_by_ipv4(dst)
            .ok_or(MappingError::NoMapping(IpAddr::V4(dst)))?;
        Ok((embed_ipv4(self.prefix(), src), dst6))
    }

    /// IPv6 → IPv4. The destination is taken from the low 32 bits; the
    /// source must be mapped.
    pub fn convert_6to4(
        &self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
    ) -> Result<(Ipv4Addr, Ipv4Addr), MappingError> {
        let src4 = self
            .lookup_by_ipv6(src)
            .ok_or(MappingError::NoMapping(IpAddr::V6(src)))?;
        Ok((src4, extract_ipv4(dst)))
    }

    /// IPv6 → IPv6. Exactly one side must have a 6-to-6 pair; that side is
    /// replaced by its counterpart.
    pub fn convert_6to6(
        &self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
    ) -> Result<(Ipv6Addr, Ipv6Addr), MappingError> {
        match (self.lookup66_by_ipv6(src), self.lookup66_by_ipv6(dst)) {
            (Some(_), Some(_)) => Err(MappingError::Ambiguous { src, dst }),
            (Some(new_src), None) => Ok((new_src, dst)),
            (None, Some(new_dst)) => Ok((src, new_dst)),
            (None, None) => Err(MappingError::NoMapping(IpAddr::V6(dst))),
        }
    }

    /// Decide how an IPv6 packet is translated.
    pub fn classify_direction(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Option<Direction> {
        let src66 = self.map66.contains_key(&src);
        let dst66 = self.map66.contains_key(&dst);
        let src46 = self.by_ipv6.contains_key(&src);

        if !src66 && !src46 && dst66 {
            Some(Direction::SixToSix)
        } else if (src66 || src46) && !dst66 {
            if self.in_prefix(dst) {
                Some(Direction::SixToFour)
            } else {
                Some(Direction::SixToSix)
            }
        } else {
            None
        }
    }

    /// Install host routes for mapped IPv4 addresses, the prefix route and
    /// policy rules for 6-to-6 global addresses.
    ///
    /// Only a failure to install the prefix route is returned.
    pub fn install_routes<R: Router + ?Sized>(&self, router: &mut R) -> Result<(), Error> {
        for entry in &self.entries {
            if let Err(e) = router.add_host_route(IpAddr::V4(entry.ipv4)) {
                warn!("IPv4 host route for {} failed: {e}", entry.ipv4);
            }
        }

        match self.prefix {
            Some(prefix) => {
                router.add_network_route(IpAddr::V6(prefix), MAPPING_PREFIX_LEN)?;
            }
            None if !self.entries.is_empty() => {
                warn!("no mapping-prefix configured, IPv4 sources map into ::/96 without a route");
            }
            None => {}
        }

        for entry in &self.entries66 {
            if let Err(e) = router.add_policy_rule(IpAddr::V6(entry.global), HOST_PREFIX_LEN_V6) {
                warn!("IPv6 policy rule for {} failed: {e}", entry.global);
            }
        }

        info!(
            "installed routes for {} 4-to-6 and {} 6-to-6 mappings",
            self.entries.len(),
            self.entries66.len()
        );
        Ok(())
    }

    /// Remove everything [`install_routes`](Self::install_routes) added.
    pub fn uninstall_routes<R: Router + ?Sized>(&self, router: &mut R) {
        for family in [AddressFamily::Inet, AddressFamily::Inet6] {
            if let Err(e) = router.remove_all(family) {
                warn!("removing {family} routes failed: {e}");
            }
        }
    }
}

/// Clear the low 32 bits of `addr`.
fn mask_prefix(addr: Ipv6Addr) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(addr) & !0xffff_ffffu128)
}

/// Place `v4` in the low 32 bits of `prefix`.
pub fn embed_ipv4(prefix: Ipv6Addr, v4: Ipv4Addr) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(mask_prefix(prefix)) | u32::from(v4) as u128)
}

/// The IPv4 address in the low 32 bits of `v6`.
pub fn extract_ipv4(v6: Ipv6Addr) -> Ipv4Addr {
    Ipv4Addr::from(u128::from(v6) as u32)
}
