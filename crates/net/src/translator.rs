//! Stateless packet translation.
//!
//! Each packet read from the tun device runs once through
//! parse → validate → (ICMP feedback) → address conversion → header build →
//! (fragmentation) → checksum fix-up, and yields zero or more packets to
//! write back, including any ICMP error notices generated on the way.

use crate::checksum::{self, ChecksumError};
use crate::icmp::{self, DiscardAdvice, ICMPV6_PACKET_TOO_BIG, IcmpError};
use crate::mapping::{Direction, MappingError, MappingTable};
use crate::packet::{
    FRAGMENT_HEADER_LEN, FragmentHeader, IPV4_HEADER_LEN, IPV6_HEADER_LEN, Ipv4HeaderFields,
    Ipv6HeaderFields, OutboundPacket,
};
use crate::pmtu::{PathMtuCache, PmtuConfig};
use crate::rate_limit::{NOTICES_PER_WINDOW, RateLimiter};
use crate::source::{KernelSourceSelector, SourceAddressSelector};
use map646_core::AddressFamily;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// Room taken by an IPv6 header plus a Fragment header.
const IPV6_FRAGMENT_OVERHEAD: usize = IPV6_HEADER_LEN + FRAGMENT_HEADER_LEN;

/// Growth of a datagram translated from IPv4 into a fragmented IPv6 packet.
const FOUR_TO_SIX_GROWTH: u16 = (IPV6_FRAGMENT_OVERHEAD - IPV4_HEADER_LEN) as u16;

/// Shrinkage of a datagram translated from IPv6 into IPv4.
const SIX_TO_FOUR_SHRINK: u32 = (IPV6_HEADER_LEN - IPV4_HEADER_LEN) as u32;

/// Largest datagram an IP length field can describe.
const MAX_DATAGRAM: usize = u16::MAX as usize;

const TCP_CHECKSUM_OFFSET: usize = 16;
const UDP_CHECKSUM_OFFSET: usize = 6;
const ICMP_CHECKSUM_OFFSET: usize = 2;

/// Why a packet was not translated.
#[derive(Debug, thiserror::Error)]
pub enum DropReason {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("unexpected IP version {0}")]
    Version(u8),

    #[error("IPv4 options are not supported (header length {0})")]
    Ipv4Options(usize),

    #[error("unsupported IPv6 extension header {0}")]
    ExtensionHeader(u8),

    #[error("unsupported upper-layer protocol {0}")]
    Protocol(u8),

    #[error("fragmented ICMP is not translated")]
    FragmentedIcmp,

    #[error("zero UDP checksum on a fragment cannot be completed")]
    ZeroUdpChecksum,

    #[error("fragment extends past the maximum datagram size")]
    Oversized,

    #[error("no translation direction for {src} -> {dst}")]
    Unclassified { src: Ipv6Addr, dst: Ipv6Addr },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Icmp(#[from] IcmpError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),
}

/// Knobs of a [`Translator`].
#[derive(Clone, Debug)]
pub struct TranslatorConfig {
    pub pmtu: PmtuConfig,
    /// ICMP error notices allowed per second on each generation path.
    pub notices_per_second: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            pmtu: PmtuConfig::default(),
            notices_per_second: NOTICES_PER_WINDOW,
        }
    }
}

/// Translation context: mapping table, Path-MTU cache and ICMP notice
/// limiters. Owned by the packet loop.
pub struct Translator<S = KernelSourceSelector> {
    mapping: MappingTable,
    pmtu: PathMtuCache,
    need_frag_limiter: RateLimiter,
    too_big_limiter: RateLimiter,
    source: S,
}

impl Translator<KernelSourceSelector> {
    pub fn new(mapping: MappingTable, config: TranslatorConfig) -> Self {
        Self::with_source_selector(mapping, config, KernelSourceSelector)
    }
}

/// Parsed view of an IPv6 packet limited to what the translator accepts:
/// at most one Fragment header followed by TCP, UDP or ICMPv6.
struct Ipv6View<'a> {
    src: Ipv6Addr,
    dst: Ipv6Addr,
    hop_limit: u8,
    fragment: Option<FragmentHeader>,
    protocol: IpProtocol,
    upper: &'a [u8],
}

impl<'a> Ipv6View<'a> {
    fn parse(packet: &'a [u8]) -> Result<Self, DropReason> {
        let ip = Ipv6Packet::new_checked(packet).map_err(|_| DropReason::Truncated("IPv6 packet"))?;
        if ip.version() != 6 {
            return Err(DropReason::Version(ip.version()));
        }
        let payload = &packet[IPV6_HEADER_LEN..IPV6_HEADER_LEN + ip.payload_len() as usize];

        let (fragment, protocol, upper) = match ip.next_header() {
            IpProtocol::Ipv6Frag => {
                let fragment = FragmentHeader::parse(payload)
                    .ok_or(DropReason::Truncated("IPv6 fragment header"))?;
                (Some(fragment), fragment.next_header, &payload[FRAGMENT_HEADER_LEN..])
            }
            other => (None, other, payload),
        };

        match protocol {
            IpProtocol::Tcp | IpProtocol::Udp | IpProtocol::Icmpv6 => {}
            other if is_extension_header(other) => {
                return Err(DropReason::ExtensionHeader(u8::from(other)));
            }
            other => return Err(DropReason::Protocol(u8::from(other))),
        }

        Ok(Self {
            src: ip.src_addr(),
            dst: ip.dst_addr(),
            hop_limit: ip.hop_limit(),
            fragment,
            protocol,
            upper,
        })
    }

    fn frag_offset(&self) -> u16 {
        self.fragment.map_or(0, |f| f.offset)
    }

    fn more_fragments(&self) -> bool {
        self.fragment.is_some_and(|f| f.more_fragments)
    }

    fn is_fragment(&self) -> bool {
        self.fragment.is_some_and(|f| f.is_fragment())
    }
}

fn is_extension_header(protocol: IpProtocol) -> bool {
    matches!(
        u8::from(protocol),
        0 | 43 | 44 | 50 | 51 | 60 | 135 | 139 | 140 | 253 | 254
    )
}

impl<S: SourceAddressSelector> Translator<S> {
    pub fn with_source_selector(mapping: MappingTable, config: TranslatorConfig, source: S) -> Self {
        Self {
            mapping,
            pmtu: PathMtuCache::new(config.pmtu),
            need_frag_limiter: RateLimiter::new(config.notices_per_second),
            too_big_limiter: RateLimiter::new(config.notices_per_second),
            source,
        }
    }

    pub fn mapping(&self) -> &MappingTable {
        &self.mapping
    }

    pub fn mapping_mut(&mut self) -> &mut MappingTable {
        &mut self.mapping
    }

    pub fn pmtu(&self) -> &PathMtuCache {
        &self.pmtu
    }

    pub fn pmtu_mut(&mut self) -> &mut PathMtuCache {
        &mut self.pmtu
    }

    /// Translate one packet. Drops are logged and yield no output.
    pub fn translate(&mut self, family: AddressFamily, packet: &[u8]) -> Vec<OutboundPacket> {
        match self.try_translate(family, packet) {
            Ok(out) => out,
            Err(reason) => {
                warn!("{family} packet dropped: {reason}");
                Vec::new()
            }
        }
    }

    /// Translate one packet, reporting why it was dropped.
    pub fn try_translate(
        &mut self,
        family: AddressFamily,
        packet: &[u8],
    ) -> Result<Vec<OutboundPacket>, DropReason> {
        let out = match family {
            AddressFamily::Inet => self.send_4to6(packet)?,
            AddressFamily::Inet6 => {
                let view = Ipv6View::parse(packet)?;
                if view.protocol == IpProtocol::Icmpv6
                    && view.fragment.is_none()
                    && view.upper.first() == Some(&ICMPV6_PACKET_TOO_BIG)
                {
                    icmp::process_inbound_icmpv6_too_big(view.upper, &mut self.pmtu)?;
                    return Ok(Vec::new());
                }
                match self.mapping.classify_direction(view.src, view.dst) {
                    Some(Direction::SixToFour) => self.send_6to4(packet, &view)?,
                    Some(Direction::SixToSix) => self.send_6to6(packet, &view)?,
                    Some(Direction::FourToSix) | None => {
                        return Err(DropReason::Unclassified {
                            src: view.src,
                            dst: view.dst,
                        });
                    }
                }
            }
        };
        Ok(out)
    }

    fn send_4to6(&mut self, packet: &[u8]) -> Result<Vec<OutboundPacket>, DropReason> {
        let ip = Ipv4Packet::new_checked(packet).map_err(|_| DropReason::Truncated("IPv4 packet"))?;
        if ip.version() != 4 {
            return Err(DropReason::Version(ip.version()));
        }
        let header_len = ip.header_len() as usize;
        if header_len < IPV4_HEADER_LEN {
            return Err(DropReason::Truncated("IPv4 header"));
        }
        if header_len != IPV4_HEADER_LEN {
            return Err(DropReason::Ipv4Options(header_len));
        }

        let total_len = ip.total_len() as usize;
        let (src4, dst4) = (ip.src_addr(), ip.dst_addr());
        let protocol = ip.next_header();
        let frag_offset = ip.frag_offset();
        let more_frags = ip.more_frags();
        let fragmented = more_frags || frag_offset != 0;
        let mut payload = packet[header_len..total_len].to_vec();

        if frag_offset as usize + payload.len() > MAX_DATAGRAM {
            return Err(DropReason::Oversized);
        }

        let next_header = match protocol {
            IpProtocol::Tcp | IpProtocol::Udp => protocol,
            IpProtocol::Icmp => {
                if fragmented {
                    return Err(DropReason::FragmentedIcmp);
                }
                if icmp::process_inbound_icmp(&payload, &mut self.pmtu)? == DiscardAdvice::Discard {
                    debug!("ICMP type {} from {src4} consumed", payload[0]);
                    return Ok(Vec::new());
                }
                IpProtocol::Icmpv6
            }
            other => return Err(DropReason::Protocol(u8::from(other))),
        };

        let (src6, dst6) = self.mapping.convert_4to6(src4, dst4)?;

        if frag_offset == 0 {
            if protocol == IpProtocol::Icmp {
                let pseudo = checksum::pseudo_header_sum(
                    IpAddr::V6(src6),
                    IpAddr::V6(dst6),
                    u8::from(IpProtocol::Icmpv6),
                    payload.len() as u32,
                )?;
                icmp::icmp_to_icmpv6(&mut payload, pseudo)?;
            } else {
                rewrite_transport_checksum(
                    protocol,
                    &mut payload,
                    (IpAddr::V4(src4), IpAddr::V4(dst4)),
                    (IpAddr::V6(src6), IpAddr::V6(dst6)),
                    fragmented,
                )?;
            }
        }

        let fields = Ipv6HeaderFields {
            src: src6,
            dst: dst6,
            next_header,
            hop_limit: ip.hop_limit(),
        };
        let ident = || match ip.ident() {
            0 => rand::random::<u32>(),
            ident => ident as u32,
        };

        let mtu = self.pmtu.lookup(IpAddr::V6(dst6));
        let budget = (mtu as usize).saturating_sub(IPV6_FRAGMENT_OVERHEAD);
        let mut out = Vec::new();

        if payload.len() > budget {
            let hint = mtu.saturating_sub(FOUR_TO_SIX_GROWTH);
            if let Some(notice) = self.need_frag_notice(&packet[..total_len], src4, hint) {
                out.push(notice);
            }
            out.extend(split_ipv6(fields, &payload, budget, frag_offset, more_frags, ident()));
        } else if fragmented {
            let fragment = FragmentHeader {
                next_header,
                offset: frag_offset,
                more_fragments: more_frags,
                ident: ident(),
            };
            out.push(OutboundPacket {
                family: AddressFamily::Inet6,
                header: Ipv6HeaderFields {
                    next_header: IpProtocol::Ipv6Frag,
                    ..fields
                }
                .emit(FRAGMENT_HEADER_LEN + payload.len()),
                fragment_header: Some(fragment.to_bytes()),
                payload,
            });
        } else {
            out.push(OutboundPacket {
                family: AddressFamily::Inet6,
                header: fields.emit(payload.len()),
                fragment_header: None,
                payload,
            });
        }

        debug!("4to6 {src4} -> {dst4} as {src6} -> {dst6}, {} packet(s)", out.len());
        Ok(out)
    }

    fn send_6to4(
        &mut self,
        packet: &[u8],
        view: &Ipv6View<'_>,
    ) -> Result<Vec<OutboundPacket>, DropReason> {
        let fragmented = view.is_fragment();
        if view.protocol == IpProtocol::Icmpv6 && fragmented {
            return Err(DropReason::FragmentedIcmp);
        }
        let frag_offset = view.frag_offset();
        if frag_offset as usize + view.upper.len() > MAX_DATAGRAM {
            return Err(DropReason::Oversized);
        }

        let (src4, dst4) = self.mapping.convert_6to4(view.src, view.dst)?;
        let mut payload = view.upper.to_vec();

        let protocol = if view.protocol == IpProtocol::Icmpv6 {
            IpProtocol::Icmp
        } else {
            view.protocol
        };

        if frag_offset == 0 {
            if view.protocol == IpProtocol::Icmpv6 {
                let pseudo = checksum::pseudo_header_sum(
                    IpAddr::V6(view.src),
                    IpAddr::V6(view.dst),
                    u8::from(IpProtocol::Icmpv6),
                    payload.len() as u32,
                )?;
                icmp::icmpv6_to_icmp(&mut payload, pseudo)?;
            } else {
                rewrite_transport_checksum(
                    view.protocol,
                    &mut payload,
                    (IpAddr::V6(view.src), IpAddr::V6(view.dst)),
                    (IpAddr::V4(src4), IpAddr::V4(dst4)),
                    fragmented,
                )?;
            }
        }

        let fields = Ipv4HeaderFields {
            src: src4,
            dst: dst4,
            protocol,
            ttl: view.hop_limit,
            ident: view
                .fragment
                .map_or_else(rand::random::<u16>, |f| f.ident as u16),
            dont_frag: view.fragment.is_none(),
            more_frags: view.more_fragments(),
            frag_offset,
        };

        let mtu = self.pmtu.lookup(IpAddr::V4(dst4));
        let mut out = Vec::new();

        if IPV4_HEADER_LEN + payload.len() > mtu as usize {
            let hint = mtu as u32 + SIX_TO_FOUR_SHRINK;
            if let Some(notice) = self.too_big_notice(packet, view.src, hint) {
                out.push(notice);
            }
            let budget = (mtu as usize).saturating_sub(IPV4_HEADER_LEN);
            out.extend(split_ipv4(fields, &payload, budget));
        } else {
            out.push(OutboundPacket {
                family: AddressFamily::Inet,
                header: fields.emit(payload.len()),
                fragment_header: None,
                payload,
            });
        }

        debug!(
            "6to4 {} -> {} as {src4} -> {dst4}, {} packet(s)",
            view.src,
            view.dst,
            out.len()
        );
        Ok(out)
    }

    fn send_6to6(
        &mut self,
        packet: &[u8],
        view: &Ipv6View<'_>,
    ) -> Result<Vec<OutboundPacket>, DropReason> {
        let (src, dst) = self.mapping.convert_6to6(view.src, view.dst)?;
        let mut payload = view.upper.to_vec();

        if view.frag_offset() == 0 {
            rewrite_transport_checksum(
                view.protocol,
                &mut payload,
                (IpAddr::V6(view.src), IpAddr::V6(view.dst)),
                (IpAddr::V6(src), IpAddr::V6(dst)),
                view.is_fragment(),
            )?;
        }

        let mut header = packet[..IPV6_HEADER_LEN].to_vec();
        {
            let mut ip = Ipv6Packet::new_unchecked(&mut header[..]);
            ip.set_src_addr(src);
            ip.set_dst_addr(dst);
        }

        debug!("6to6 {} -> {} as {src} -> {dst}", view.src, view.dst);
        Ok(vec![OutboundPacket {
            family: AddressFamily::Inet6,
            header,
            fragment_header: view.fragment.map(|f| f.to_bytes()),
            payload,
        }])
    }

    fn need_frag_notice(
        &mut self,
        original: &[u8],
        to: Ipv4Addr,
        mtu_hint: u16,
    ) -> Option<OutboundPacket> {
        if !self.need_frag_limiter.try_acquire() {
            debug!("fragmentation-needed notice to {to} rate limited");
            return None;
        }
        match self.source.select(IpAddr::V4(to)) {
            Ok(IpAddr::V4(src)) => Some(icmp::build_icmpv4_need_frag(original, src, to, mtu_hint)),
            Ok(other) => {
                warn!("source address {other} for notice to {to} has the wrong family");
                None
            }
            Err(e) => {
                warn!("no source address for notice to {to}: {e}");
                None
            }
        }
    }

    fn too_big_notice(&mut self, original: &[u8], to: Ipv6Addr, mtu_hint: u32) -> Option<OutboundPacket> {
        if !self.too_big_limiter.try_acquire() {
            debug!("packet-too-big notice to {to} rate limited");
            return None;
        }
        match self.source.select(IpAddr::V6(to)) {
            Ok(IpAddr::V6(src)) => Some(icmp::build_icmpv6_packet_too_big(original, src, to, mtu_hint)),
            Ok(other) => {
                warn!("source address {other} for notice to {to} has the wrong family");
                None
            }
            Err(e) => {
                warn!("no source address for notice to {to}: {e}");
                None
            }
        }
    }
}

/// Fix the TCP, UDP or ICMPv6 checksum of `segment` after its addresses
/// changed from `old` to `new`.
///
/// A zero UDP checksum arriving over IPv4 is computed in full when the
/// datagram is whole; IPv6 does not allow it to stay zero. An empty
/// segment carries no checksum field and passes through unchanged.
fn rewrite_transport_checksum(
    protocol: IpProtocol,
    segment: &mut [u8],
    old: (IpAddr, IpAddr),
    new: (IpAddr, IpAddr),
    fragmented: bool,
) -> Result<(), DropReason> {
    let (offset, what) = match protocol {
        IpProtocol::Tcp => (TCP_CHECKSUM_OFFSET, "TCP header"),
        IpProtocol::Udp => (UDP_CHECKSUM_OFFSET, "UDP header"),
        IpProtocol::Icmpv6 => (ICMP_CHECKSUM_OFFSET, "ICMPv6 header"),
        other => return Err(DropReason::Protocol(u8::from(other))),
    };
    if segment.is_empty() {
        return Ok(());
    }
    let Some(field) = segment.get(offset..offset + 2) else {
        return Err(DropReason::Truncated(what));
    };
    let stored = u16::from_be_bytes([field[0], field[1]]);
    let is_udp = protocol == IpProtocol::Udp;

    let updated = if is_udp && stored == 0 {
        if !(old.0.is_ipv4() && new.0.is_ipv6()) {
            return Ok(());
        }
        if fragmented {
            return Err(DropReason::ZeroUdpChecksum);
        }
        checksum::upper_layer_checksum(new.0, new.1, u8::from(IpProtocol::Udp), segment)?
    } else {
        checksum::incremental_adjust(
            stored,
            checksum::combine(checksum::address_sum(old.0), checksum::address_sum(old.1)),
            checksum::combine(checksum::address_sum(new.0), checksum::address_sum(new.1)),
        )
    };

    let updated = if is_udp && updated == 0 { 0xffff } else { updated };
    segment[offset..offset + 2].copy_from_slice(&updated.to_be_bytes());
    Ok(())
}

/// Split `payload` into IPv6 fragments of at most `budget` bytes each,
/// 8-byte aligned, continuing the offset of the original datagram.
fn split_ipv6(
    fields: Ipv6HeaderFields,
    payload: &[u8],
    budget: usize,
    base_offset: u16,
    base_more: bool,
    ident: u32,
) -> Vec<OutboundPacket> {
    let chunk_len = (budget & !7).max(8);
    payload
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, chunk)| {
            let start = index * chunk_len;
            let last = start + chunk.len() == payload.len();
            let fragment = FragmentHeader {
                next_header: fields.next_header,
                offset: base_offset + start as u16,
                more_fragments: !last || base_more,
                ident,
            };
            OutboundPacket {
                family: AddressFamily::Inet6,
                header: Ipv6HeaderFields {
                    next_header: IpProtocol::Ipv6Frag,
                    ..fields
                }
                .emit(FRAGMENT_HEADER_LEN + chunk.len()),
                fragment_header: Some(fragment.to_bytes()),
                payload: chunk.to_vec(),
            }
        })
        .collect()
}

/// Split `payload` into IPv4 fragments of at most `budget` bytes each,
/// 8-byte aligned, with DF cleared.
fn split_ipv4(fields: Ipv4HeaderFields, payload: &[u8], budget: usize) -> Vec<OutboundPacket> {
    let chunk_len = (budget & !7).max(8);
    payload
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, chunk)| {
            let start = index * chunk_len;
            let last = start + chunk.len() == payload.len();
            let header = Ipv4HeaderFields {
                dont_frag: false,
                more_frags: !last || fields.more_frags,
                frag_offset: fields.frag_offset + start as u16,
                ..fields
            }
            .emit(chunk.len());
            OutboundPacket {
                family: AddressFamily::Inet,
                header,
                fragment_header: None,
                payload: chunk.to_vec(),
            }
        })
        .collect()
}
