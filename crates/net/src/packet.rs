//! Wire helpers shared by the translation paths.

use crate::checksum;
use map646_core::AddressFamily;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet};
use std::net::{Ipv4Addr, Ipv6Addr};

/// IPv4 header size (without options).
pub const IPV4_HEADER_LEN: usize = 20;

/// IPv6 fixed header size.
pub const IPV6_HEADER_LEN: usize = 40;

/// IPv6 Fragment extension header size.
pub const FRAGMENT_HEADER_LEN: usize = 8;

/// Offset of the checksum field inside an IPv4 header.
const IPV4_CHECKSUM_OFFSET: usize = 10;

/// IPv6 Fragment extension header (RFC 8200, section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub next_header: IpProtocol,
    /// Offset of this fragment in octets, always a multiple of 8.
    pub offset: u16,
    pub more_fragments: bool,
    pub ident: u32,
}

impl FragmentHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = data.get(..FRAGMENT_HEADER_LEN)?;
        let offset_flags = u16::from_be_bytes([header[2], header[3]]);
        Some(Self {
            next_header: IpProtocol::from(header[0]),
            offset: offset_flags & !0x7,
            more_fragments: offset_flags & 0x1 != 0,
            ident: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_LEN] {
        let offset_flags = (self.offset & !0x7) | self.more_fragments as u16;
        let mut bytes = [0u8; FRAGMENT_HEADER_LEN];
        bytes[0] = u8::from(self.next_header);
        bytes[2..4].copy_from_slice(&offset_flags.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.ident.to_be_bytes());
        bytes
    }

    /// Whether this is a real fragment rather than an atomic one.
    pub fn is_fragment(&self) -> bool {
        self.offset != 0 || self.more_fragments
    }
}

/// A packet ready to be written to the tun device, kept as separate
/// segments so the payload is never copied into a contiguous frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub family: AddressFamily,
    pub header: Vec<u8>,
    pub fragment_header: Option<[u8; FRAGMENT_HEADER_LEN]>,
    pub payload: Vec<u8>,
}

impl OutboundPacket {
    /// Base header, optional fragment header, payload.
    pub fn segments(&self) -> Vec<&[u8]> {
        let mut segments = Vec::with_capacity(3);
        segments.push(self.header.as_slice());
        if let Some(fragment) = &self.fragment_header {
            segments.push(fragment.as_slice());
        }
        segments.push(self.payload.as_slice());
        segments
    }

    pub fn len(&self) -> usize {
        self.segments().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous copy of the packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.segments().concat()
    }
}

/// Fields of an IPv4 header built by the translator.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4HeaderFields {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: IpProtocol,
    pub ttl: u8,
    pub ident: u16,
    pub dont_frag: bool,
    pub more_frags: bool,
    /// Fragment offset in octets.
    pub frag_offset: u16,
}

impl Ipv4HeaderFields {
    /// Emit a 20-byte header with its checksum filled in.
    pub fn emit(&self, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; IPV4_HEADER_LEN];
        {
            let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
            packet.set_version(4);
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_dscp(0);
            packet.set_ecn(0);
            packet.set_total_len((IPV4_HEADER_LEN + payload_len) as u16);
            packet.set_ident(self.ident);
            packet.clear_flags();
            packet.set_dont_frag(self.dont_frag);
            packet.set_more_frags(self.more_frags);
            packet.set_frag_offset(self.frag_offset);
            packet.set_hop_limit(self.ttl);
            packet.set_next_header(self.protocol);
            packet.set_src_addr(self.src);
            packet.set_dst_addr(self.dst);
        }
        let sum = checksum::ipv4_header_checksum(&buf);
        buf[IPV4_CHECKSUM_OFFSET..IPV4_CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
        buf
    }
}

/// Fields of an IPv6 header built by the translator.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6HeaderFields {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: IpProtocol,
    pub hop_limit: u8,
}

impl Ipv6HeaderFields {
    /// Emit a 40-byte header with zero traffic class and flow label.
    pub fn emit(&self, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; IPV6_HEADER_LEN];
        let mut packet = Ipv6Packet::new_unchecked(&mut buf[..]);
        packet.set_version(6);
        packet.set_traffic_class(0);
        packet.set_flow_label(0);
        packet.set_payload_len(payload_len as u16);
        packet.set_next_header(self.next_header);
        packet.set_hop_limit(self.hop_limit);
        packet.set_src_addr(self.src);
        packet.set_dst_addr(self.dst);
        buf
    }
}
