//! ICMP ↔ ICMPv6 conversion and error-notice synthesis.
//!
//! Only echo request/reply are translated. Error messages arriving from
//! either side are consumed: "fragmentation needed" and "packet too big"
//! feed the Path-MTU cache, everything else is discarded.

use crate::checksum;
use crate::packet::{IPV4_HEADER_LEN, IPV6_HEADER_LEN, Ipv4HeaderFields, Ipv6HeaderFields, OutboundPacket};
use crate::pmtu::{MIN_IPV4_MTU, MIN_IPV6_MTU, PathMtuCache};
use map646_core::AddressFamily;
use smoltcp::wire::IpProtocol;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_CODE_FRAG_NEEDED: u8 = 4;
pub const ICMP_ECHO_REQUEST: u8 = 8;

pub const ICMPV6_PACKET_TOO_BIG: u8 = 2;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

/// Type, code, checksum and the 4-byte rest-of-header.
pub const ICMP_HEADER_LEN: usize = 8;

/// Hop limit / TTL of generated notices.
const NOTICE_HOP_LIMIT: u8 = 64;

/// Bytes of the offending datagram's payload quoted in an ICMPv4 error
/// (RFC 792).
const ICMPV4_QUOTED_PAYLOAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IcmpError {
    #[error("ICMP message too short ({0} bytes)")]
    Truncated(usize),

    #[error("ICMP type {0} is not translated")]
    Unsupported(u8),

    #[error("ICMPv6 type {0} is not translated")]
    UnsupportedV6(u8),
}

/// What the translator should do with an inbound ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardAdvice {
    Translate,
    Discard,
}

fn type_code_word(message: &[u8]) -> u32 {
    u16::from_be_bytes([message[0], message[1]]) as u32
}

fn stored_checksum(message: &[u8]) -> u16 {
    u16::from_be_bytes([message[2], message[3]])
}

fn rewrite_type(message: &mut [u8], new_type: u8, old_sum: u32, new_sum: u32) {
    let adjusted = checksum::incremental_adjust(stored_checksum(message), old_sum, new_sum);
    message[0] = new_type;
    message[2..4].copy_from_slice(&adjusted.to_be_bytes());
}

/// Convert an ICMPv4 echo message into ICMPv6 in place.
///
/// `v6_pseudo_sum` is the pseudo-header sum of the outgoing IPv6 packet;
/// it is folded into the checksum since ICMPv4 has none.
pub fn icmp_to_icmpv6(message: &mut [u8], v6_pseudo_sum: u32) -> Result<(), IcmpError> {
    if message.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated(message.len()));
    }
    let new_type = match message[0] {
        ICMP_ECHO_REQUEST => ICMPV6_ECHO_REQUEST,
        ICMP_ECHO_REPLY => ICMPV6_ECHO_REPLY,
        other => return Err(IcmpError::Unsupported(other)),
    };

    let old_word = type_code_word(message);
    let new_word = ((new_type as u32) << 8) | message[1] as u32;
    rewrite_type(
        message,
        new_type,
        old_word,
        checksum::combine(new_word, v6_pseudo_sum),
    );
    Ok(())
}

/// Convert an ICMPv6 echo message into ICMPv4 in place.
///
/// `v6_pseudo_sum` is the pseudo-header sum of the incoming IPv6 packet,
/// removed from the checksum.
pub fn icmpv6_to_icmp(message: &mut [u8], v6_pseudo_sum: u32) -> Result<(), IcmpError> {
    if message.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated(message.len()));
    }
    let new_type = match message[0] {
        ICMPV6_ECHO_REQUEST => ICMP_ECHO_REQUEST,
        ICMPV6_ECHO_REPLY => ICMP_ECHO_REPLY,
        other => return Err(IcmpError::UnsupportedV6(other)),
    };

    let old_word = type_code_word(message);
    let new_word = ((new_type as u32) << 8) | message[1] as u32;
    rewrite_type(
        message,
        new_type,
        checksum::combine(old_word, v6_pseudo_sum),
        new_word,
    );
    Ok(())
}

/// Decide whether an ICMPv4 message arriving from the IPv4 side is
/// translated, recording Path-MTU feedback on the way.
pub fn process_inbound_icmp(
    message: &[u8],
    pmtu: &mut PathMtuCache,
) -> Result<DiscardAdvice, IcmpError> {
    if message.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated(message.len()));
    }
    match (message[0], message[1]) {
        (ICMP_ECHO_REQUEST | ICMP_ECHO_REPLY, _) => Ok(DiscardAdvice::Translate),
        (ICMP_DEST_UNREACHABLE, ICMP_CODE_FRAG_NEEDED) => {
            let mtu = u16::from_be_bytes([message[6], message[7]]).max(MIN_IPV4_MTU);
            match message.get(ICMP_HEADER_LEN + 16..ICMP_HEADER_LEN + IPV4_HEADER_LEN) {
                Some(dst) => {
                    let dst = Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]);
                    tracing::debug!("path MTU to {dst} reported as {mtu}");
                    pmtu.record_feedback(IpAddr::V4(dst), mtu);
                }
                None => tracing::warn!("fragmentation-needed message without inner header"),
            }
            Ok(DiscardAdvice::Discard)
        }
        _ => Ok(DiscardAdvice::Discard),
    }
}

/// Record the MTU carried by an ICMPv6 Packet Too Big message arriving
/// from the IPv6 side.
pub fn process_inbound_icmpv6_too_big(
    message: &[u8],
    pmtu: &mut PathMtuCache,
) -> Result<(), IcmpError> {
    if message.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated(message.len()));
    }
    if message[0] != ICMPV6_PACKET_TOO_BIG {
        return Err(IcmpError::UnsupportedV6(message[0]));
    }
    let reported = u32::from_be_bytes([message[4], message[5], message[6], message[7]]);
    let mtu = reported.clamp(MIN_IPV6_MTU as u32, u16::MAX as u32) as u16;

    let inner = &message[ICMP_HEADER_LEN..];
    let Some(dst) = inner.get(24..IPV6_HEADER_LEN) else {
        return Err(IcmpError::Truncated(message.len()));
    };
    let mut octets = [0u8; 16];
    octets.copy_from_slice(dst);
    let dst = Ipv6Addr::from(octets);
    tracing::debug!("path MTU to {dst} reported as {mtu}");
    pmtu.record_feedback(IpAddr::V6(dst), mtu);
    Ok(())
}

/// Build an ICMPv4 Destination Unreachable / Fragmentation Needed message
/// about `original`, addressed from `src` to `dst`.
pub fn build_icmpv4_need_frag(
    original: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    next_hop_mtu: u16,
) -> OutboundPacket {
    let header_len = original
        .first()
        .map_or(IPV4_HEADER_LEN, |b| ((b & 0x0f) as usize) * 4);
    let quoted = original.len().min(header_len + ICMPV4_QUOTED_PAYLOAD);

    let mut message = vec![0u8; ICMP_HEADER_LEN + quoted];
    message[0] = ICMP_DEST_UNREACHABLE;
    message[1] = ICMP_CODE_FRAG_NEEDED;
    message[6..8].copy_from_slice(&next_hop_mtu.max(MIN_IPV4_MTU).to_be_bytes());
    message[ICMP_HEADER_LEN..].copy_from_slice(&original[..quoted]);
    let sum = checksum::finalize(checksum::ones_complement_sum(&message));
    message[2..4].copy_from_slice(&sum.to_be_bytes());

    let header = Ipv4HeaderFields {
        src,
        dst,
        protocol: IpProtocol::Icmp,
        ttl: NOTICE_HOP_LIMIT,
        ident: 0,
        dont_frag: false,
        more_frags: false,
        frag_offset: 0,
    }
    .emit(message.len());

    OutboundPacket {
        family: AddressFamily::Inet,
        header,
        fragment_header: None,
        payload: message,
    }
}

/// Build an ICMPv6 Packet Too Big message about `original`, quoting as
/// much of it as fits in the minimum IPv6 MTU (RFC 4443).
pub fn build_icmpv6_packet_too_big(
    original: &[u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    mtu: u32,
) -> OutboundPacket {
    let room = MIN_IPV6_MTU as usize - IPV6_HEADER_LEN - ICMP_HEADER_LEN;
    let quoted = original.len().min(room);

    let mut message = vec![0u8; ICMP_HEADER_LEN + quoted];
    message[0] = ICMPV6_PACKET_TOO_BIG;
    message[4..8].copy_from_slice(&mtu.max(MIN_IPV6_MTU as u32).to_be_bytes());
    message[ICMP_HEADER_LEN..].copy_from_slice(&original[..quoted]);

    let pseudo = checksum::combine(
        checksum::combine(
            checksum::address_sum(IpAddr::V6(src)),
            checksum::address_sum(IpAddr::V6(dst)),
        ),
        u8::from(IpProtocol::Icmpv6) as u32 + message.len() as u32,
    );
    let sum = checksum::finalize(checksum::combine(pseudo, checksum::ones_complement_sum(&message)));
    message[2..4].copy_from_slice(&sum.to_be_bytes());

    let header = Ipv6HeaderFields {
        src,
        dst,
        next_header: IpProtocol::Icmpv6,
        hop_limit: NOTICE_HOP_LIMIT,
    }
    .emit(message.len());

    OutboundPacket {
        family: AddressFamily::Inet6,
        header,
        fragment_header: None,
        payload: message,
    }
}
