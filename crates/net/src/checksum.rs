//! Internet checksum arithmetic (RFC 1071, RFC 1624).
//!
//! Sums are carried as unfolded `u32` values so that partial sums over
//! different regions can be combined before the final fold.

use std::net::IpAddr;

/// IP protocol number of ICMP for IPv4, whose checksum has no pseudo-header.
const IPPROTO_ICMP: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    #[error("pseudo-header addresses belong to different families")]
    FamilyMismatch,
}

/// Sum `data` as big-endian 16-bit words. An odd trailing byte is the high
/// byte of a zero-padded word.
pub fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = 0u32;
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold carries back into the low 16 bits until none remain.
pub fn fold_carries(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Add two partial sums without overflowing.
pub fn combine(a: u32, b: u32) -> u32 {
    fold_carries(a) as u32 + fold_carries(b) as u32
}

/// Complement of the folded sum: the value stored in a checksum field.
pub fn finalize(sum: u32) -> u16 {
    !fold_carries(sum)
}

/// Checksum of an IPv4 header with its checksum field treated as zero.
///
/// The header length is taken from IHL and capped at `header.len()`.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let Some(first) = header.first() else {
        return finalize(0);
    };
    let len = (((first & 0x0f) as usize) * 4).min(header.len());
    let header = &header[..len];

    let sum = if len >= 12 {
        combine(ones_complement_sum(&header[..10]), ones_complement_sum(&header[12..]))
    } else {
        ones_complement_sum(&header[..len.min(10)])
    };
    finalize(sum)
}

/// Sum of the address words of `addr`.
pub fn address_sum(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => ones_complement_sum(&v4.octets()),
        IpAddr::V6(v6) => ones_complement_sum(&v6.octets()),
    }
}

/// Sum of the transport pseudo-header.
///
/// IPv4 carries a 16-bit length and IPv6 a 32-bit one; both are summed as
/// two 16-bit words, which is identical for lengths below 64 KiB.
pub fn pseudo_header_sum(
    src: IpAddr,
    dst: IpAddr,
    upper_proto: u8,
    upper_len: u32,
) -> Result<u32, ChecksumError> {
    if src.is_ipv4() != dst.is_ipv4() {
        return Err(ChecksumError::FamilyMismatch);
    }
    let addresses = combine(address_sum(src), address_sum(dst));
    let trailer = upper_proto as u32 + (upper_len >> 16) + (upper_len & 0xffff);
    Ok(combine(addresses, trailer))
}

/// Update a checksum after a field whose words summed to `old_field_sum`
/// was replaced by one summing to `new_field_sum` (RFC 1624, eqn. 3).
pub fn incremental_adjust(old_checksum: u16, old_field_sum: u32, new_field_sum: u32) -> u16 {
    let sum = (!old_checksum) as u32
        + (!fold_carries(old_field_sum)) as u32
        + fold_carries(new_field_sum) as u32;
    finalize(sum)
}

/// Full checksum of an upper-layer message whose checksum field is zero.
///
/// ICMP over IPv4 is summed without a pseudo-header.
pub fn upper_layer_checksum(
    src: IpAddr,
    dst: IpAddr,
    upper_proto: u8,
    payload: &[u8],
) -> Result<u16, ChecksumError> {
    let body = ones_complement_sum(payload);
    if upper_proto == IPPROTO_ICMP && src.is_ipv4() {
        if !dst.is_ipv4() {
            return Err(ChecksumError::FamilyMismatch);
        }
        return Ok(finalize(body));
    }
    let pseudo = pseudo_header_sum(src, dst, upper_proto, payload.len() as u32)?;
    Ok(finalize(combine(pseudo, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn v6(s: &str) -> IpAddr {
        IpAddr::V6(s.parse::<Ipv6Addr>().unwrap())
    }

    #[test]
    fn sum_of_empty_is_zero() {
        assert_eq!(ones_complement_sum(&[]), 0);
        assert_eq!(finalize(0), 0xffff);
    }

    #[test]
    fn odd_length_pads_high_byte() {
        assert_eq!(ones_complement_sum(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn fold_is_idempotent() {
        for sum in [0u32, 0xffff, 0x1_0000, 0x1_fffe, 0xffff_ffff, 0x8765_4321] {
            let once = fold_carries(sum);
            assert_eq!(fold_carries(once as u32), once);
        }
    }

    #[test]
    fn rfc1071_example() {
        // Example from RFC 1071 section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(fold_carries(ones_complement_sum(&data)), 0xddf2);
        assert_eq!(finalize(ones_complement_sum(&data)), !0xddf2);
    }

    #[test]
    fn ipv4_header_self_check() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let checksum = ipv4_header_checksum(&header);
        assert_eq!(checksum, 0xb861);

        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(fold_carries(ones_complement_sum(&header)), 0xffff);
        // The stored checksum is ignored when recomputing.
        assert_eq!(ipv4_header_checksum(&header), checksum);
    }

    #[test]
    fn all_zero_header_checksums_to_ffff() {
        assert_eq!(ipv4_header_checksum(&[0u8; 20]), 0xffff);
        assert_eq!(ipv4_header_checksum(&[]), 0xffff);
    }

    #[test]
    fn pseudo_header_rejects_mixed_families() {
        assert_eq!(
            pseudo_header_sum(v4(192, 0, 2, 1), v6("2001:db8::1"), 6, 20),
            Err(ChecksumError::FamilyMismatch)
        );
    }

    #[test]
    fn pseudo_header_length_words() {
        let src = v6("::");
        let dst = v6("::");
        assert_eq!(pseudo_header_sum(src, dst, 17, 0x1_0002).unwrap(), 17 + 1 + 2);
    }

    #[test]
    fn udp_checksum_verifies() {
        let src = v4(192, 0, 2, 1);
        let dst = v4(198, 51, 100, 7);
        let mut udp = vec![0x30, 0x39, 0x00, 0x35, 0x00, 0x0d, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o'];
        let checksum = upper_layer_checksum(src, dst, 17, &udp).unwrap();
        udp[6..8].copy_from_slice(&checksum.to_be_bytes());

        let pseudo = pseudo_header_sum(src, dst, 17, udp.len() as u32).unwrap();
        assert_eq!(finalize(combine(pseudo, ones_complement_sum(&udp))), 0);
    }

    #[test]
    fn icmpv4_has_no_pseudo_header() {
        let message = [8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];
        let with_addrs = upper_layer_checksum(v4(10, 0, 0, 1), v4(10, 0, 0, 2), 1, &message).unwrap();
        assert_eq!(with_addrs, finalize(ones_complement_sum(&message)));
    }

    #[test]
    fn incremental_matches_full_recompute() {
        let old_src = v4(192, 0, 2, 1);
        let old_dst = v4(198, 51, 100, 7);
        let new_src = v6("64:ff9b::c000:201");
        let new_dst = v6("2001:db8::7");

        let mut tcp = vec![0u8; 24];
        tcp[0..2].copy_from_slice(&443u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&50000u16.to_be_bytes());
        tcp[12] = 0x50;
        tcp[20..24].copy_from_slice(b"data");

        let old = upper_layer_checksum(old_src, old_dst, 6, &tcp).unwrap();
        let expected = upper_layer_checksum(new_src, new_dst, 6, &tcp).unwrap();

        let adjusted = incremental_adjust(
            old,
            combine(address_sum(old_src), address_sum(old_dst)),
            combine(address_sum(new_src), address_sum(new_dst)),
        );
        assert_eq!(adjusted, expected);
    }

    #[test]
    fn incremental_with_identical_fields_is_identity() {
        for checksum in [0x0001u16, 0x1234, 0xfffe] {
            assert_eq!(incremental_adjust(checksum, 0x4321, 0x4321), checksum);
        }
    }
}
