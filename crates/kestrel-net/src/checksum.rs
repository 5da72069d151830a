//! RFC 1071 Internet checksum.
//!
//! One's complement sum of 16-bit words, folded with end-around carry and
//! complemented. Used for the IPv4 header, the UDP pseudo-header, and IGMP
//! messages.

/// Checksum a single buffer. An odd trailing byte is treated as a 16-bit
/// word padded with zero.
pub fn checksum16(data: &[u8]) -> u16 {
    finalize(partial(data, 0))
}

/// Checksum two independently laid-out regions as if they were one buffer.
///
/// The first region must have even length (true for every header this stack
/// builds). Combines by summing the complements of the per-region checksums
/// and folding once more.
pub fn checksum16_two(head: &[u8], body: &[u8]) -> u16 {
    let a = checksum16(head);
    let b = checksum16(body);
    let mut sum = (!a as u32) + (!b as u32);
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1624 incremental update for a single in-place 16-bit word edit.
pub fn checksum_update(old_checksum: u16, old_word: u16, new_word: u16) -> u16 {
    let mut sum = (!old_checksum as u32) + (!old_word as u32) + new_word as u32;
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn partial(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut i = 0;

    while i + 1 < data.len() {
        let word = u16::from_be_bytes([data[i], data[i + 1]]);
        sum = sum.wrapping_add(word as u32);
        i += 2;
    }

    if i < data.len() {
        sum = sum.wrapping_add((data[i] as u32) << 8);
    }

    sum
}

fn finalize(sum: u32) -> u16 {
    let mut s = sum;
    while s >> 16 != 0 {
        s = (s & 0xffff) + (s >> 16);
    }
    !(s as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_zeros() {
        assert_eq!(checksum16(&[0u8; 20]), 0xffff);
    }

    #[test]
    fn checksum_ones() {
        assert_eq!(checksum16(&[0xffu8; 20]), 0);
    }

    #[test]
    fn stamped_packet_checksums_to_zero() {
        // A correctly stamped header verifies to zero before complement.
        let mut data = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];
        let checksum = checksum16(&data);
        data[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(checksum16(&data), 0);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        // Trailing odd byte behaves as if a zero byte followed it.
        assert_eq!(checksum16(&[0x45, 0x00, 0x12]), checksum16(&[0x45, 0x00, 0x12, 0x00]));
    }

    #[test]
    fn two_region_matches_concatenation() {
        let head = [0x12u8, 0x34, 0x56, 0x78, 0x9a, 0xbc];
        let body = [0x01u8, 0x02, 0x03];
        let mut joined = head.to_vec();
        joined.extend_from_slice(&body);
        assert_eq!(checksum16_two(&head, &body), checksum16(&joined));
    }

    #[test]
    fn incremental_update_matches_full_recompute() {
        let mut data = [
            0x45u8, 0x00, 0x00, 0x54, 0xab, 0xcd, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00,
        ];
        let old = checksum16(&data);
        let old_word = u16::from_be_bytes([data[4], data[5]]);
        let new_word = 0x1234u16;
        data[4..6].copy_from_slice(&new_word.to_be_bytes());
        assert_eq!(checksum_update(old, old_word, new_word), checksum16(&data));
    }
}
