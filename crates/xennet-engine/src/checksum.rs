//! Internet checksum helpers (RFC 1071) for IPv4, TCP and UDP.

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Offset of the checksum field inside a TCP header.
pub const TCP_CSUM_OFFSET: usize = 16;
/// Offset of the checksum field inside a UDP header.
pub const UDP_CSUM_OFFSET: usize = 6;
/// Offset of the checksum field inside an IPv4 header.
pub const IPV4_CSUM_OFFSET: usize = 10;

/// Add big-endian 16-bit words of `data` to `sum`. A trailing odd byte
/// is padded with zero.
pub fn checksum_sum_u16_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    sum
}

/// Fold carries and complement.
pub fn fold_checksum_sum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn ones_complement_checksum(data: &[u8]) -> u16 {
    fold_checksum_sum(checksum_sum_u16_words(data, 0))
}

/// Running sum over data that arrives in pieces of arbitrary length.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksumAccumulator {
    sum: u64,
    odd: Option<u8>,
}

impl ChecksumAccumulator {
    pub fn new(seed: u32) -> Self {
        Self { sum: seed as u64, odd: None }
    }

    pub fn add(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(hi) = self.odd.take() {
            self.sum += u16::from_be_bytes([hi, data[0]]) as u64;
            data = &data[1..];
        }
        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            self.sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u64;
        }
        self.odd = chunks.remainder().first().copied();
    }

    /// Folded, complemented result.
    pub fn finish(self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.odd {
            sum += (hi as u64) << 8;
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Pseudo-header sum for an IPv4 transport segment of `len` bytes.
pub fn pseudo_header_sum_ipv4(src: &[u8], dst: &[u8], protocol: u8, len: u16) -> u32 {
    let mut sum = checksum_sum_u16_words(src, 0);
    sum = checksum_sum_u16_words(dst, sum);
    sum + protocol as u32 + len as u32
}

/// Checksum of an IPv4 header with its checksum field treated as zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut acc = ChecksumAccumulator::new(0);
    acc.add(&header[..IPV4_CSUM_OFFSET]);
    acc.add(&header[IPV4_CSUM_OFFSET + 2..]);
    acc.finish()
}

/// Recompute and store the checksum of the IPv4 header in `header`.
pub fn write_ipv4_header_checksum(header: &mut [u8]) {
    let csum = ipv4_header_checksum(header);
    header[IPV4_CSUM_OFFSET..IPV4_CSUM_OFFSET + 2].copy_from_slice(&csum.to_be_bytes());
}

pub fn ipv4_header_checksum_ok(header: &[u8]) -> bool {
    ones_complement_checksum(header) == 0
}

/// Checksum for a transport segment: pseudo-header plus `segment` with
/// the checksum field at `csum_offset` treated as zero.
pub fn transport_checksum_ipv4(src: &[u8], dst: &[u8], protocol: u8, segment: &[u8], csum_offset: usize) -> u16 {
    let mut acc = ChecksumAccumulator::new(pseudo_header_sum_ipv4(src, dst, protocol, segment.len() as u16));
    acc.add(&segment[..csum_offset]);
    acc.add(&segment[csum_offset + 2..]);
    let csum = acc.finish();
    if protocol == IPPROTO_UDP && csum == 0 {
        0xFFFF
    } else {
        csum
    }
}

/// Whether `segment` carries a valid checksum. A zero UDP checksum means
/// the sender did not compute one.
pub fn transport_checksum_ok(src: &[u8], dst: &[u8], protocol: u8, segment: &[u8], csum_offset: usize) -> bool {
    let stored = u16::from_be_bytes([segment[csum_offset], segment[csum_offset + 1]]);
    if protocol == IPPROTO_UDP && stored == 0 {
        return true;
    }
    let mut acc = ChecksumAccumulator::new(pseudo_header_sum_ipv4(src, dst, protocol, segment.len() as u16));
    acc.add(segment);
    acc.finish() == 0
}

/// Take the transport length back out of a TCP pseudo-header checksum
/// seed. Large-send stacks seed the field with the length of the whole
/// unsegmented payload; the backend segments and adds each segment's
/// own length.
pub fn remove_length_from_pseudo_checksum(field: u16, l4_len: u16) -> u16 {
    // One's-complement subtraction: add the complement.
    let mut csum: u32 = (!field) as u32 + (!l4_len) as u32;
    while csum & 0xFFFF_0000 != 0 {
        csum = (csum & 0xFFFF) + (csum >> 16);
    }
    !(csum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header() -> [u8; 20] {
        let mut h = [0u8; 20];
        h[0] = 0x45;
        h[2..4].copy_from_slice(&60u16.to_be_bytes());
        h[8] = 64;
        h[9] = IPPROTO_TCP;
        h[12..16].copy_from_slice(&[10, 0, 0, 1]);
        h[16..20].copy_from_slice(&[10, 0, 0, 2]);
        h
    }

    #[test]
    fn test_ipv4_header_checksum_roundtrip() {
        let mut h = ipv4_header();
        write_ipv4_header_checksum(&mut h);
        assert!(ipv4_header_checksum_ok(&h));
        h[8] = 63;
        assert!(!ipv4_header_checksum_ok(&h));
    }

    #[test]
    fn test_accumulator_matches_contiguous_sum_across_odd_splits() {
        let data: Vec<u8> = (0..1001u32).map(|i| (i * 7) as u8).collect();
        let whole = ones_complement_checksum(&data);
        for split in [1usize, 3, 500, 999] {
            let mut acc = ChecksumAccumulator::new(0);
            acc.add(&data[..split]);
            acc.add(&data[split..split + 1]);
            acc.add(&data[split + 1..]);
            assert_eq!(acc.finish(), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_transport_checksum_verifies() {
        let src = [192, 168, 0, 1];
        let dst = [192, 168, 0, 2];
        let mut seg = vec![0u8; 20 + 33];
        seg[12] = 5 << 4;
        for (i, b) in seg[20..].iter_mut().enumerate() {
            *b = i as u8;
        }
        let csum = transport_checksum_ipv4(&src, &dst, IPPROTO_TCP, &seg, TCP_CSUM_OFFSET);
        seg[16..18].copy_from_slice(&csum.to_be_bytes());
        assert!(transport_checksum_ok(&src, &dst, IPPROTO_TCP, &seg, TCP_CSUM_OFFSET));
        seg[30] ^= 0xff;
        assert!(!transport_checksum_ok(&src, &dst, IPPROTO_TCP, &seg, TCP_CSUM_OFFSET));
    }

    #[test]
    fn test_zero_udp_checksum_is_accepted() {
        let seg = [0u8; 12];
        assert!(transport_checksum_ok(&[1, 1, 1, 1], &[2, 2, 2, 2], IPPROTO_UDP, &seg, UDP_CSUM_OFFSET));
    }

    #[test]
    fn test_remove_length_from_pseudo_checksum() {
        // Seed with length folded in, complemented as stored in the field.
        let without_len: u16 = 0x1234;
        let len = 0x0100u16;
        let with_len = without_len + len;
        assert_eq!(remove_length_from_pseudo_checksum(!with_len, len), !without_len);

        // Borrow through the fold.
        let without_len: u16 = 0xFF4F;
        let with_len = fold_sum(without_len as u32 + len as u32);
        assert_eq!(with_len, 0x0050);
        assert_eq!(remove_length_from_pseudo_checksum(!with_len, len), !without_len);
    }

    fn fold_sum(mut sum: u32) -> u16 {
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }
}
