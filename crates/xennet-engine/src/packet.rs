//! Ethernet / IPv4 / TCP-UDP header parsing.
//!
//! Works on a contiguous copy of the leading bytes of a frame (the
//! "header"), however the frame itself is spread over buffers. Only
//! what the RX split and TX offload paths need is extracted.

use xennet_core::wire::ETH_HEADER_LEN;

use crate::checksum::{IPPROTO_TCP, IPPROTO_UDP};

pub const ETHERTYPE_IPV4: u16 = 0x0800;

const IPV4_MIN_HEADER: usize = 20;
const IPV4_MAX_HEADER: usize = 60;
const TCP_MIN_HEADER: usize = 20;
const TCP_MAX_HEADER: usize = 60;
const UDP_HEADER: usize = 8;

/// Header bytes that cover the largest Ethernet + IPv4 + TCP header.
pub const MAX_HEADERS_LEN: usize = ETH_HEADER_LEN + IPV4_MAX_HEADER + TCP_MAX_HEADER;

/// TCP ACK flag.
pub const TCP_FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    Ok,
    /// Fewer bytes than the headers claim.
    TooSmall,
    /// Not IPv4 TCP/UDP, or inconsistent lengths.
    UnknownType,
}

#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub header: Vec<u8>,
    pub total_length: usize,
    pub parse_result: ParseResult,
    pub is_broadcast: bool,
    pub is_multicast: bool,
    pub ip_version: u8,
    pub ip_proto: u8,
    pub ip4_header_length: usize,
    /// IPv4 total length field.
    pub ip4_length: usize,
    /// TCP header length; 8 for UDP.
    pub tcp_header_length: usize,
    /// Transport payload bytes.
    pub tcp_length: usize,
    pub tcp_seq: u32,
}

#[inline]
pub fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

#[inline]
pub fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline]
pub fn put_be16(b: &mut [u8], at: usize, v: u16) {
    b[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn put_be32(b: &mut [u8], at: usize, v: u32) {
    b[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

impl PacketInfo {
    /// Parse `header` (the first `min(total_length, n)` bytes of a frame).
    pub fn parse(header: Vec<u8>, total_length: usize) -> Self {
        let mut pi = PacketInfo {
            header,
            total_length,
            parse_result: ParseResult::TooSmall,
            is_broadcast: false,
            is_multicast: false,
            ip_version: 0,
            ip_proto: 0,
            ip4_header_length: 0,
            ip4_length: 0,
            tcp_header_length: 0,
            tcp_length: 0,
            tcp_seq: 0,
        };
        pi.parse_result = pi.parse_headers();
        pi
    }

    fn parse_headers(&mut self) -> ParseResult {
        let h = &self.header;
        if self.total_length < ETH_HEADER_LEN || h.len() < ETH_HEADER_LEN {
            return ParseResult::TooSmall;
        }
        self.is_broadcast = h[..6] == [0xff; 6];
        self.is_multicast = !self.is_broadcast && h[0] & 0x01 != 0;

        if be16(h, 12) != ETHERTYPE_IPV4 {
            return ParseResult::UnknownType;
        }
        if h.len() < ETH_HEADER_LEN + IPV4_MIN_HEADER {
            return ParseResult::TooSmall;
        }
        let ip = ETH_HEADER_LEN;
        self.ip_version = h[ip] >> 4;
        if self.ip_version != 4 {
            return ParseResult::UnknownType;
        }
        self.ip4_header_length = ((h[ip] & 0x0f) as usize) << 2;
        if self.ip4_header_length < IPV4_MIN_HEADER {
            return ParseResult::UnknownType;
        }
        self.ip_proto = h[ip + 9];
        self.ip4_length = be16(h, ip + 2) as usize;

        let l4 = ip + self.ip4_header_length;
        self.tcp_header_length = match self.ip_proto {
            IPPROTO_TCP => {
                if h.len() < l4 + TCP_MIN_HEADER {
                    return ParseResult::TooSmall;
                }
                ((h[l4 + 12] & 0xf0) >> 2) as usize
            }
            IPPROTO_UDP => {
                if h.len() < l4 + UDP_HEADER {
                    return ParseResult::TooSmall;
                }
                UDP_HEADER
            }
            _ => return ParseResult::UnknownType,
        };
        if self.ip_proto == IPPROTO_TCP {
            if self.tcp_header_length < TCP_MIN_HEADER {
                return ParseResult::UnknownType;
            }
            if h.len() < l4 + self.tcp_header_length {
                return ParseResult::TooSmall;
            }
            self.tcp_seq = be32(h, l4 + 4);
        }
        if ETH_HEADER_LEN + self.ip4_length > self.total_length {
            return ParseResult::UnknownType;
        }
        if self.ip4_length < self.ip4_header_length + self.tcp_header_length {
            return ParseResult::UnknownType;
        }
        self.tcp_length = self.ip4_length - self.ip4_header_length - self.tcp_header_length;
        ParseResult::Ok
    }

    pub fn is_ok(&self) -> bool {
        self.parse_result == ParseResult::Ok
    }

    pub fn is_tcp(&self) -> bool {
        self.is_ok() && self.ip_proto == IPPROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.is_ok() && self.ip_proto == IPPROTO_UDP
    }

    /// Offset of the transport header.
    pub fn l4_offset(&self) -> usize {
        ETH_HEADER_LEN + self.ip4_header_length
    }

    /// Ethernet + IP + transport header bytes.
    pub fn headers_length(&self) -> usize {
        self.l4_offset() + self.tcp_header_length
    }

    /// Bytes covered by the IPv4 total length, from the Ethernet header on.
    pub fn ip_frame_length(&self) -> usize {
        ETH_HEADER_LEN + self.ip4_length
    }

    pub fn dest_mac(&self) -> &[u8] {
        &self.header[..6.min(self.header.len())]
    }

    pub fn src_ip(&self) -> &[u8] {
        &self.header[ETH_HEADER_LEN + 12..ETH_HEADER_LEN + 16]
    }

    pub fn dst_ip(&self) -> &[u8] {
        &self.header[ETH_HEADER_LEN + 16..ETH_HEADER_LEN + 20]
    }
}

/// Patch an IPv4 TCP header whose total-length field is zero (large-send
/// frames over 64 KiB carry none) with `frame_len - 14`.
/// Returns true if the field was rewritten.
pub fn fixup_zero_ip_length(header: &mut [u8], frame_len: usize) -> bool {
    let ip = ETH_HEADER_LEN;
    if header.len() < ip + IPV4_MIN_HEADER
        || be16(header, 12) != ETHERTYPE_IPV4
        || header[ip] >> 4 != 4
        || header[ip + 9] != IPPROTO_TCP
        || be16(header, ip + 2) != 0
    {
        return false;
    }
    let len = frame_len.saturating_sub(ETH_HEADER_LEN).min(u16::MAX as usize) as u16;
    put_be16(header, ip + 2, len);
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checksum::write_ipv4_header_checksum;

    /// Ethernet + IPv4 + TCP frame with `payload` after a 20-byte TCP header.
    pub(crate) fn tcp_frame(dest: [u8; 6], seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::with_capacity(54 + payload.len());
        f.extend_from_slice(&dest);
        f.extend_from_slice(&[0x00, 0x16, 0x3e, 0x11, 0x22, 0x33]);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = IPPROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        write_ipv4_header_checksum(&mut ip);
        f.extend_from_slice(&ip);
        let mut tcp = [0u8; 20];
        tcp[0..2].copy_from_slice(&1000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&2000u16.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        f.extend_from_slice(&tcp);
        f.extend_from_slice(payload);
        f
    }

    /// Ethernet + IPv4 + UDP frame.
    pub(crate) fn udp_frame(dest: [u8; 6], payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::with_capacity(42 + payload.len());
        f.extend_from_slice(&dest);
        f.extend_from_slice(&[0x00, 0x16, 0x3e, 0x11, 0x22, 0x33]);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((28 + payload.len()) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        write_ipv4_header_checksum(&mut ip);
        f.extend_from_slice(&ip);
        f.extend_from_slice(&5353u16.to_be_bytes());
        f.extend_from_slice(&5353u16.to_be_bytes());
        f.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(payload);
        f
    }

    pub(crate) const OUR_MAC: [u8; 6] = [0x00, 0x16, 0x3e, 0x00, 0x00, 0x01];

    #[test]
    fn test_parse_tcp() {
        let f = tcp_frame(OUR_MAC, 77, 0x18, &[0u8; 100]);
        let pi = PacketInfo::parse(f.clone(), f.len());
        assert_eq!(pi.parse_result, ParseResult::Ok);
        assert!(pi.is_tcp());
        assert_eq!(pi.ip4_header_length, 20);
        assert_eq!(pi.tcp_header_length, 20);
        assert_eq!(pi.tcp_length, 100);
        assert_eq!(pi.tcp_seq, 77);
        assert_eq!(pi.headers_length(), 54);
        assert!(!pi.is_multicast && !pi.is_broadcast);
    }

    #[test]
    fn test_parse_udp_broadcast() {
        let f = udp_frame([0xff; 6], &[1, 2, 3]);
        let pi = PacketInfo::parse(f.clone(), f.len());
        assert!(pi.is_udp());
        assert!(pi.is_broadcast);
        assert_eq!(pi.tcp_length, 3);
    }

    #[test]
    fn test_parse_short_and_unknown() {
        let pi = PacketInfo::parse(vec![0u8; 10], 10);
        assert_eq!(pi.parse_result, ParseResult::TooSmall);

        let mut arp = vec![0u8; 42];
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        let pi = PacketInfo::parse(arp, 42);
        assert_eq!(pi.parse_result, ParseResult::UnknownType);

        // Header truncated inside the TCP header.
        let f = tcp_frame(OUR_MAC, 0, 0, &[]);
        let pi = PacketInfo::parse(f[..40].to_vec(), f.len());
        assert_eq!(pi.parse_result, ParseResult::TooSmall);
    }

    #[test]
    fn test_ip_length_beyond_frame_is_unknown() {
        let mut f = tcp_frame(OUR_MAC, 0, 0, &[0u8; 10]);
        put_be16(&mut f, 16, 1000);
        let pi = PacketInfo::parse(f.clone(), f.len());
        assert_eq!(pi.parse_result, ParseResult::UnknownType);
    }

    #[test]
    fn test_fixup_zero_ip_length() {
        let mut f = tcp_frame(OUR_MAC, 0, 0, &[0u8; 10]);
        assert!(!fixup_zero_ip_length(&mut f, 64));
        put_be16(&mut f, 16, 0);
        assert!(fixup_zero_ip_length(&mut f, 70_000));
        assert_eq!(be16(&f, 16), u16::MAX);
    }
}
