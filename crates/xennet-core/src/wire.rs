//! Bit-exact slot layouts shared with the backend.
//!
//! # Memory layout
//!
//! Each direction has one shared page:
//!
//! ```text
//! 0x00: req_prod  (u32)   front-end writes
//! 0x04: req_event (u32)   front-end writes, backend reads
//! 0x08: rsp_prod  (u32)   backend writes
//! 0x0C: rsp_event (u32)   front-end writes, backend reads
//! 0x10: pad[48]
//! 0x40: slot[0] .. slot[N-1]
//! ```
//!
//! Requests and responses share the slot array (a slot holds whichever
//! was written last). Every multi-byte field is little-endian.
//!
//! A slot can also hold an extra-info record instead of a request or
//! response; the preceding slot's `EXTRA_INFO` flag says so. At the API
//! boundary this is modelled as [`TxSlot`] / [`RxSlot`] enums.

use std::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::grant::GrantRef;

pub const PAGE_SIZE: usize = 4096;
pub const RING_HEADER_SIZE: usize = 64;

pub const TX_SLOT_SIZE: usize = 12;
pub const RX_SLOT_SIZE: usize = 8;
pub const EXTRA_INFO_SIZE: usize = 8;

/// Ethernet header length (no VLAN tag).
pub const ETH_HEADER_LEN: usize = 14;
/// Upper bound on header look-ahead copied into RX header buffers.
pub const MAX_LOOKAHEAD: usize = 256;
/// Backend scatter-gather ceiling: slots per frame, header slot included.
pub const MAX_SG_SLOTS: usize = 19;

/// Shared ring header field offsets.
pub mod offsets {
    pub const REQ_PROD: usize = 0x00;
    pub const REQ_EVENT: usize = 0x04;
    pub const RSP_PROD: usize = 0x08;
    pub const RSP_EVENT: usize = 0x0C;
}

/// Slots in a ring: usable page bytes / slot size, rounded down to a power of two.
pub const fn ring_capacity(slot_size: usize) -> u32 {
    let slots = (PAGE_SIZE - RING_HEADER_SIZE) / slot_size;
    let mut cap = 1usize;
    while cap * 2 <= slots {
        cap *= 2;
    }
    cap as u32
}

pub const TX_RING_SIZE: u32 = ring_capacity(TX_SLOT_SIZE);
pub const RX_RING_SIZE: u32 = ring_capacity(RX_SLOT_SIZE);

const_assert_eq!(TX_RING_SIZE, 256);
const_assert_eq!(RX_RING_SIZE, 256);
const_assert_eq!(EXTRA_INFO_SIZE, RX_SLOT_SIZE);

/// Response status codes.
pub mod status {
    pub const OKAY: i16 = 0;
    pub const ERROR: i16 = -1;
    pub const DROPPED: i16 = -2;
    /// Padding response for a TX extra-info slot.
    pub const NULL: i16 = 1;
}

/// Extra-info type and flag values.
pub mod extra {
    pub const TYPE_GSO: u8 = 1;
    pub const FLAG_MORE: u8 = 1;
    pub const GSO_TYPE_TCPV4: u8 = 1;
}

bitflags! {
    /// Flags carried by a TX request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxFlags: u16 {
        const CSUM_BLANK = 1 << 0;
        const DATA_VALIDATED = 1 << 1;
        const MORE_DATA = 1 << 2;
        const EXTRA_INFO = 1 << 3;
    }
}

bitflags! {
    /// Flags carried by an RX response. Note the bit order differs from TX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxFlags: u16 {
        const DATA_VALIDATED = 1 << 0;
        const CSUM_BLANK = 1 << 1;
        const MORE_DATA = 1 << 2;
        const EXTRA_INFO = 1 << 3;
    }
}

/// Which ring a value belongs to. Used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => write!(f, "tx"),
            Direction::Rx => write!(f, "rx"),
        }
    }
}

#[inline]
fn get_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

#[inline]
fn get_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline]
fn put_u16(b: &mut [u8], at: usize, v: u16) {
    b[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u32(b: &mut [u8], at: usize, v: u32) {
    b[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

// ── TX ring ──

/// `{gref u32, offset u16, flags u16, id u16, size u16}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub gref: GrantRef,
    pub offset: u16,
    pub flags: TxFlags,
    pub id: u16,
    /// Bytes in this slot. On the first slot of a frame: the whole frame length.
    pub size: u16,
}

impl TxRequest {
    pub fn encode(&self) -> [u8; TX_SLOT_SIZE] {
        let mut b = [0u8; TX_SLOT_SIZE];
        put_u32(&mut b, 0, self.gref.0);
        put_u16(&mut b, 4, self.offset);
        put_u16(&mut b, 6, self.flags.bits());
        put_u16(&mut b, 8, self.id);
        put_u16(&mut b, 10, self.size);
        b
    }

    pub fn decode(b: &[u8]) -> Self {
        Self {
            gref: GrantRef(get_u32(b, 0)),
            offset: get_u16(b, 4),
            flags: TxFlags::from_bits_retain(get_u16(b, 6)),
            id: get_u16(b, 8),
            size: get_u16(b, 10),
        }
    }
}

/// `{id u16, status i16}`, stored in a 12-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResponse {
    pub id: u16,
    pub status: i16,
}

impl TxResponse {
    pub fn encode(&self) -> [u8; TX_SLOT_SIZE] {
        let mut b = [0u8; TX_SLOT_SIZE];
        put_u16(&mut b, 0, self.id);
        put_u16(&mut b, 2, self.status as u16);
        b
    }

    pub fn decode(b: &[u8]) -> Self {
        Self { id: get_u16(b, 0), status: get_u16(b, 2) as i16 }
    }
}

/// A TX request slot: either a data request or an extra-info record
/// following a request flagged `EXTRA_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSlot {
    Request(TxRequest),
    Extra(ExtraInfo),
}

impl TxSlot {
    pub fn encode(&self) -> [u8; TX_SLOT_SIZE] {
        match self {
            TxSlot::Request(req) => req.encode(),
            TxSlot::Extra(ei) => {
                let mut b = [0u8; TX_SLOT_SIZE];
                b[..EXTRA_INFO_SIZE].copy_from_slice(&ei.encode());
                b
            }
        }
    }

    pub fn decode(b: &[u8], expect_extra: bool) -> Self {
        if expect_extra {
            TxSlot::Extra(ExtraInfo::decode(b))
        } else {
            TxSlot::Request(TxRequest::decode(b))
        }
    }
}

// ── RX ring ──

/// `{id u16, pad u16, gref u32}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRequest {
    pub id: u16,
    pub gref: GrantRef,
}

impl RxRequest {
    pub fn encode(&self) -> [u8; RX_SLOT_SIZE] {
        let mut b = [0u8; RX_SLOT_SIZE];
        put_u16(&mut b, 0, self.id);
        put_u32(&mut b, 4, self.gref.0);
        b
    }

    pub fn decode(b: &[u8]) -> Self {
        Self { id: get_u16(b, 0), gref: GrantRef(get_u32(b, 4)) }
    }
}

/// `{id u16, offset u16, flags u16, status i16}`
///
/// `status` is the data length when positive, an error code otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxResponse {
    pub id: u16,
    pub offset: u16,
    pub flags: RxFlags,
    pub status: i16,
}

impl RxResponse {
    pub fn encode(&self) -> [u8; RX_SLOT_SIZE] {
        let mut b = [0u8; RX_SLOT_SIZE];
        put_u16(&mut b, 0, self.id);
        put_u16(&mut b, 2, self.offset);
        put_u16(&mut b, 4, self.flags.bits());
        put_u16(&mut b, 6, self.status as u16);
        b
    }

    pub fn decode(b: &[u8]) -> Self {
        Self {
            id: get_u16(b, 0),
            offset: get_u16(b, 2),
            flags: RxFlags::from_bits_retain(get_u16(b, 4)),
            status: get_u16(b, 6) as i16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxSlot {
    Response(RxResponse),
    Extra(ExtraInfo),
}

impl RxSlot {
    pub fn encode(&self) -> [u8; RX_SLOT_SIZE] {
        match self {
            RxSlot::Response(rsp) => rsp.encode(),
            RxSlot::Extra(ei) => ei.encode(),
        }
    }

    pub fn decode(b: &[u8], expect_extra: bool) -> Self {
        if expect_extra {
            RxSlot::Extra(ExtraInfo::decode(b))
        } else {
            RxSlot::Response(RxResponse::decode(b))
        }
    }
}

// ── Extra info ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraKind {
    Gso { size: u16, gso_type: u8, features: u16 },
    /// Any type this engine does not interpret; kept verbatim.
    Unknown { type_tag: u8, payload: [u8; 6] },
}

/// `{type u8, flags u8, union[6]}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraInfo {
    pub kind: ExtraKind,
    /// Another extra-info record follows.
    pub more: bool,
}

impl ExtraInfo {
    pub fn gso_tcpv4(mss: u16) -> Self {
        Self {
            kind: ExtraKind::Gso { size: mss, gso_type: extra::GSO_TYPE_TCPV4, features: 0 },
            more: false,
        }
    }

    pub fn encode(&self) -> [u8; EXTRA_INFO_SIZE] {
        let mut b = [0u8; EXTRA_INFO_SIZE];
        b[1] = if self.more { extra::FLAG_MORE } else { 0 };
        match self.kind {
            ExtraKind::Gso { size, gso_type, features } => {
                b[0] = extra::TYPE_GSO;
                put_u16(&mut b, 2, size);
                b[4] = gso_type;
                put_u16(&mut b, 6, features);
            }
            ExtraKind::Unknown { type_tag, payload } => {
                b[0] = type_tag;
                b[2..8].copy_from_slice(&payload);
            }
        }
        b
    }

    pub fn decode(b: &[u8]) -> Self {
        let more = b[1] & extra::FLAG_MORE != 0;
        let kind = if b[0] == extra::TYPE_GSO {
            ExtraKind::Gso { size: get_u16(b, 2), gso_type: b[4], features: get_u16(b, 6) }
        } else {
            let mut payload = [0u8; 6];
            payload.copy_from_slice(&b[2..8]);
            ExtraKind::Unknown { type_tag: b[0], payload }
        };
        Self { kind, more }
    }
}

// ── Ring kinds ──

/// Binds a ring's slot size, capacity and slot types together so one
/// ring implementation serves both directions and both peers.
pub trait RingKind {
    const DIRECTION: Direction;
    const SLOT_SIZE: usize;
    const CAPACITY: u32;
    type Request: Copy;
    type Response: Copy;

    fn encode_request(req: &Self::Request, out: &mut [u8]);
    fn decode_request(b: &[u8], expect_extra: bool) -> Self::Request;
    fn encode_response(rsp: &Self::Response, out: &mut [u8]);
    fn decode_response(b: &[u8], expect_extra: bool) -> Self::Response;
}

pub struct TxRing;
pub struct RxRing;

impl RingKind for TxRing {
    const DIRECTION: Direction = Direction::Tx;
    const SLOT_SIZE: usize = TX_SLOT_SIZE;
    const CAPACITY: u32 = TX_RING_SIZE;
    type Request = TxSlot;
    type Response = TxResponse;

    fn encode_request(req: &TxSlot, out: &mut [u8]) {
        out.copy_from_slice(&req.encode());
    }

    fn decode_request(b: &[u8], expect_extra: bool) -> TxSlot {
        TxSlot::decode(b, expect_extra)
    }

    fn encode_response(rsp: &TxResponse, out: &mut [u8]) {
        out.copy_from_slice(&rsp.encode());
    }

    fn decode_response(b: &[u8], _expect_extra: bool) -> TxResponse {
        TxResponse::decode(b)
    }
}

impl RingKind for RxRing {
    const DIRECTION: Direction = Direction::Rx;
    const SLOT_SIZE: usize = RX_SLOT_SIZE;
    const CAPACITY: u32 = RX_RING_SIZE;
    type Request = RxRequest;
    type Response = RxSlot;

    fn encode_request(req: &RxRequest, out: &mut [u8]) {
        out.copy_from_slice(&req.encode());
    }

    fn decode_request(b: &[u8], _expect_extra: bool) -> RxRequest {
        RxRequest::decode(b)
    }

    fn encode_response(rsp: &RxSlot, out: &mut [u8]) {
        out.copy_from_slice(&rsp.encode());
    }

    fn decode_response(b: &[u8], expect_extra: bool) -> RxSlot {
        RxSlot::decode(b, expect_extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity_rounds_down() {
        assert_eq!(ring_capacity(12), 256); // 336 slots fit
        assert_eq!(ring_capacity(8), 256); // 504 slots fit
        assert_eq!(ring_capacity(16), 128); // 252 slots fit
        assert_eq!(ring_capacity(4032), 1);
    }

    #[test]
    fn test_tx_request_layout() {
        let req = TxRequest {
            gref: GrantRef(0x11223344),
            offset: 0x0102,
            flags: TxFlags::MORE_DATA | TxFlags::CSUM_BLANK,
            id: 0x00ab,
            size: 1514,
        };
        let b = req.encode();
        assert_eq!(&b[0..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&b[4..6], &[0x02, 0x01]);
        assert_eq!(&b[6..8], &[0x05, 0x00]);
        assert_eq!(&b[8..10], &[0xab, 0x00]);
        assert_eq!(u16::from_le_bytes([b[10], b[11]]), 1514);
        assert_eq!(TxRequest::decode(&b), req);
    }

    #[test]
    fn test_rx_response_negative_status() {
        let rsp = RxResponse { id: 7, offset: 0, flags: RxFlags::empty(), status: status::DROPPED };
        let b = rsp.encode();
        assert_eq!(&b[6..8], &[0xfe, 0xff]);
        assert_eq!(RxResponse::decode(&b).status, -2);
    }

    #[test]
    fn test_rx_flag_bits_differ_from_tx() {
        assert_eq!(RxFlags::CSUM_BLANK.bits(), TxFlags::DATA_VALIDATED.bits());
        assert_eq!(RxFlags::DATA_VALIDATED.bits(), TxFlags::CSUM_BLANK.bits());
        assert_eq!(RxFlags::MORE_DATA.bits(), TxFlags::MORE_DATA.bits());
    }

    #[test]
    fn test_gso_extra_layout() {
        let ei = ExtraInfo::gso_tcpv4(1448);
        let b = ei.encode();
        assert_eq!(b[0], extra::TYPE_GSO);
        assert_eq!(b[1], 0);
        assert_eq!(u16::from_le_bytes([b[2], b[3]]), 1448);
        assert_eq!(b[4], extra::GSO_TYPE_TCPV4);
        assert_eq!(b[5], 0);

        let slot = TxSlot::Extra(ei).encode();
        assert_eq!(&slot[8..], &[0, 0, 0, 0]);
        assert_eq!(TxSlot::decode(&slot, true), TxSlot::Extra(ei));
    }

    #[test]
    fn test_unknown_extra_kept_verbatim() {
        let raw = [2u8, extra::FLAG_MORE, 1, 2, 3, 4, 5, 6];
        let ei = ExtraInfo::decode(&raw);
        assert!(ei.more);
        assert_eq!(ei.kind, ExtraKind::Unknown { type_tag: 2, payload: [1, 2, 3, 4, 5, 6] });
        assert_eq!(ei.encode(), raw);
    }

    #[test]
    fn test_rx_slot_context_decides_variant() {
        let rsp = RxResponse { id: 3, offset: 0, flags: RxFlags::MORE_DATA, status: 100 };
        let b = rsp.encode();
        assert_eq!(RxSlot::decode(&b, false), RxSlot::Response(rsp));
        assert!(matches!(RxSlot::decode(&b, true), RxSlot::Extra(_)));
    }
}
