//! RX path: keep the ring stocked with buffers, turn response chains
//! into frames.
//!
//! A pass runs in three steps under the RX lock:
//!
//! 1. Drain responses into buffer chains (`MORE_DATA` / `EXTRA_INFO`
//!    links), stopping early at the packet or byte quota. A chain cut
//!    off by the end of the published responses is carried over.
//! 2. Refill the ring.
//! 3. Build frames: filter, optionally split large TCP segments, fill
//!    in checksum annotations. The ring's reference on every chain
//!    buffer is dropped once the frames hold their own.
//!
//! The returned frames go to the shim after the lock is released.

use std::sync::Arc;

use log::{debug, error, warn};

use xennet_core::config::{NetfrontConfig, Options, PacketFilter, RxSplitPolicy};
use xennet_core::error::ProtocolViolation;
use xennet_core::frame::{BufferId, CastKind, ChecksumResult, RxChecksum, RxFrame, RxSegment};
use xennet_core::grant::GrantTable;
use xennet_core::page::Page;
use xennet_core::state::DeviceState;
use xennet_core::wire::{
    extra, Direction, ExtraInfo, ExtraKind, RxFlags, RxRequest, RxResponse, RxRing, ETH_HEADER_LEN, PAGE_SIZE,
    RX_RING_SIZE,
};

use crate::checksum::{
    ipv4_header_checksum_ok, transport_checksum_ipv4, transport_checksum_ok, write_ipv4_header_checksum,
    TCP_CSUM_OFFSET, UDP_CSUM_OFFSET,
};
use crate::packet::{put_be16, put_be32, PacketInfo, MAX_HEADERS_LEN, TCP_FLAG_ACK};
use crate::pool::{BufferKind, BufferPool};
use crate::ring::FrontRing;
use crate::stats::Stats;

/// Outcome of an event-handling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Everything published was consumed; notifications are re-armed.
    Idle,
    /// A quota stopped the pass. Call `handle_event` again.
    Reschedule,
}

/// The settings the RX path reads on every pass.
#[derive(Debug, Clone)]
pub struct RxConfig {
    pub options: Options,
    pub target: u32,
    pub packet_quota: u32,
    pub byte_quota: u64,
    pub lookahead: usize,
    pub mac_address: [u8; 6],
    pub packet_filter: PacketFilter,
    pub multicast_list: Vec<[u8; 6]>,
}

impl RxConfig {
    pub fn from_config(cfg: &NetfrontConfig) -> Self {
        Self {
            options: cfg.options,
            target: cfg.rx_target,
            packet_quota: cfg.rx_packet_quota,
            byte_quota: cfg.rx_byte_quota,
            lookahead: cfg.lookahead,
            mac_address: cfg.mac_address,
            packet_filter: cfg.packet_filter,
            multicast_list: cfg.multicast_list.clone(),
        }
    }
}

pub struct RxPass {
    pub drain: Drain,
    /// The refill published requests the backend wants to hear about.
    pub notify: bool,
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    buffer: BufferId,
    offset: u16,
    len: u16,
}

/// Buffers of one frame as they come off the ring.
#[derive(Debug, Default)]
struct Chain {
    pieces: Vec<Piece>,
    total: usize,
    started: bool,
    errored: bool,
    more_data: bool,
    extra_pending: bool,
    csum_blank: bool,
    data_validated: bool,
    gso_mss: u32,
}

impl Chain {
    fn is_complete(&self) -> bool {
        self.started && !self.more_data && !self.extra_pending
    }
}

/// What the backend told us about a chain's checksums.
#[derive(Debug, Clone, Copy)]
struct ChecksumHints {
    blank: bool,
    validated: bool,
    gso: bool,
}

impl ChecksumHints {
    fn vouched(self) -> bool {
        self.blank || self.validated || self.gso
    }
}

pub struct RxPath<G: GrantTable> {
    ring: FrontRing<RxRing>,
    pool: BufferPool<G>,
    /// Buffer offered in each ring slot.
    slots: Vec<Option<BufferId>>,
    partial: Chain,
    /// Frames handed to the shim and not yet returned.
    outstanding: usize,
    config: RxConfig,
}

impl<G: GrantTable> RxPath<G> {
    pub fn new(page: Arc<Page>, grants: G, freelist_max: usize, config: RxConfig) -> Self {
        Self {
            ring: FrontRing::new(page),
            pool: BufferPool::new(grants, freelist_max),
            slots: vec![None; RX_RING_SIZE as usize],
            partial: Chain::default(),
            outstanding: 0,
            config,
        }
    }

    pub fn ring_page(&self) -> &Arc<Page> {
        self.ring.page()
    }

    pub fn config(&self) -> &RxConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RxConfig {
        &mut self.config
    }

    pub fn pool(&self) -> &BufferPool<G> {
        &self.pool
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Buffers currently offered to the backend.
    pub fn offered(&self) -> u32 {
        self.ring.outstanding()
    }

    // ── Refill ──

    /// Top the ring up to the target once it has fallen a quarter below.
    /// Returns the ring's notify verdict.
    pub fn fill(&mut self, state: DeviceState) -> bool {
        if !state.is_active() {
            return false;
        }
        let target = self.config.target;
        let batch = target.saturating_sub(self.ring.outstanding());
        if batch < target / 4 {
            return false;
        }
        for _ in 0..batch {
            let Some(id) = self.pool.acquire(BufferKind::Page, state.accepts_allocation()) else {
                debug!("rx fill: out of page buffers");
                break;
            };
            let slot = (self.ring.req_prod_pvt() & (RX_RING_SIZE - 1)) as usize;
            if self.slots[slot].is_some() {
                error!("rx fill: slot {} still holds a buffer", slot);
                self.release(id);
                break;
            }
            let req = RxRequest { id: slot as u16, gref: self.pool.gref(id) };
            if self.ring.offer_request(&req).is_err() {
                self.release(id);
                break;
            }
            self.slots[slot] = Some(id);
        }
        self.ring.push_and_check_notify()
    }

    // ── Drain ──

    pub fn poll(
        &mut self,
        state: DeviceState,
        stats: &Stats,
        out: &mut Vec<RxFrame>,
    ) -> Result<RxPass, ProtocolViolation> {
        if !state.is_active() {
            return Ok(RxPass { drain: Drain::Idle, notify: false });
        }
        let mut chain = std::mem::take(&mut self.partial);
        let mut completed = Vec::new();
        let drained = self.drain_ring(&mut chain, &mut completed, stats);
        self.partial = chain;
        let quota_hit = match drained {
            Ok(hit) => hit,
            Err(v) => {
                for c in completed {
                    self.release_chain(&c);
                }
                return Err(v);
            }
        };

        let notify = self.fill(state);

        for c in completed {
            self.make_packets(c, state, stats, out);
        }
        let drain = if quota_hit { Drain::Reschedule } else { Drain::Idle };
        Ok(RxPass { drain, notify })
    }

    /// Returns true if a quota stopped the drain.
    fn drain_ring(
        &mut self,
        chain: &mut Chain,
        completed: &mut Vec<Chain>,
        stats: &Stats,
    ) -> Result<bool, ProtocolViolation> {
        let Self { ring, pool, slots, config, .. } = self;
        let mut packets = 0u32;
        let mut bytes = 0u64;
        let mut responses = ring.responses();
        loop {
            if packets >= config.packet_quota || bytes >= config.byte_quota {
                return Ok(true);
            }
            let raw = match responses.next() {
                Some(raw) => raw?,
                None => return Ok(false),
            };
            let slot = raw.slot() as usize;
            let Some(buffer) = slots[slot].take() else {
                return Err(ProtocolViolation::UnknownId { ring: Direction::Rx, id: slot as u16 });
            };

            if chain.extra_pending {
                // The buffer offered in this slot carries no data.
                let ei = ExtraInfo::decode(raw.bytes());
                match ei.kind {
                    ExtraKind::Gso { size, gso_type, .. } if gso_type == extra::GSO_TYPE_TCPV4 => {
                        chain.gso_mss = size as u32;
                    }
                    ExtraKind::Gso { gso_type, .. } => warn!("rx: unsupported gso type {}", gso_type),
                    ExtraKind::Unknown { type_tag, .. } => warn!("rx: unknown extra info type {}", type_tag),
                }
                chain.extra_pending = ei.more;
                release_logged(pool, buffer);
            } else {
                let rsp = RxResponse::decode(raw.bytes());
                if rsp.id as usize != slot {
                    release_logged(pool, buffer);
                    return Err(ProtocolViolation::MisplacedResponse { id: rsp.id, slot: slot as u16 });
                }
                if !chain.started {
                    chain.started = true;
                    chain.csum_blank = rsp.flags.contains(RxFlags::CSUM_BLANK);
                    chain.data_validated = rsp.flags.contains(RxFlags::DATA_VALIDATED);
                }
                if rsp.status <= 0 {
                    warn!("rx: slot {} status {}, dropping frame", slot, rsp.status);
                    chain.errored = true;
                    release_logged(pool, buffer);
                } else if rsp.offset as usize + rsp.status as usize > PAGE_SIZE {
                    release_logged(pool, buffer);
                    return Err(ProtocolViolation::MalformedLength {
                        id: rsp.id,
                        offset: rsp.offset,
                        len: rsp.status,
                    });
                } else {
                    chain.pieces.push(Piece { buffer, offset: rsp.offset, len: rsp.status as u16 });
                    chain.total += rsp.status as usize;
                }
                chain.more_data = rsp.flags.contains(RxFlags::MORE_DATA);
                chain.extra_pending = rsp.flags.contains(RxFlags::EXTRA_INFO);
            }

            if chain.is_complete() {
                let done = std::mem::take(chain);
                if done.errored {
                    stats.rx_error();
                }
                packets += 1;
                bytes += done.total as u64;
                completed.push(done);
            }
        }
    }

    // ── Frame construction ──

    fn make_packets(&mut self, chain: Chain, state: DeviceState, stats: &Stats, out: &mut Vec<RxFrame>) {
        if chain.errored || chain.pieces.is_empty() {
            self.release_chain(&chain);
            return;
        }
        let total = chain.total;
        let lookahead_len = (ETH_HEADER_LEN + self.config.lookahead).min(total);
        let gather_len = lookahead_len.max(MAX_HEADERS_LEN.min(total));
        let header = self.gather(&chain.pieces, gather_len);
        let pi = PacketInfo::parse(header, total);

        if total < ETH_HEADER_LEN {
            debug!("rx: runt frame of {} bytes", total);
            stats.rx_error();
            self.release_chain(&chain);
            return;
        }
        if !self.accepts(&pi) {
            stats.rx_filtered();
            self.release_chain(&chain);
            return;
        }

        let mut mss = chain.gso_mss as usize;
        if pi.is_tcp() && mss > 0 && pi.tcp_length > mss {
            mss = match self.config.options.rx_split_policy {
                RxSplitPolicy::BySegment => mss,
                RxSplitPolicy::ByHalf => ((pi.tcp_length + 1) / 2).max(mss),
                RxSplitPolicy::None => u16::MAX as usize,
            };
        }
        let hints = ChecksumHints { blank: chain.csum_blank, validated: chain.data_validated, gso: chain.gso_mss > 0 };
        let may_allocate = state.accepts_allocation();

        if pi.is_tcp() && mss > 0 && pi.tcp_length > mss {
            self.make_split(&chain, &pi, mss, may_allocate, stats, out);
        } else {
            self.make_packet(&chain, &pi, lookahead_len, hints, may_allocate, stats, out);
        }
        // Drop the ring's references; frames hold their own.
        self.release_chain(&chain);
    }

    #[allow(clippy::too_many_arguments)]
    fn make_packet(
        &mut self,
        chain: &Chain,
        pi: &PacketInfo,
        lookahead_len: usize,
        hints: ChecksumHints,
        may_allocate: bool,
        stats: &Stats,
        out: &mut Vec<RxFrame>,
    ) {
        let total = chain.total;
        let in_place =
            chain.pieces.len() == 1 || (self.config.options.coalesce_small_frames && total <= PAGE_SIZE);
        let mut segments = Vec::with_capacity(chain.pieces.len() + 1);
        if in_place {
            if !self.append_views(&chain.pieces, 0, total, &mut segments) {
                self.drop_segments(segments);
                stats.rx_dropped();
                return;
            }
        } else {
            let headers = if pi.is_ok() { pi.headers_length() } else { 0 };
            let header_len = lookahead_len.max(headers).min(total);
            let Some(hb) = self.header_segment(&pi.header[..header_len], may_allocate) else {
                stats.rx_dropped();
                return;
            };
            segments.push(hb);
            if !self.append_views(&chain.pieces, header_len, total - header_len, &mut segments) {
                self.drop_segments(segments);
                stats.rx_dropped();
                return;
            }
        }

        let checksum = self.annotate_checksum(pi, hints, &segments, stats);
        let cast = CastKind::of(pi.dest_mac());
        stats.rx_frame(cast, total);
        self.outstanding += 1;
        out.push(RxFrame::new(segments, checksum, cast));
    }

    /// One frame per `mss` bytes of TCP payload, each with its own copy
    /// of the headers. Running out of buffers part way keeps the frames
    /// already built and drops the rest of the payload.
    fn make_split(
        &mut self,
        chain: &Chain,
        pi: &PacketInfo,
        mss: usize,
        may_allocate: bool,
        stats: &Stats,
        out: &mut Vec<RxFrame>,
    ) {
        let headers_len = pi.headers_length();
        let ip = ETH_HEADER_LEN;
        let ihl = pi.ip4_header_length;
        let l4 = pi.l4_offset();
        let flags_at = l4 + 13;
        let template = &pi.header[..headers_len];
        let orig_flags = template[flags_at];

        let mut remaining = pi.tcp_length;
        let mut cursor = headers_len;
        let mut seq = pi.tcp_seq;
        while remaining > 0 {
            let seg = remaining.min(mss);
            let mut h = template.to_vec();
            put_be16(&mut h, ip + 2, (ihl + pi.tcp_header_length + seg) as u16);
            put_be32(&mut h, l4 + 4, seq);
            if seg < remaining {
                h[flags_at] = orig_flags & TCP_FLAG_ACK;
            }
            write_ipv4_header_checksum(&mut h[ip..ip + ihl]);

            let Some(hb) = self.header_segment(&h, may_allocate) else {
                stats.rx_dropped();
                return;
            };
            let mut segments = vec![hb];
            if !self.append_views(&chain.pieces, cursor, seg, &mut segments) {
                self.drop_segments(segments);
                stats.rx_dropped();
                return;
            }
            let checksum = RxChecksum {
                ip: ChecksumResult::Succeeded,
                tcp: ChecksumResult::Succeeded,
                udp: ChecksumResult::NotChecked,
            };
            let cast = CastKind::of(pi.dest_mac());
            let len = headers_len + seg;
            stats.rx_frame(cast, len);
            self.outstanding += 1;
            out.push(RxFrame::new(segments, checksum, cast));

            seq = seq.wrapping_add(seg as u32);
            remaining -= seg;
            cursor += seg;
        }
    }

    fn accepts(&self, pi: &PacketInfo) -> bool {
        let filter = self.config.packet_filter;
        if filter.contains(PacketFilter::PROMISCUOUS) {
            return true;
        }
        if pi.is_broadcast {
            return filter.contains(PacketFilter::BROADCAST);
        }
        let dest = pi.dest_mac();
        if pi.is_multicast {
            if filter.contains(PacketFilter::ALL_MULTICAST) {
                return true;
            }
            return filter.contains(PacketFilter::MULTICAST)
                && self.config.multicast_list.iter().any(|m| m[..] == *dest);
        }
        filter.contains(PacketFilter::DIRECTED) && dest == self.config.mac_address
    }

    fn annotate_checksum(
        &self,
        pi: &PacketInfo,
        hints: ChecksumHints,
        segments: &[RxSegment],
        stats: &Stats,
    ) -> RxChecksum {
        let mut r = RxChecksum::default();
        if !(pi.is_tcp() || pi.is_udp()) {
            return r;
        }
        let (csum_offset, is_tcp) = if pi.is_tcp() { (TCP_CSUM_OFFSET, true) } else { (UDP_CSUM_OFFSET, false) };
        let l4 = pi.l4_offset();
        let l4_len = pi.ip4_length - pi.ip4_header_length;

        let l4_result = if hints.vouched() {
            r.ip = ChecksumResult::Succeeded;
            if hints.blank {
                // The backend left the transport checksum for us to fill in.
                let segment = read_segments(segments, l4, l4_len);
                let csum = transport_checksum_ipv4(pi.src_ip(), pi.dst_ip(), pi.ip_proto, &segment, csum_offset);
                write_segments(segments, l4 + csum_offset, &csum.to_be_bytes());
            }
            ChecksumResult::Succeeded
        } else if self.config.options.verify_rx_checksums {
            let ip_ok = ipv4_header_checksum_ok(&pi.header[ETH_HEADER_LEN..l4]);
            r.ip = if ip_ok { ChecksumResult::Succeeded } else { ChecksumResult::Failed };
            let segment = read_segments(segments, l4, l4_len);
            if transport_checksum_ok(pi.src_ip(), pi.dst_ip(), pi.ip_proto, &segment, csum_offset) {
                ChecksumResult::Succeeded
            } else {
                stats.rx_checksum_failed();
                ChecksumResult::Failed
            }
        } else {
            ChecksumResult::NotChecked
        };
        if is_tcp {
            r.tcp = l4_result;
        } else {
            r.udp = l4_result;
        }
        r
    }

    // ── Buffer plumbing ──

    /// Copy the first `len` bytes of a chain.
    fn gather(&self, pieces: &[Piece], len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        let mut at = 0;
        for p in pieces {
            if at == len {
                break;
            }
            let Some(page) = self.pool.page(p.buffer) else { break };
            let n = (p.len as usize).min(len - at);
            page.read(p.offset as usize, &mut v[at..at + n]);
            at += n;
        }
        v.truncate(at);
        v
    }

    fn header_segment(&mut self, bytes: &[u8], may_allocate: bool) -> Option<RxSegment> {
        let Some(hb) = self.pool.acquire(BufferKind::Header, may_allocate) else {
            debug!("rx: out of header buffers");
            return None;
        };
        let page = self.pool.page(hb)?.clone();
        page.write(0, bytes);
        Some(RxSegment { buffer: hb, page, offset: 0, len: bytes.len() as u16 })
    }

    /// Append views of `len` chain bytes starting `skip` bytes in,
    /// retaining every buffer touched.
    fn append_views(&mut self, pieces: &[Piece], mut skip: usize, mut len: usize, out: &mut Vec<RxSegment>) -> bool {
        for p in pieces {
            if len == 0 {
                break;
            }
            let plen = p.len as usize;
            if skip >= plen {
                skip -= plen;
                continue;
            }
            let n = (plen - skip).min(len);
            let Some(page) = self.pool.page(p.buffer).cloned() else { return false };
            if self.pool.retain(p.buffer).is_err() {
                return false;
            }
            out.push(RxSegment { buffer: p.buffer, page, offset: p.offset + skip as u16, len: n as u16 });
            skip = 0;
            len -= n;
        }
        true
    }

    fn drop_segments(&mut self, segments: Vec<RxSegment>) {
        for seg in segments {
            self.release(seg.buffer);
        }
    }

    fn release(&mut self, id: BufferId) {
        release_logged(&mut self.pool, id);
    }

    fn release_chain(&mut self, chain: &Chain) {
        for p in &chain.pieces {
            self.release(p.buffer);
        }
    }

    // ── Frames coming back ──

    /// Take back a frame from the shim. Returns frames still outstanding.
    pub fn return_frame(&mut self, frame: RxFrame) -> usize {
        for seg in frame.into_segments() {
            self.release(seg.buffer);
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        self.outstanding
    }

    /// Reclaim offered buffers and free the pool. Returns buffers still
    /// referenced (frames the shim holds; expected 0 after the drain).
    pub fn teardown(&mut self) -> usize {
        for slot in 0..self.slots.len() {
            if let Some(id) = self.slots[slot].take() {
                self.release(id);
            }
        }
        let partial = std::mem::take(&mut self.partial);
        self.release_chain(&partial);
        self.pool.teardown()
    }
}

fn release_logged<G: GrantTable>(pool: &mut BufferPool<G>, id: BufferId) {
    if let Err(e) = pool.release(id) {
        error!("rx: {}", e);
    }
}

/// Copy `len` frame bytes starting at `offset`.
fn read_segments(segments: &[RxSegment], mut offset: usize, len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    let mut at = 0;
    for seg in segments {
        if at == len {
            break;
        }
        let slen = seg.len as usize;
        if offset >= slen {
            offset -= slen;
            continue;
        }
        let n = (slen - offset).min(len - at);
        seg.page.read(seg.offset as usize + offset, &mut v[at..at + n]);
        at += n;
        offset = 0;
    }
    v.truncate(at);
    v
}

/// Overwrite frame bytes starting at `offset`.
fn write_segments(segments: &[RxSegment], mut offset: usize, mut bytes: &[u8]) {
    for seg in segments {
        if bytes.is_empty() {
            break;
        }
        let slen = seg.len as usize;
        if offset >= slen {
            offset -= slen;
            continue;
        }
        let n = (slen - offset).min(bytes.len());
        seg.page.write(seg.offset as usize + offset, &bytes[..n]);
        bytes = &bytes[n..];
        offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{tcp_frame, OUR_MAC};
    use xennet_module::LocalGrantTable;

    fn rx_path() -> RxPath<Arc<LocalGrantTable>> {
        let cfg = NetfrontConfig::new().mac_address(OUR_MAC);
        let page = Page::new().unwrap();
        RxPath::new(page, Arc::new(LocalGrantTable::default()), 64, RxConfig::from_config(&cfg))
    }

    /// A completed one-buffer chain holding `frame`.
    fn chain_of(rx: &mut RxPath<Arc<LocalGrantTable>>, frame: &[u8], gso_mss: u32) -> Chain {
        let buffer = rx.pool.acquire(BufferKind::Page, true).unwrap();
        rx.pool.page(buffer).unwrap().write(0, frame);
        Chain {
            pieces: vec![Piece { buffer, offset: 0, len: frame.len() as u16 }],
            total: frame.len(),
            started: true,
            data_validated: true,
            gso_mss,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_keeps_segments_built_before_shortage() {
        let mut rx = rx_path();
        // One cached header buffer, and no fresh ones.
        let hb = rx.pool.acquire(BufferKind::Header, true).unwrap();
        rx.pool.release(hb).unwrap();

        let payload: Vec<u8> = (0..3000).map(|i| i as u8).collect();
        let frame = tcp_frame(OUR_MAC, 100, 0x18, &payload);
        let chain = chain_of(&mut rx, &frame, 1000);
        let pi = PacketInfo::parse(rx.gather(&chain.pieces, MAX_HEADERS_LEN), chain.total);
        assert!(pi.is_tcp());

        let stats = Stats::new();
        let mut out = Vec::new();
        rx.make_split(&chain, &pi, 1000, false, &stats, &mut out);
        assert_eq!(out.len(), 1);
        let first = out[0].to_vec();
        assert_eq!(first.len(), 54 + 1000);
        assert_eq!(first[54..], payload[..1000]);
        assert_eq!(stats.snapshot().rx_dropped, 1);
        assert_eq!(rx.outstanding(), 1);

        rx.release_chain(&chain);
        let f = out.pop().unwrap();
        assert_eq!(rx.return_frame(f), 0);
        assert_eq!(rx.pool.in_use(), 0);
    }
}
