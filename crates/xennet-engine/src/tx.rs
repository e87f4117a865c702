//! TX path: map outbound frames onto ring slots, reclaim them on
//! response.
//!
//! Every frame goes out as:
//!
//! ```text
//! slot 0      header   first min(len, PAGE) bytes in a bounce buffer; size = frame length
//! [slot 1]    extra    GSO record, only for large sends
//! slot 1..n   data     the remaining bytes, granted in place or packed into bounce pages
//! ```
//!
//! At most `MAX_SG_SLOTS` request slots per frame (header included).
//! A frame whose fragments would need more is coalesced: its data is
//! copied into whole bounce pages instead.
//!
//! Each request slot owns a shadow entry keyed by its id. The frame is
//! completed when the last of its shadows gets a response.

use crossbeam_queue::SegQueue;
use log::{debug, trace, warn};

use std::sync::Arc;

use xennet_core::config::Options;
use xennet_core::error::{NetfrontError, ProtocolViolation};
use xennet_core::frame::{BufferId, CastKind, SendStatus, TxFrame};
use xennet_core::grant::{GrantAccess, GrantRef, GrantTable};
use xennet_core::page::Page;
use xennet_core::state::DeviceState;
use xennet_core::wire::{
    status, Direction, ExtraInfo, TxFlags, TxRequest, TxRing, TxSlot, ETH_HEADER_LEN, MAX_SG_SLOTS, PAGE_SIZE,
    TX_RING_SIZE,
};

use crate::checksum::{
    remove_length_from_pseudo_checksum, transport_checksum_ipv4, write_ipv4_header_checksum, TCP_CSUM_OFFSET,
    UDP_CSUM_OFFSET,
};
use crate::packet::{be16, fixup_zero_ip_length, put_be16, PacketInfo, MAX_HEADERS_LEN};
use crate::pool::{BufferKind, BufferPool};
use crate::ring::FrontRing;
use crate::stats::Stats;

/// Longest frame a header slot can describe.
pub const MAX_FRAME_LEN: usize = if MAX_SG_SLOTS * PAGE_SIZE < u16::MAX as usize {
    MAX_SG_SLOTS * PAGE_SIZE
} else {
    u16::MAX as usize
};

/// A frame handed back to the shim.
pub type Completion = (TxFrame, SendStatus);

#[derive(Debug)]
struct TxShadow {
    gref: GrantRef,
    bounce: Option<BufferId>,
    frame: u32,
}

struct InFlight {
    frame: TxFrame,
    slots_left: u32,
    failed: bool,
    cast: CastKind,
}

/// Where a data slot's bytes come from.
enum DataSource {
    /// Grant the fragment's own page.
    Direct { page: Arc<Page>, offset: usize, len: usize },
    /// Copy frame bytes `[from, from + len)` into a bounce page.
    Bounce { from: usize, len: usize },
}

/// A slot built but not yet on the ring.
struct Staged {
    slot: TxSlot,
    shadow: Option<(u16, GrantRef, Option<BufferId>)>,
}

pub enum Submit {
    Sent,
    /// Will never go out; complete it with `Failure`.
    Rejected(TxFrame, NetfrontError),
    /// Out of ring slots, ids, grants or bounce buffers. Retry later.
    Busy(TxFrame),
}

pub struct TxPath<G: GrantTable> {
    ring: FrontRing<TxRing>,
    bounce: BufferPool<G>,
    shadows: Vec<Option<TxShadow>>,
    /// LIFO stack of free request ids.
    id_free: Vec<u16>,
    frames: Vec<Option<InFlight>>,
    vacant_frames: Vec<u32>,
    /// Frame that hit backpressure; goes before anything queued.
    stalled: Option<TxFrame>,
    outstanding: usize,
    options: Options,
}

impl<G: GrantTable> TxPath<G> {
    pub fn new(page: Arc<Page>, grants: G, freelist_max: usize, options: Options) -> Self {
        Self {
            ring: FrontRing::new(page),
            bounce: BufferPool::new(grants, freelist_max),
            shadows: (0..TX_RING_SIZE).map(|_| None).collect(),
            id_free: (0..TX_RING_SIZE as u16).rev().collect(),
            frames: Vec::new(),
            vacant_frames: Vec::new(),
            stalled: None,
            outstanding: 0,
            options,
        }
    }

    pub fn ring_page(&self) -> &Arc<Page> {
        self.ring.page()
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn set_options(&mut self, options: Options) {
        self.options = options;
    }

    /// Frames on the ring without a completion yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    pub fn take_stalled(&mut self) -> Option<TxFrame> {
        self.stalled.take()
    }

    pub fn free_ids(&self) -> usize {
        self.id_free.len()
    }

    pub fn bounce_pool(&self) -> &BufferPool<G> {
        &self.bounce
    }

    // ── Submission ──

    /// Push the stalled frame, then queued frames, until one hits
    /// backpressure. Rejected frames are appended to `completions`.
    /// Returns the ring's notify verdict.
    pub fn send_queued(
        &mut self,
        queue: &SegQueue<TxFrame>,
        state: DeviceState,
        stats: &Stats,
        completions: &mut Vec<Completion>,
    ) -> bool {
        loop {
            let Some(frame) = self.stalled.take().or_else(|| queue.pop()) else {
                break;
            };
            match self.submit(frame, state) {
                Submit::Sent => {}
                Submit::Rejected(frame, e) => {
                    debug!("tx: rejecting {} byte frame: {}", frame.len(), e);
                    stats.tx_error();
                    completions.push((frame, SendStatus::Failure));
                }
                Submit::Busy(frame) => {
                    trace!("tx: backpressure, {} frames in flight", self.outstanding);
                    self.stalled = Some(frame);
                    break;
                }
            }
        }
        self.ring.push_and_check_notify()
    }

    /// Stage one frame on the ring. Nothing is published.
    pub fn submit(&mut self, frame: TxFrame, state: DeviceState) -> Submit {
        if !state.is_active() {
            return Submit::Rejected(frame, NetfrontError::NotActive(state));
        }
        let total = frame.len();
        if let Err(e) = self.check_frame(&frame) {
            return Submit::Rejected(frame, e);
        }

        let sources = data_sources(&frame);
        let request_slots = 1 + sources.len();
        // +1 keeps room for a GSO extra slot.
        if (self.ring.free_slots() as usize) < request_slots + 1 || self.id_free.len() < request_slots {
            return Submit::Busy(frame);
        }

        // Header bytes, patched in place before they reach the bounce page.
        let head_len = total.min(PAGE_SIZE);
        let mut head = vec![0u8; head_len];
        frame.copy_out(0, &mut head);
        fixup_zero_ip_length(&mut head, total);
        let pi = PacketInfo::parse(head[..head_len.min(MAX_HEADERS_LEN)].to_vec(), total);

        let offload = frame.offload();
        let mut head_flags = TxFlags::empty();
        let mut gso = None;
        if offload.mss > 0 && !pi.is_tcp() {
            debug!("tx: large send requested on a non-TCP/IPv4 frame, sending it whole");
        }
        if offload.mss > 0 && pi.is_tcp() {
            if pi.tcp_length > self.options.gso_segment_size as usize {
                return Submit::Rejected(
                    frame,
                    NetfrontError::FrameTooLarge {
                        len: pi.tcp_length,
                        max: self.options.gso_segment_size as usize,
                    },
                );
            }
            head_flags |= TxFlags::CSUM_BLANK | TxFlags::DATA_VALIDATED;
            if pi.tcp_length >= offload.mss as usize {
                gso = Some(ExtraInfo::gso_tcpv4(offload.mss.min(u16::MAX as u32) as u16));
            }
            let at = pi.l4_offset() + TCP_CSUM_OFFSET;
            let l4_len = (pi.ip4_length - pi.ip4_header_length) as u16;
            let pseudo = remove_length_from_pseudo_checksum(be16(&head, at), l4_len);
            put_be16(&mut head, at, pseudo);
            write_ipv4_header_checksum(&mut head[ETH_HEADER_LEN..pi.l4_offset()]);
        } else {
            let wants_l4 = (offload.tcp_checksum && pi.is_tcp()) || (offload.udp_checksum && pi.is_udp());
            if wants_l4 {
                if self.options.checksum_offload {
                    head_flags |= TxFlags::CSUM_BLANK | TxFlags::DATA_VALIDATED;
                } else {
                    fill_transport_checksum(&frame, &pi, &mut head);
                }
            }
            if offload.ip_header_checksum && pi.is_ok() {
                write_ipv4_header_checksum(&mut head[ETH_HEADER_LEN..pi.l4_offset()]);
            }
        }

        let staged = match self.stage(&frame, &head, total, head_flags, gso, sources) {
            Ok(staged) => staged,
            Err(e) => {
                debug!("tx: staging failed: {}", e);
                return Submit::Busy(frame);
            }
        };

        let frame_idx = self.insert_frame(InFlight {
            slots_left: request_slots as u32,
            failed: false,
            cast: CastKind::of(pi.dest_mac()),
            frame,
        });
        for s in staged {
            if let Some((id, gref, bounce)) = s.shadow {
                self.shadows[id as usize] = Some(TxShadow { gref, bounce, frame: frame_idx });
            }
            // Space was checked up front.
            if let Err(e) = self.ring.offer_request(&s.slot) {
                warn!("tx: offer failed after space check: {}", e);
            }
        }
        self.outstanding += 1;
        Submit::Sent
    }

    fn check_frame(&self, frame: &TxFrame) -> Result<(), NetfrontError> {
        let total = frame.len();
        if total == 0 {
            return Err(NetfrontError::Unsupported("empty frame"));
        }
        if total > MAX_FRAME_LEN {
            return Err(NetfrontError::FrameTooLarge { len: total, max: MAX_FRAME_LEN });
        }
        if !self.options.sg_enabled && total > PAGE_SIZE {
            return Err(NetfrontError::FrameTooLarge { len: total, max: PAGE_SIZE });
        }
        if frame.offload().mss > 0 && self.options.gso_segment_size == 0 {
            return Err(NetfrontError::Unsupported("large send offload disabled"));
        }
        Ok(())
    }

    /// Grant and fill every slot of a frame. All or nothing: on failure
    /// everything acquired so far is given back.
    fn stage(
        &mut self,
        frame: &TxFrame,
        head: &[u8],
        total: usize,
        head_flags: TxFlags,
        gso: Option<ExtraInfo>,
        sources: Vec<DataSource>,
    ) -> Result<Vec<Staged>, NetfrontError> {
        let mut staged = Vec::with_capacity(sources.len() + 2);
        match self.stage_into(&mut staged, frame, head, total, head_flags, gso, &sources) {
            Ok(()) => Ok(staged),
            Err(e) => {
                self.unstage(staged);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_into(
        &mut self,
        staged: &mut Vec<Staged>,
        frame: &TxFrame,
        head: &[u8],
        total: usize,
        head_flags: TxFlags,
        gso: Option<ExtraInfo>,
        sources: &[DataSource],
    ) -> Result<(), NetfrontError> {
        let id = self.pop_id()?;
        let (hb, hgref) = match self.bounce_slot(head) {
            Ok(v) => v,
            Err(e) => {
                self.id_free.push(id);
                return Err(e);
            }
        };
        let mut flags = head_flags;
        if !sources.is_empty() {
            flags |= TxFlags::MORE_DATA;
        }
        if gso.is_some() {
            flags |= TxFlags::EXTRA_INFO;
        }
        staged.push(Staged {
            slot: TxSlot::Request(TxRequest { gref: hgref, offset: 0, flags, id, size: total as u16 }),
            shadow: Some((id, hgref, Some(hb))),
        });
        if let Some(ei) = gso {
            staged.push(Staged { slot: TxSlot::Extra(ei), shadow: None });
        }

        let last = sources.len().saturating_sub(1);
        for (i, src) in sources.iter().enumerate() {
            let id = self.pop_id()?;
            let (gref, offset, len, bounce) = match self.data_slot(frame, src) {
                Ok(v) => v,
                Err(e) => {
                    self.id_free.push(id);
                    return Err(e);
                }
            };
            let flags = if i < last { TxFlags::MORE_DATA } else { TxFlags::empty() };
            staged.push(Staged {
                slot: TxSlot::Request(TxRequest { gref, offset: offset as u16, flags, id, size: len as u16 }),
                shadow: Some((id, gref, bounce)),
            });
        }
        Ok(())
    }

    fn data_slot(
        &mut self,
        frame: &TxFrame,
        src: &DataSource,
    ) -> Result<(GrantRef, usize, usize, Option<BufferId>), NetfrontError> {
        match src {
            DataSource::Direct { page, offset, len } => {
                let gref = self.bounce.grants().grant_access(page, GrantAccess::ReadOnly)?;
                Ok((gref, *offset, *len, None))
            }
            DataSource::Bounce { from, len } => {
                let mut bytes = vec![0u8; *len];
                frame.copy_out(*from, &mut bytes);
                let (b, gref) = self.bounce_slot(&bytes)?;
                Ok((gref, 0, *len, Some(b)))
            }
        }
    }

    /// Copy `bytes` into a fresh bounce buffer and grant it read-only.
    fn bounce_slot(&mut self, bytes: &[u8]) -> Result<(BufferId, GrantRef), NetfrontError> {
        let b = self.bounce.acquire(BufferKind::Bounce, true).ok_or(NetfrontError::OutOfMemory)?;
        let Some(page) = self.bounce.page(b).cloned() else {
            return Err(NetfrontError::OutOfMemory);
        };
        page.write(0, bytes);
        match self.bounce.grants().grant_access(&page, GrantAccess::ReadOnly) {
            Ok(gref) => Ok((b, gref)),
            Err(e) => {
                self.release_bounce(b);
                Err(e)
            }
        }
    }

    fn pop_id(&mut self) -> Result<u16, NetfrontError> {
        self.id_free.pop().ok_or(NetfrontError::RingFull)
    }

    fn unstage(&mut self, staged: Vec<Staged>) {
        for s in staged {
            let Some((id, gref, bounce)) = s.shadow else { continue };
            if let Err(e) = self.bounce.grants().end_access(gref) {
                warn!("tx: rollback cannot revoke {}: {}", gref, e);
            }
            if let Some(b) = bounce {
                self.release_bounce(b);
            }
            self.id_free.push(id);
        }
    }

    fn insert_frame(&mut self, f: InFlight) -> u32 {
        match self.vacant_frames.pop() {
            Some(idx) => {
                self.frames[idx as usize] = Some(f);
                idx
            }
            None => {
                self.frames.push(Some(f));
                (self.frames.len() - 1) as u32
            }
        }
    }

    fn release_bounce(&mut self, b: BufferId) {
        if let Err(e) = self.bounce.release(b) {
            warn!("tx: {}", e);
        }
    }

    // ── Completion ──

    /// Consume responses: revoke grants, recycle bounce buffers and ids,
    /// complete frames whose last slot came back. With `rearm == false`
    /// the response event is left alone for a later pass.
    pub fn collect_completions(
        &mut self,
        rearm: bool,
        stats: &Stats,
        completions: &mut Vec<Completion>,
    ) -> Result<(), ProtocolViolation> {
        let Self { ring, bounce, shadows, id_free, frames, vacant_frames, outstanding, .. } = self;
        let responses = if rearm { ring.responses() } else { ring.responses_no_rearm() };
        for raw in responses {
            let rsp = raw?.decode(false);
            if rsp.status == status::NULL {
                continue;
            }
            let Some(shadow) = shadows.get_mut(rsp.id as usize).and_then(Option::take) else {
                return Err(ProtocolViolation::UnknownId { ring: Direction::Tx, id: rsp.id });
            };

            match bounce.grants().end_access(shadow.gref) {
                Ok(()) => {
                    if let Some(b) = shadow.bounce {
                        if let Err(e) = bounce.release(b) {
                            warn!("tx: {}", e);
                        }
                    }
                }
                // Still mapped: the page must not be reused, keep it referenced.
                Err(e) => warn!("tx: id {} cannot revoke {}: {}; leaking", rsp.id, shadow.gref, e),
            }
            id_free.push(rsp.id);

            let Some(inflight) = frames.get_mut(shadow.frame as usize).and_then(Option::as_mut) else {
                warn!("tx: id {} refers to no frame", rsp.id);
                continue;
            };
            if rsp.status != status::OKAY {
                inflight.failed = true;
            }
            inflight.slots_left -= 1;
            if inflight.slots_left > 0 {
                continue;
            }
            let Some(done) = frames[shadow.frame as usize].take() else { continue };
            vacant_frames.push(shadow.frame);
            *outstanding = outstanding.saturating_sub(1);
            let result = if done.failed {
                stats.tx_error();
                SendStatus::Failure
            } else {
                stats.tx_frame(done.cast, done.frame.len());
                SendStatus::Success
            };
            completions.push((done.frame, result));
        }
        Ok(())
    }

    /// Re-arm the response event after a pass that skipped it.
    pub fn rearm(&mut self) {
        self.ring.set_response_event(self.ring.rsp_cons().wrapping_add(1));
    }

    /// Fail every in-flight frame without touching its grants. For a
    /// faulted ring: the backend can no longer be trusted to answer.
    /// Bounce buffers stay referenced; their pages may still be mapped.
    pub fn abandon_in_flight(&mut self, completions: &mut Vec<Completion>) {
        for s in self.shadows.iter_mut() {
            s.take();
        }
        for slot in self.frames.iter_mut() {
            if let Some(f) = slot.take() {
                completions.push((f.frame, SendStatus::Failure));
            }
        }
        self.vacant_frames = (0..self.frames.len() as u32).collect();
        self.outstanding = 0;
    }

    /// Free idle bounce buffers. Returns those still referenced.
    pub fn teardown(&mut self) -> usize {
        self.bounce.teardown()
    }
}

/// Slots needed for the bytes past the header page, one per fragment
/// piece. Falls back to whole bounce pages when that exceeds the
/// scatter-gather ceiling.
fn data_sources(frame: &TxFrame) -> Vec<DataSource> {
    let total = frame.len();
    if total <= PAGE_SIZE {
        return Vec::new();
    }
    let mut direct = Vec::new();
    let mut pos = 0usize;
    for frag in frame.fragments() {
        let end = pos + frag.len();
        if end > PAGE_SIZE && frag.len() > 0 {
            let skip = PAGE_SIZE.saturating_sub(pos);
            direct.push(DataSource::Direct {
                page: frag.page().clone(),
                offset: frag.offset() + skip,
                len: frag.len() - skip,
            });
        }
        pos = end;
    }
    if 1 + direct.len() <= MAX_SG_SLOTS {
        return direct;
    }
    (PAGE_SIZE..total)
        .step_by(PAGE_SIZE)
        .map(|from| DataSource::Bounce { from, len: (total - from).min(PAGE_SIZE) })
        .collect()
}

/// Compute the transport checksum the stack asked for in software and
/// store it in the header copy.
fn fill_transport_checksum(frame: &TxFrame, pi: &PacketInfo, head: &mut [u8]) {
    let l4 = pi.l4_offset();
    let l4_len = pi.ip4_length - pi.ip4_header_length;
    let mut segment = vec![0u8; l4_len];
    frame.copy_out(l4, &mut segment);
    let csum_offset = if pi.is_tcp() { TCP_CSUM_OFFSET } else { UDP_CSUM_OFFSET };
    let csum = transport_checksum_ipv4(pi.src_ip(), pi.dst_ip(), pi.ip_proto, &segment, csum_offset);
    put_be16(head, l4 + csum_offset, csum);
}
