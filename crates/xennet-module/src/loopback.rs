//! `LoopbackBackend`: an in-process backend peer.
//!
//! Plays netback's half of the protocol over the same shared pages and
//! grant references the engine publishes:
//!
//! - TX: consumes request chains, copies the frame out of the granted
//!   pages, answers every slot (`NULL` for extra-info slots).
//! - RX: consumes offered buffers, copies frames into them, publishes
//!   responses with `MORE_DATA` / `EXTRA_INFO` chaining.
//!
//! Nothing here runs on its own thread; the caller decides when the
//! backend does work, which keeps tests deterministic. Raw slot
//! injection (`push_rx_slot`, `push_tx_response`) lets tests play a
//! misbehaving peer.

use std::collections::VecDeque;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use xennet_core::error::{NetfrontError, Result};
use xennet_core::grant::GrantRef;
use xennet_core::notifier::Notifier;
use xennet_core::sring::{crossed_event, SharedRing};
use xennet_core::wire::{
    status, ExtraInfo, ExtraKind, RingKind, RxFlags, RxRequest, RxResponse, RxRing, RxSlot,
    TxFlags, TxRequest, TxResponse, TxRing, TxSlot, PAGE_SIZE,
};

use crate::local_grants::LocalGrantTable;

/// Backend view of one ring: private request consumer and response
/// producer.
struct BackRing<K: RingKind> {
    ring: SharedRing<K>,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl<K: RingKind> BackRing<K> {
    fn new(ring: SharedRing<K>) -> Self {
        Self { ring, req_cons: 0, rsp_prod_pvt: 0 }
    }

    fn unconsumed(&self) -> u32 {
        self.ring.req_prod().wrapping_sub(self.req_cons)
    }

    fn take_request(&mut self, expect_extra: bool) -> Option<K::Request> {
        if self.unconsumed() == 0 {
            return None;
        }
        let mut raw = [0u8; 16];
        self.ring.read_slot(self.req_cons, &mut raw[..K::SLOT_SIZE]);
        self.req_cons = self.req_cons.wrapping_add(1);
        Some(K::decode_request(&raw[..K::SLOT_SIZE], expect_extra))
    }

    fn push_response(&mut self, rsp: &K::Response) {
        let mut raw = [0u8; 16];
        K::encode_response(rsp, &mut raw[..K::SLOT_SIZE]);
        self.ring.write_slot(self.rsp_prod_pvt, &raw[..K::SLOT_SIZE]);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Publish private responses. True when the front-end asked to be
    /// woken for them.
    fn publish(&mut self) -> bool {
        let old = self.ring.rsp_prod();
        let new = self.rsp_prod_pvt;
        self.ring.set_rsp_prod(new);
        fence(Ordering::SeqCst);
        crossed_event(old, new, self.ring.rsp_event())
    }

    /// Ask to be woken for the next request; true if one already arrived.
    fn rearm(&mut self) -> bool {
        self.ring.set_req_event(self.req_cons.wrapping_add(1));
        fence(Ordering::SeqCst);
        self.unconsumed() > 0
    }
}

/// A frame as the backend pulled it off the TX ring.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub flags: TxFlags,
    pub gso_mss: Option<u16>,
    /// Ring slots used, extra-info slots included.
    pub slots: usize,
}

/// How [`LoopbackBackend::deliver`] lays a frame out on the RX ring.
#[derive(Debug, Clone, Copy)]
pub struct RxDelivery {
    /// Announce the frame as a large segment with this MSS.
    pub gso_mss: Option<u16>,
    /// Checksum flags for the first response.
    pub flags: RxFlags,
    /// Bytes per buffer (clamped to one page).
    pub chunk: usize,
}

impl Default for RxDelivery {
    fn default() -> Self {
        Self { gso_mss: None, flags: RxFlags::empty(), chunk: PAGE_SIZE }
    }
}

pub struct LoopbackBackend<N: Notifier> {
    grants: Arc<LocalGrantTable>,
    front: N,
    ring_refs: (GrantRef, GrantRef),
    tx: BackRing<TxRing>,
    rx: BackRing<RxRing>,
    tx_unanswered: VecDeque<TxResponse>,
    rx_offered: VecDeque<RxRequest>,
    tx_status: i16,
}

impl<N: Notifier> LoopbackBackend<N> {
    /// Map both ring pages. `front` kicks the front-end's event channel.
    pub fn attach(grants: Arc<LocalGrantTable>, tx_ref: GrantRef, rx_ref: GrantRef, front: N) -> Result<Self> {
        let tx_page = grants.map(tx_ref, true)?;
        let rx_page = match grants.map(rx_ref, true) {
            Ok(p) => p,
            Err(e) => {
                let _ = grants.unmap(tx_ref);
                return Err(e);
            }
        };
        debug!("loopback backend attached: tx {} rx {}", tx_ref, rx_ref);
        Ok(Self {
            grants,
            front,
            ring_refs: (tx_ref, rx_ref),
            tx: BackRing::new(SharedRing::attach(tx_page)),
            rx: BackRing::new(SharedRing::attach(rx_page)),
            tx_unanswered: VecDeque::new(),
            rx_offered: VecDeque::new(),
            tx_status: status::OKAY,
        })
    }

    /// Unmap the ring pages. Same as dropping the backend.
    pub fn detach(self) {}

    /// Status written into subsequent TX responses.
    pub fn set_tx_status(&mut self, st: i16) {
        self.tx_status = st;
    }

    fn kick(&self) -> Result<()> {
        self.front.notify()
    }

    // ── TX ──

    /// Consume every complete request chain and copy the frames out.
    /// Responses are queued, not published; see [`respond_tx`](Self::respond_tx).
    pub fn poll_tx(&mut self) -> Result<Vec<CapturedFrame>> {
        let mut frames = Vec::new();
        loop {
            let first = match self.tx.take_request(false) {
                Some(TxSlot::Request(req)) => req,
                Some(TxSlot::Extra(_)) => return Err(NetfrontError::Unsupported("tx chain starts with extra")),
                None => break,
            };
            let mut slots = 1;
            self.tx_unanswered.push_back(TxResponse { id: first.id, status: self.tx_status });

            let mut gso_mss = None;
            if first.flags.contains(TxFlags::EXTRA_INFO) {
                let mut more = true;
                while more {
                    let ei = match self.tx.take_request(true) {
                        Some(TxSlot::Extra(ei)) => ei,
                        _ => return Err(NetfrontError::Unsupported("truncated tx extra chain")),
                    };
                    slots += 1;
                    if let ExtraKind::Gso { size, .. } = ei.kind {
                        gso_mss = Some(size);
                    }
                    more = ei.more;
                    self.tx_unanswered.push_back(TxResponse { id: 0, status: status::NULL });
                }
            }

            let mut rest: Vec<TxRequest> = Vec::new();
            let mut more = first.flags.contains(TxFlags::MORE_DATA);
            while more {
                let req = match self.tx.take_request(false) {
                    Some(TxSlot::Request(req)) => req,
                    _ => return Err(NetfrontError::Unsupported("truncated tx data chain")),
                };
                slots += 1;
                more = req.flags.contains(TxFlags::MORE_DATA);
                self.tx_unanswered.push_back(TxResponse { id: req.id, status: self.tx_status });
                rest.push(req);
            }

            // The first slot's size is the whole frame; its own bytes are
            // what the following slots do not carry.
            let tail: usize = rest.iter().map(|r| r.size as usize).sum();
            let first_len = (first.size as usize).saturating_sub(tail);
            let mut data = Vec::with_capacity(first.size as usize);
            self.copy_slot(&first, first_len, &mut data)?;
            for req in &rest {
                self.copy_slot(req, req.size as usize, &mut data)?;
            }
            frames.push(CapturedFrame { data, flags: first.flags, gso_mss, slots });
        }
        self.tx.rearm();
        Ok(frames)
    }

    fn copy_slot(&self, req: &TxRequest, len: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.resize(start + len, 0);
        self.grants
            .with_mapped(req.gref, false, |p| p.read(req.offset as usize, &mut out[start..]))
    }

    /// Publish up to `max` queued TX responses. Returns how many.
    pub fn respond_tx(&mut self, max: usize) -> Result<usize> {
        let n = max.min(self.tx_unanswered.len());
        let batch: Vec<TxResponse> = self.tx_unanswered.drain(..n).collect();
        for rsp in &batch {
            self.tx.push_response(rsp);
        }
        if n > 0 && self.tx.publish() {
            self.kick()?;
        }
        Ok(n)
    }

    /// `poll_tx` + answer everything.
    pub fn process_tx(&mut self) -> Result<Vec<CapturedFrame>> {
        let frames = self.poll_tx()?;
        self.respond_tx(usize::MAX)?;
        Ok(frames)
    }

    pub fn tx_unanswered(&self) -> usize {
        self.tx_unanswered.len()
    }

    /// Write a raw TX response and publish it.
    pub fn push_tx_response(&mut self, rsp: TxResponse) -> Result<()> {
        self.tx.push_response(&rsp);
        if self.tx.publish() {
            self.kick()?;
        }
        Ok(())
    }

    // ── RX ──

    fn pull_rx_requests(&mut self) {
        while let Some(req) = self.rx.take_request(false) {
            self.rx_offered.push_back(req);
        }
        self.rx.rearm();
    }

    /// Buffers the front-end has offered and the backend has not used.
    pub fn rx_available(&mut self) -> usize {
        self.pull_rx_requests();
        self.rx_offered.len()
    }

    /// Copy `frame` into offered buffers and publish its responses.
    /// `Ok(false)` if not enough buffers are offered; nothing is consumed.
    pub fn deliver(&mut self, frame: &[u8], how: &RxDelivery) -> Result<bool> {
        if frame.is_empty() {
            return Err(NetfrontError::Unsupported("empty rx frame"));
        }
        let chunk = how.chunk.clamp(1, PAGE_SIZE);
        let pieces = (frame.len() + chunk - 1) / chunk;
        let needed = pieces + usize::from(how.gso_mss.is_some());
        if self.rx_available() < needed {
            return Ok(false);
        }

        for (i, piece) in frame.chunks(chunk).enumerate() {
            let req = self.next_offered()?;
            self.write_rx_buffer(&req, 0, piece)?;
            let mut flags = RxFlags::empty();
            if i == 0 {
                flags |= how.flags;
                if how.gso_mss.is_some() {
                    flags |= RxFlags::EXTRA_INFO;
                }
            }
            if i + 1 < pieces {
                flags |= RxFlags::MORE_DATA;
            }
            self.rx.push_response(&RxSlot::Response(RxResponse {
                id: req.id,
                offset: 0,
                flags,
                status: piece.len() as i16,
            }));
            if i == 0 {
                if let Some(mss) = how.gso_mss {
                    self.next_offered()?;
                    self.rx.push_response(&RxSlot::Extra(ExtraInfo::gso_tcpv4(mss)));
                }
            }
        }
        self.publish_rx()?;
        Ok(true)
    }

    fn next_offered(&mut self) -> Result<RxRequest> {
        self.rx_offered.pop_front().ok_or(NetfrontError::RingFull)
    }

    /// Oldest offered buffer, for hand-built responses.
    pub fn take_rx_request(&mut self) -> Option<RxRequest> {
        self.pull_rx_requests();
        self.rx_offered.pop_front()
    }

    pub fn write_rx_buffer(&self, req: &RxRequest, offset: usize, data: &[u8]) -> Result<()> {
        self.grants.with_mapped(req.gref, true, |p| p.write(offset, data))
    }

    /// Write a raw RX slot. Published by [`publish_rx`](Self::publish_rx).
    pub fn push_rx_slot(&mut self, slot: RxSlot) {
        self.rx.push_response(&slot);
    }

    pub fn publish_rx(&mut self) -> Result<bool> {
        let notify = self.rx.publish();
        if notify {
            self.kick()?;
        }
        Ok(notify)
    }
}

impl<N: Notifier> Drop for LoopbackBackend<N> {
    fn drop(&mut self) {
        for gref in [self.ring_refs.0, self.ring_refs.1] {
            if let Err(e) = self.grants.unmap(gref) {
                warn!("loopback detach: unmap {} failed: {}", gref, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park_notifier::ParkNotifier;
    use xennet_core::grant::{GrantAccess, GrantTable};
    use xennet_core::page::Page;
    use xennet_core::wire::RX_SLOT_SIZE;

    struct Front {
        grants: Arc<LocalGrantTable>,
        tx: SharedRing<TxRing>,
        rx: SharedRing<RxRing>,
        tx_ref: GrantRef,
        rx_ref: GrantRef,
    }

    fn front() -> Front {
        let grants = Arc::new(LocalGrantTable::new(64));
        let tx_page = Page::new().unwrap();
        let rx_page = Page::new().unwrap();
        let tx_ref = grants.grant_access(&tx_page, GrantAccess::ReadWrite).unwrap();
        let rx_ref = grants.grant_access(&rx_page, GrantAccess::ReadWrite).unwrap();
        Front { grants, tx: SharedRing::init(tx_page), rx: SharedRing::init(rx_page), tx_ref, rx_ref }
    }

    #[test]
    fn test_deliver_chains_buffers() {
        let f = front();
        let kick = Arc::new(ParkNotifier::new());
        let mut back = LoopbackBackend::attach(f.grants.clone(), f.tx_ref, f.rx_ref, kick.clone()).unwrap();

        let mut pages = Vec::new();
        for id in 0..3u16 {
            let page = Page::new().unwrap();
            let gref = f.grants.grant_access(&page, GrantAccess::ReadWrite).unwrap();
            f.rx.write_slot(id as u32, &RxRequest { id, gref }.encode());
            pages.push(page);
        }
        f.rx.set_req_prod(3);

        let frame: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        assert!(back.deliver(&frame, &RxDelivery::default()).unwrap());
        assert_eq!(f.rx.rsp_prod(), 2);
        assert!(kick.take());

        let mut raw = [0u8; RX_SLOT_SIZE];
        f.rx.read_slot(0, &mut raw);
        let first = RxResponse::decode(&raw);
        assert_eq!(first.status, 4096);
        assert!(first.flags.contains(RxFlags::MORE_DATA));
        f.rx.read_slot(1, &mut raw);
        let second = RxResponse::decode(&raw);
        assert_eq!((second.id, second.status), (1, 904));
        assert!(!second.flags.contains(RxFlags::MORE_DATA));
        assert_eq!(pages[1].to_vec(0, 904), frame[4096..]);

        // One buffer left: a two-piece frame does not fit and consumes nothing.
        assert!(!back.deliver(&frame, &RxDelivery::default()).unwrap());
        assert_eq!(back.rx_available(), 1);
    }

    #[test]
    fn test_poll_tx_reassembles_and_answers_extra_with_null() {
        let f = front();
        let kick = Arc::new(ParkNotifier::new());
        let mut back = LoopbackBackend::attach(f.grants.clone(), f.tx_ref, f.rx_ref, kick.clone()).unwrap();

        let head = Page::new().unwrap();
        head.write(0, &[1u8; 100]);
        let body = Page::new().unwrap();
        body.write(10, &[2u8; 50]);
        let g0 = f.grants.grant_access(&head, GrantAccess::ReadOnly).unwrap();
        let g1 = f.grants.grant_access(&body, GrantAccess::ReadOnly).unwrap();

        let slots = [
            TxSlot::Request(TxRequest {
                gref: g0,
                offset: 0,
                flags: TxFlags::MORE_DATA | TxFlags::EXTRA_INFO,
                id: 4,
                size: 150,
            }),
            TxSlot::Extra(ExtraInfo::gso_tcpv4(1448)),
            TxSlot::Request(TxRequest { gref: g1, offset: 10, flags: TxFlags::empty(), id: 9, size: 50 }),
        ];
        for (i, s) in slots.iter().enumerate() {
            f.tx.write_slot(i as u32, &s.encode());
        }
        f.tx.set_req_prod(3);

        let frames = back.process_tx().unwrap();
        assert_eq!(frames.len(), 1);
        let cap = &frames[0];
        assert_eq!(cap.slots, 3);
        assert_eq!(cap.gso_mss, Some(1448));
        assert_eq!(&cap.data[..100], &[1u8; 100][..]);
        assert_eq!(&cap.data[100..], &[2u8; 50][..]);

        assert_eq!(f.tx.rsp_prod(), 3);
        let mut raw = [0u8; 12];
        f.tx.read_slot(1, &mut raw);
        assert_eq!(TxResponse::decode(&raw).status, status::NULL);
        f.tx.read_slot(2, &mut raw);
        assert_eq!(TxResponse::decode(&raw), TxResponse { id: 9, status: status::OKAY });
        assert!(!f.grants.is_mapped(g1));
    }

    #[test]
    fn test_drop_unmaps_rings() {
        let f = front();
        let back = LoopbackBackend::attach(f.grants.clone(), f.tx_ref, f.rx_ref, ParkNotifier::new()).unwrap();
        assert!(f.grants.is_mapped(f.tx_ref));
        back.detach();
        assert!(!f.grants.is_mapped(f.tx_ref));
        assert!(!f.grants.is_mapped(f.rx_ref));
    }
}
