//! `FrontRing`: the front-end's half of a shared ring.
//!
//! Requests are staged privately (`req_prod_pvt`) and published in one
//! go by [`FrontRing::push_and_check_notify`]. Responses are consumed
//! through [`Responses`], which re-arms `rsp_event` and re-checks when
//! it runs dry so a response published during the drain is never
//! missed.
//!
//! # Capacity
//!
//! `req_prod_pvt - rsp_cons` never exceeds the ring size: every offered
//! request occupies a slot until its response is consumed. A peer that
//! publishes more responses than there are requests is reported as
//! [`ProtocolViolation::ResponseOverrun`].

use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use xennet_core::error::{NetfrontError, ProtocolViolation, Result};
use xennet_core::page::Page;
use xennet_core::sring::{crossed_event, SharedRing};
use xennet_core::wire::RingKind;

/// Largest slot of any ring kind.
const MAX_SLOT_SIZE: usize = 16;

pub struct FrontRing<K: RingKind> {
    shared: SharedRing<K>,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl<K: RingKind> FrontRing<K> {
    /// Initialise the header of `page` and start both cursors at 0.
    pub fn new(page: Arc<Page>) -> Self {
        Self { shared: SharedRing::init(page), req_prod_pvt: 0, rsp_cons: 0 }
    }

    pub fn page(&self) -> &Arc<Page> {
        self.shared.page()
    }

    pub const fn capacity() -> u32 {
        K::CAPACITY
    }

    pub fn req_prod_pvt(&self) -> u32 {
        self.req_prod_pvt
    }

    pub fn rsp_cons(&self) -> u32 {
        self.rsp_cons
    }

    /// Requests offered and not yet answered.
    pub fn outstanding(&self) -> u32 {
        self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    pub fn free_slots(&self) -> u32 {
        K::CAPACITY - self.outstanding()
    }

    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    /// Stage a request at `req_prod_pvt`. Returns its ring index.
    pub fn offer_request(&mut self, req: &K::Request) -> Result<u32> {
        if self.is_full() {
            return Err(NetfrontError::RingFull);
        }
        let mut raw = [0u8; MAX_SLOT_SIZE];
        K::encode_request(req, &mut raw[..K::SLOT_SIZE]);
        let idx = self.req_prod_pvt;
        self.shared.write_slot(idx, &raw[..K::SLOT_SIZE]);
        self.req_prod_pvt = idx.wrapping_add(1);
        Ok(idx)
    }

    /// Publish staged requests. True when the backend asked to be woken
    /// for them (its `req_event` lies in the published range).
    pub fn push_and_check_notify(&mut self) -> bool {
        let old = self.shared.req_prod();
        let new = self.req_prod_pvt;
        // Release store: slot contents become visible with the index.
        self.shared.set_req_prod(new);
        fence(Ordering::SeqCst);
        crossed_event(old, new, self.shared.req_event())
    }

    /// Set `rsp_event` explicitly (the TX path's deferred re-arm).
    pub fn set_response_event(&self, v: u32) {
        self.shared.set_rsp_event(v);
    }

    fn published_responses(&self) -> std::result::Result<u32, ProtocolViolation> {
        let prod = self.shared.rsp_prod();
        let published = prod.wrapping_sub(self.rsp_cons);
        let outstanding = self.outstanding();
        if published > outstanding {
            return Err(ProtocolViolation::ResponseOverrun { ring: K::DIRECTION, published, outstanding });
        }
        Ok(prod)
    }

    /// Responses published and not yet consumed.
    pub fn unconsumed_responses(&self) -> std::result::Result<u32, ProtocolViolation> {
        Ok(self.published_responses()?.wrapping_sub(self.rsp_cons))
    }

    /// Drain responses, re-arming `rsp_event` when the ring runs dry.
    pub fn responses(&mut self) -> Responses<'_, K> {
        let prod = self.rsp_cons;
        Responses { ring: self, prod, rearm: true, done: false }
    }

    /// Drain responses without touching `rsp_event`. The caller re-arms
    /// later with [`set_response_event`](Self::set_response_event).
    pub fn responses_no_rearm(&mut self) -> Responses<'_, K> {
        let prod = self.rsp_cons;
        Responses { ring: self, prod, rearm: false, done: false }
    }
}

/// One consumed response slot, still raw: whether it holds an
/// extra-info record depends on the slot before it.
pub struct RawResponse<K: RingKind> {
    /// Ring index (unmasked) the response was read from.
    pub idx: u32,
    bytes: [u8; MAX_SLOT_SIZE],
    _kind: PhantomData<K>,
}

impl<K: RingKind> RawResponse<K> {
    pub fn decode(&self, expect_extra: bool) -> K::Response {
        K::decode_response(&self.bytes[..K::SLOT_SIZE], expect_extra)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..K::SLOT_SIZE]
    }

    /// Slot position in the ring.
    pub fn slot(&self) -> u32 {
        self.idx & (K::CAPACITY - 1)
    }
}

/// Response drain. Dropping it early (a quota stop) leaves `rsp_event`
/// alone; the remaining responses stay for the next pass.
pub struct Responses<'a, K: RingKind> {
    ring: &'a mut FrontRing<K>,
    prod: u32,
    rearm: bool,
    done: bool,
}

impl<'a, K: RingKind> Iterator for Responses<'a, K> {
    type Item = std::result::Result<RawResponse<K>, ProtocolViolation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.ring.rsp_cons != self.prod {
                let idx = self.ring.rsp_cons;
                let mut bytes = [0u8; MAX_SLOT_SIZE];
                self.ring.shared.read_slot(idx, &mut bytes[..K::SLOT_SIZE]);
                self.ring.rsp_cons = idx.wrapping_add(1);
                return Some(Ok(RawResponse { idx, bytes, _kind: PhantomData }));
            }

            // Snapshot exhausted: look for more.
            match self.ring.published_responses() {
                Ok(prod) if prod != self.prod => {
                    self.prod = prod;
                    continue;
                }
                Ok(_) => {}
                Err(v) => {
                    self.done = true;
                    return Some(Err(v));
                }
            }
            if !self.rearm {
                self.done = true;
                return None;
            }

            // Ask for a notification at the next response, then re-check
            // so one published in between is not lost.
            self.ring.shared.set_rsp_event(self.ring.rsp_cons.wrapping_add(1));
            fence(Ordering::SeqCst);
            match self.ring.published_responses() {
                Ok(prod) if prod != self.prod => {
                    self.prod = prod;
                }
                Ok(_) => {
                    self.done = true;
                    return None;
                }
                Err(v) => {
                    self.done = true;
                    return Some(Err(v));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use xennet_core::grant::GrantRef;
    use xennet_core::wire::{RxRequest, RxResponse, RxRing, RxSlot, RxFlags, RX_SLOT_SIZE};

    /// Backend side for tests: answers requests in order.
    struct Peer {
        shared: SharedRing<RxRing>,
        req_cons: u32,
        rsp_prod: u32,
    }

    impl Peer {
        fn new(ring: &FrontRing<RxRing>) -> Self {
            Self { shared: SharedRing::attach(ring.page().clone()), req_cons: 0, rsp_prod: 0 }
        }

        /// Answer up to `n` published requests.
        fn answer(&mut self, n: u32) -> u32 {
            let avail = self.shared.req_prod().wrapping_sub(self.req_cons).min(n);
            for _ in 0..avail {
                let mut raw = [0u8; RX_SLOT_SIZE];
                self.shared.read_slot(self.req_cons, &mut raw);
                let req = RxRequest::decode(&raw);
                let rsp = RxResponse { id: req.id, offset: 0, flags: RxFlags::empty(), status: 60 };
                self.shared.write_slot(self.rsp_prod, &rsp.encode());
                self.req_cons = self.req_cons.wrapping_add(1);
                self.rsp_prod = self.rsp_prod.wrapping_add(1);
            }
            self.shared.set_rsp_prod(self.rsp_prod);
            avail
        }
    }

    fn ring() -> FrontRing<RxRing> {
        FrontRing::new(Page::new().unwrap())
    }

    fn req(id: u16) -> RxRequest {
        RxRequest { id, gref: GrantRef(id as u32) }
    }

    #[test]
    fn test_offer_until_full() {
        let mut r = ring();
        for i in 0..256u16 {
            r.offer_request(&req(i)).unwrap();
        }
        assert!(r.is_full());
        assert!(matches!(r.offer_request(&req(0)), Err(NetfrontError::RingFull)));
    }

    #[test]
    fn test_first_push_notifies_then_event_suppresses() {
        let mut r = ring();
        r.offer_request(&req(0)).unwrap();
        // req_event starts at 1: publishing index 0 crosses it.
        assert!(r.push_and_check_notify());
        r.offer_request(&req(1)).unwrap();
        // Backend has not re-armed; no notification.
        assert!(!r.push_and_check_notify());
    }

    #[test]
    fn test_drain_rearms_and_sees_late_responses() {
        let mut r = ring();
        let mut peer = Peer::new(&r);
        for i in 0..4 {
            r.offer_request(&req(i)).unwrap();
        }
        r.push_and_check_notify();
        peer.answer(2);

        let ids: Vec<u16> = r
            .responses()
            .map(|raw| match raw.unwrap().decode(false) {
                RxSlot::Response(rsp) => rsp.id,
                RxSlot::Extra(_) => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(r.shared.rsp_event(), 3);
        assert_eq!(r.outstanding(), 2);

        peer.answer(2);
        assert_eq!(r.responses().count(), 2);
        assert_eq!(r.outstanding(), 0);
    }

    #[test]
    fn test_early_stop_does_not_rearm() {
        let mut r = ring();
        let mut peer = Peer::new(&r);
        for i in 0..4 {
            r.offer_request(&req(i)).unwrap();
        }
        r.push_and_check_notify();
        peer.answer(4);
        assert_eq!(r.responses().take(1).count(), 1);
        assert_eq!(r.shared.rsp_event(), 1);
        assert_eq!(r.unconsumed_responses().unwrap(), 3);
    }

    #[test]
    fn test_overrun_is_violation() {
        let mut r = ring();
        r.offer_request(&req(0)).unwrap();
        r.push_and_check_notify();
        let shared: SharedRing<RxRing> = SharedRing::attach(r.page().clone());
        shared.set_rsp_prod(2);
        let first = r.responses().next().unwrap();
        assert!(matches!(
            first,
            Err(ProtocolViolation::ResponseOverrun { published: 2, outstanding: 1, .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Offer(u8),
        Answer(u8),
        Drain(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..=64).prop_map(Op::Offer),
            (1u8..=64).prop_map(Op::Answer),
            (1u8..=64).prop_map(Op::Drain),
        ]
    }

    proptest! {
        #[test]
        fn prop_outstanding_never_exceeds_capacity(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut r = ring();
            let mut peer = Peer::new(&r);
            let mut next_id = 0u16;
            for op in ops {
                match op {
                    Op::Offer(n) => {
                        for _ in 0..n {
                            let full = r.is_full();
                            let res = r.offer_request(&req(next_id & 0xff));
                            prop_assert_eq!(res.is_err(), full);
                            next_id = next_id.wrapping_add(1);
                        }
                        r.push_and_check_notify();
                    }
                    Op::Answer(n) => {
                        peer.answer(n as u32);
                    }
                    Op::Drain(n) => {
                        for raw in r.responses().take(n as usize) {
                            prop_assert!(raw.is_ok());
                        }
                    }
                }
                prop_assert!(r.outstanding() <= FrontRing::<RxRing>::capacity());
                prop_assert!(r.unconsumed_responses().unwrap() <= r.outstanding());
            }
        }
    }
}
