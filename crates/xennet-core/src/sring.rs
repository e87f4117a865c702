//! `SharedRing`: raw view of one shared ring page.
//!
//! Gives both peers the same accessors over the header cursors and the
//! slot array. The cursor protocols themselves (private producer
//! index, notify thresholds) live with each side: `FrontRing` in
//! `xennet-engine`, the backend ring in `xennet-module`'s loopback.
//!
//! # Atomics
//!
//! The four header cursors are `AtomicU32` views into the page. Stores
//! publishing a producer index use `Release`; loads of the peer's
//! producer index use `Acquire`, so slot contents written before the
//! store are visible after the load. Event thresholds are checked after
//! a `SeqCst` fence (the "full barrier" of the notify check).

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::page::Page;
use crate::wire::{offsets, RingKind, RING_HEADER_SIZE};

pub struct SharedRing<K: RingKind> {
    page: Arc<Page>,
    _kind: PhantomData<K>,
}

impl<K: RingKind> SharedRing<K> {
    /// Front-end side: reset the header. Both event thresholds start at 1
    /// so the first request/response triggers a notification.
    pub fn init(page: Arc<Page>) -> Self {
        page.fill(0);
        let ring = Self { page, _kind: PhantomData };
        ring.cursor(offsets::REQ_EVENT).store(1, Ordering::Release);
        ring.cursor(offsets::RSP_EVENT).store(1, Ordering::Release);
        ring
    }

    /// Backend side: use the page as the front-end initialised it.
    pub fn attach(page: Arc<Page>) -> Self {
        Self { page, _kind: PhantomData }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    #[inline(always)]
    fn cursor(&self, offset: usize) -> &AtomicU32 {
        // Safety: the page is 4096-aligned and lives as long as `self`;
        // header offsets are 4-byte aligned and inside the page.
        unsafe { &*(self.page.as_ptr().add(offset) as *const AtomicU32) }
    }

    #[inline]
    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        let slot = (idx & (K::CAPACITY - 1)) as usize;
        unsafe { self.page.as_ptr().add(RING_HEADER_SIZE + slot * K::SLOT_SIZE) }
    }

    // ── Header cursors ──

    pub fn req_prod(&self) -> u32 {
        self.cursor(offsets::REQ_PROD).load(Ordering::Acquire)
    }

    pub fn set_req_prod(&self, v: u32) {
        self.cursor(offsets::REQ_PROD).store(v, Ordering::Release);
    }

    pub fn req_event(&self) -> u32 {
        self.cursor(offsets::REQ_EVENT).load(Ordering::Acquire)
    }

    pub fn set_req_event(&self, v: u32) {
        self.cursor(offsets::REQ_EVENT).store(v, Ordering::Release);
    }

    pub fn rsp_prod(&self) -> u32 {
        self.cursor(offsets::RSP_PROD).load(Ordering::Acquire)
    }

    pub fn set_rsp_prod(&self, v: u32) {
        self.cursor(offsets::RSP_PROD).store(v, Ordering::Release);
    }

    pub fn rsp_event(&self) -> u32 {
        self.cursor(offsets::RSP_EVENT).load(Ordering::Acquire)
    }

    pub fn set_rsp_event(&self, v: u32) {
        self.cursor(offsets::RSP_EVENT).store(v, Ordering::Release);
    }

    // ── Slots ──

    /// Write raw slot bytes at ring index `idx` (masked).
    pub fn write_slot(&self, idx: u32, bytes: &[u8]) {
        let n = bytes.len().min(K::SLOT_SIZE);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_ptr(idx), n);
        }
    }

    /// Read raw slot bytes at ring index `idx` (masked).
    pub fn read_slot(&self, idx: u32, out: &mut [u8]) {
        let n = out.len().min(K::SLOT_SIZE);
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(idx), out.as_mut_ptr(), n);
        }
    }
}

/// `(new - event) < (new - old)` in wrapping arithmetic: did the
/// producer step over the consumer's requested wake-up point?
#[inline]
pub fn crossed_event(old: u32, new: u32, event: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{RxRing, TxRing, TX_SLOT_SIZE};

    #[test]
    fn test_init_sets_event_thresholds() {
        let ring: SharedRing<RxRing> = SharedRing::init(Page::new().unwrap());
        assert_eq!(ring.req_prod(), 0);
        assert_eq!(ring.rsp_prod(), 0);
        assert_eq!(ring.req_event(), 1);
        assert_eq!(ring.rsp_event(), 1);
    }

    #[test]
    fn test_slot_indices_wrap() {
        let page = Page::new().unwrap();
        let ring: SharedRing<TxRing> = SharedRing::init(page.clone());
        ring.write_slot(256 + 3, &[9u8; TX_SLOT_SIZE]);
        let mut out = [0u8; TX_SLOT_SIZE];
        ring.read_slot(3, &mut out);
        assert_eq!(out, [9u8; TX_SLOT_SIZE]);
        assert_eq!(page.to_vec(RING_HEADER_SIZE + 3 * TX_SLOT_SIZE, 1), vec![9]);
    }

    #[test]
    fn test_crossed_event() {
        // Consumer asked to be woken at 5; producer moved 3 -> 6.
        assert!(crossed_event(3, 6, 5));
        // Already past: event 2 is behind old.
        assert!(!crossed_event(3, 6, 2));
        // Not yet reached.
        assert!(!crossed_event(3, 6, 8));
        // Wrapping cursors.
        assert!(crossed_event(u32::MAX - 1, 1, u32::MAX));
    }
}
