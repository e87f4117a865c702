//! `BufferPool`: descriptor arena with per-kind freelists.
//!
//! Three kinds of buffer, all one page of memory:
//!
//! | Kind     | Grant                         | Used for                       |
//! |----------|-------------------------------|--------------------------------|
//! | `Page`   | read-write, issued once       | RX buffers offered to the peer |
//! | `Header` | none                          | RX header copies, split frames |
//! | `Bounce` | per ring slot, by the TX path | TX header and coalesced data   |
//!
//! Descriptors carry an explicit refcount. A buffer is on its freelist
//! exactly when the count is zero; `release` past zero is an error, not
//! a double push. When a freelist already holds `freelist_max` entries
//! the released buffer is destroyed instead (grant revoked, page freed).

use std::sync::Arc;

use log::{debug, warn};

use xennet_core::error::{NetfrontError, Result};
use xennet_core::frame::BufferId;
use xennet_core::grant::{GrantAccess, GrantRef, GrantTable};
use xennet_core::page::Page;
use xennet_core::wire::{ETH_HEADER_LEN, MAX_LOOKAHEAD, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Page,
    Header,
    Bounce,
}

impl BufferKind {
    const ALL: [BufferKind; 3] = [BufferKind::Page, BufferKind::Header, BufferKind::Bounce];

    fn index(self) -> usize {
        match self {
            BufferKind::Page => 0,
            BufferKind::Header => 1,
            BufferKind::Bounce => 2,
        }
    }

    /// Usable bytes.
    pub fn capacity(self) -> usize {
        match self {
            BufferKind::Header => ETH_HEADER_LEN + MAX_LOOKAHEAD,
            BufferKind::Page | BufferKind::Bounce => PAGE_SIZE,
        }
    }
}

struct Descriptor {
    kind: BufferKind,
    page: Arc<Page>,
    gref: GrantRef,
    refcount: u32,
}

pub struct BufferPool<G: GrantTable> {
    grants: G,
    descriptors: Vec<Option<Descriptor>>,
    vacant: Vec<u32>,
    free: [Vec<BufferId>; 3],
    freelist_max: usize,
    /// Pages whose grant could not be revoked. Kept alive, never reused.
    leaked: Vec<Arc<Page>>,
}

impl<G: GrantTable> BufferPool<G> {
    pub fn new(grants: G, freelist_max: usize) -> Self {
        Self {
            grants,
            descriptors: Vec::new(),
            vacant: Vec::new(),
            free: [Vec::new(), Vec::new(), Vec::new()],
            freelist_max,
            leaked: Vec::new(),
        }
    }

    pub fn set_freelist_max(&mut self, n: usize) {
        self.freelist_max = n;
    }

    pub fn grants(&self) -> &G {
        &self.grants
    }

    fn desc(&self, id: BufferId) -> Option<&Descriptor> {
        self.descriptors.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn desc_mut(&mut self, id: BufferId) -> Result<&mut Descriptor> {
        self.descriptors
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(NetfrontError::OverRelease(id.0))
    }

    // ── Acquire / retain / release ──

    /// Pop a buffer of `kind` with refcount 1. Allocates a fresh one only
    /// when `may_allocate` (the device is connecting or active) and the
    /// freelist is empty.
    pub fn acquire(&mut self, kind: BufferKind, may_allocate: bool) -> Option<BufferId> {
        if let Some(id) = self.free[kind.index()].pop() {
            if let Some(Some(d)) = self.descriptors.get_mut(id.0 as usize) {
                d.refcount = 1;
                return Some(id);
            }
        }
        if !may_allocate {
            return None;
        }
        self.allocate(kind)
    }

    fn allocate(&mut self, kind: BufferKind) -> Option<BufferId> {
        let page = Page::new()?;
        let gref = match kind {
            BufferKind::Page => match self.grants.grant_access(&page, GrantAccess::ReadWrite) {
                Ok(gref) => gref,
                Err(e) => {
                    debug!("page buffer grant failed: {}", e);
                    return None;
                }
            },
            BufferKind::Header | BufferKind::Bounce => GrantRef::INVALID,
        };
        let desc = Descriptor { kind, page, gref, refcount: 1 };
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.descriptors[idx as usize] = Some(desc);
                idx
            }
            None => {
                self.descriptors.push(Some(desc));
                (self.descriptors.len() - 1) as u32
            }
        };
        Some(BufferId(idx))
    }

    pub fn retain(&mut self, id: BufferId) -> Result<()> {
        let d = self.desc_mut(id)?;
        if d.refcount == 0 {
            return Err(NetfrontError::OverRelease(id.0));
        }
        d.refcount += 1;
        Ok(())
    }

    /// Drop one reference. At zero the buffer goes back to its freelist,
    /// or is destroyed when the freelist is at its high-water mark.
    pub fn release(&mut self, id: BufferId) -> Result<()> {
        let freelist_max = self.freelist_max;
        let d = self.desc_mut(id)?;
        if d.refcount == 0 {
            return Err(NetfrontError::OverRelease(id.0));
        }
        d.refcount -= 1;
        if d.refcount > 0 {
            return Ok(());
        }
        let kind = d.kind;
        if self.free[kind.index()].len() >= freelist_max {
            self.destroy(id);
        } else {
            self.free[kind.index()].push(id);
        }
        Ok(())
    }

    /// Revoke the grant (if any) and free the slot. A grant the peer
    /// still maps is leaked with its page rather than reused.
    fn destroy(&mut self, id: BufferId) {
        let Some(desc) = self.descriptors.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        if desc.gref.is_valid() {
            if let Err(e) = self.grants.end_access(desc.gref) {
                warn!("buffer {}: cannot revoke {}: {}; leaking page", id.0, desc.gref, e);
                self.leaked.push(desc.page);
            }
        }
        self.vacant.push(id.0);
    }

    // ── Accessors ──

    pub fn page(&self, id: BufferId) -> Option<&Arc<Page>> {
        self.desc(id).map(|d| &d.page)
    }

    pub fn gref(&self, id: BufferId) -> GrantRef {
        self.desc(id).map_or(GrantRef::INVALID, |d| d.gref)
    }

    pub fn kind(&self, id: BufferId) -> Option<BufferKind> {
        self.desc(id).map(|d| d.kind)
    }

    pub fn refcount(&self, id: BufferId) -> u32 {
        self.desc(id).map_or(0, |d| d.refcount)
    }

    pub fn free_count(&self, kind: BufferKind) -> usize {
        self.free[kind.index()].len()
    }

    /// Descriptors that exist (free or not).
    pub fn live(&self) -> usize {
        self.descriptors.len() - self.vacant.len()
    }

    /// Descriptors with a non-zero refcount.
    pub fn in_use(&self) -> usize {
        self.live() - BufferKind::ALL.iter().map(|k| self.free_count(*k)).sum::<usize>()
    }

    pub fn leaked(&self) -> usize {
        self.leaked.len()
    }

    /// Destroy every free buffer. Returns how many are still referenced;
    /// those stay live (their holders will release them into a pool that
    /// then destroys them, since the freelists are capped at zero).
    pub fn teardown(&mut self) -> usize {
        for kind in BufferKind::ALL {
            while let Some(id) = self.free[kind.index()].pop() {
                self.destroy(id);
            }
        }
        self.freelist_max = 0;
        self.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use xennet_module::LocalGrantTable;

    fn pool(max: usize) -> (Arc<LocalGrantTable>, BufferPool<Arc<LocalGrantTable>>) {
        let grants = Arc::new(LocalGrantTable::new(1024));
        (grants.clone(), BufferPool::new(grants, max))
    }

    #[test]
    fn test_page_buffers_are_granted_once() {
        let (grants, mut p) = pool(8);
        let id = p.acquire(BufferKind::Page, true).unwrap();
        let gref = p.gref(id);
        assert!(gref.is_valid());
        p.release(id).unwrap();
        assert_eq!(p.free_count(BufferKind::Page), 1);

        let again = p.acquire(BufferKind::Page, true).unwrap();
        assert_eq!(again, id);
        assert_eq!(p.gref(again), gref);
        assert_eq!(grants.active(), 1);
    }

    #[test]
    fn test_header_buffers_are_not_granted() {
        let (grants, mut p) = pool(8);
        let id = p.acquire(BufferKind::Header, true).unwrap();
        assert!(!p.gref(id).is_valid());
        assert_eq!(grants.active(), 0);
        assert_eq!(BufferKind::Header.capacity(), 270);
    }

    #[test]
    fn test_no_allocation_when_not_accepting() {
        let (_g, mut p) = pool(8);
        assert!(p.acquire(BufferKind::Page, false).is_none());
        let id = p.acquire(BufferKind::Page, true).unwrap();
        p.release(id).unwrap();
        // Recycling is still allowed.
        assert_eq!(p.acquire(BufferKind::Page, false), Some(id));
    }

    #[test]
    fn test_refcount_and_over_release() {
        let (_g, mut p) = pool(8);
        let id = p.acquire(BufferKind::Page, true).unwrap();
        p.retain(id).unwrap();
        p.release(id).unwrap();
        assert_eq!(p.refcount(id), 1);
        assert_eq!(p.free_count(BufferKind::Page), 0);
        p.release(id).unwrap();
        assert_eq!(p.free_count(BufferKind::Page), 1);
        assert!(matches!(p.release(id), Err(NetfrontError::OverRelease(_))));
        assert!(p.retain(id).is_err());
        assert_eq!(p.free_count(BufferKind::Page), 1);
    }

    #[test]
    fn test_high_water_destroys_and_revokes() {
        let (grants, mut p) = pool(1);
        let a = p.acquire(BufferKind::Page, true).unwrap();
        let b = p.acquire(BufferKind::Page, true).unwrap();
        assert_eq!(grants.active(), 2);
        p.release(a).unwrap();
        p.release(b).unwrap();
        assert_eq!(p.free_count(BufferKind::Page), 1);
        assert_eq!(grants.active(), 1);
        assert_eq!(p.live(), 1);
    }

    #[test]
    fn test_mapped_grant_is_leaked_not_reused() {
        let (grants, mut p) = pool(0);
        let id = p.acquire(BufferKind::Page, true).unwrap();
        let gref = p.gref(id);
        let _page = grants.map(gref, true).unwrap();
        p.release(id).unwrap();
        assert_eq!(p.leaked(), 1);
        assert_eq!(p.live(), 0);
        grants.unmap(gref).unwrap();
    }

    #[test]
    fn test_teardown_reports_in_use() {
        let (grants, mut p) = pool(8);
        let held = p.acquire(BufferKind::Page, true).unwrap();
        let freed = p.acquire(BufferKind::Page, true).unwrap();
        p.release(freed).unwrap();
        assert_eq!(p.teardown(), 1);
        assert_eq!(grants.active(), 1);
        p.release(held).unwrap();
        assert_eq!(grants.active(), 0);
        assert_eq!(p.live(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(bool),
        Retain(usize),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Acquire),
            (0usize..16).prop_map(Op::Retain),
            (0usize..16).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_free_iff_refcount_zero(ops in proptest::collection::vec(op_strategy(), 1..300), max in 0usize..6) {
            let (grants, mut p) = pool(max);
            // Model: handles we hold, with our own count of references.
            let mut held: Vec<(BufferId, u32)> = Vec::new();
            for op in ops {
                match op {
                    Op::Acquire(header) => {
                        let kind = if header { BufferKind::Header } else { BufferKind::Page };
                        let id = p.acquire(kind, true).unwrap();
                        prop_assert!(held.iter().all(|(h, _)| *h != id));
                        held.push((id, 1));
                    }
                    Op::Retain(i) if !held.is_empty() => {
                        let i = i % held.len();
                        p.retain(held[i].0).unwrap();
                        held[i].1 += 1;
                    }
                    Op::Release(i) if !held.is_empty() => {
                        let i = i % held.len();
                        p.release(held[i].0).unwrap();
                        held[i].1 -= 1;
                        if held[i].1 == 0 {
                            held.swap_remove(i);
                        }
                    }
                    _ => {}
                }
                for (id, refs) in &held {
                    prop_assert_eq!(p.refcount(*id), *refs);
                }
                prop_assert_eq!(p.in_use(), held.len());
                prop_assert!(p.free_count(BufferKind::Page) <= max);
                let granted_pages = held.iter().filter(|(id, _)| p.kind(*id) == Some(BufferKind::Page)).count()
                    + p.free_count(BufferKind::Page);
                prop_assert_eq!(grants.active(), granted_pages);
            }
        }
    }
}
