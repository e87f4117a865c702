//! `LocalGrantTable`: default `GrantTable` implementation.
//!
//! An in-process table: a reference names a slot holding the granted
//! page. The peer side (`LoopbackBackend`, tests) goes through
//! [`LocalGrantTable::map`] / [`LocalGrantTable::unmap`] exactly as a
//! real backend maps foreign pages, so `end_access` on a mapped grant
//! fails with `GrantInUse` the way the hypervisor would refuse it.
//!
//! Optional audit log: every grant and revoke, in order, for tests that
//! check grant lifetimes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use xennet_core::error::{NetfrontError, Result};
use xennet_core::grant::{GrantAccess, GrantRef, GrantTable};
use xennet_core::page::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantEvent {
    Granted(GrantRef),
    Revoked(GrantRef),
}

struct Entry {
    page: Arc<Page>,
    access: GrantAccess,
    mapped: u32,
}

#[derive(Default)]
struct Table {
    entries: Vec<Option<Entry>>,
    free_refs: Vec<u32>,
    active: usize,
    /// Grants that may still be issued before `grant_access` fails.
    /// `None` means only `capacity` limits.
    budget: Option<usize>,
    audit: Option<Vec<GrantEvent>>,
}

pub struct LocalGrantTable {
    table: Mutex<Table>,
    capacity: usize,
}

impl LocalGrantTable {
    /// Xen's v1 table default: 32 frames of 512 entries.
    pub const DEFAULT_CAPACITY: usize = 16384;

    pub fn new(capacity: usize) -> Self {
        Self { table: Mutex::new(Table::default()), capacity }
    }

    /// Same table, recording every grant and revoke.
    pub fn with_audit(capacity: usize) -> Self {
        let t = Self::new(capacity);
        t.lock().audit = Some(Vec::new());
        t
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allow `n` more grants, then fail with `GrantsExhausted` until
    /// [`clear_budget`](Self::clear_budget).
    pub fn set_budget(&self, n: usize) {
        self.lock().budget = Some(n);
    }

    pub fn clear_budget(&self) {
        self.lock().budget = None;
    }

    pub fn events(&self) -> Vec<GrantEvent> {
        self.lock().audit.clone().unwrap_or_default()
    }

    // ── Peer side ──

    /// Map a grant: the page stays pinned until [`unmap`](Self::unmap).
    /// `write` requires a read-write grant.
    pub fn map(&self, gref: GrantRef, write: bool) -> Result<Arc<Page>> {
        let mut t = self.lock();
        let entry = t
            .entries
            .get_mut(gref.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(NetfrontError::InvalidGrant(gref.0))?;
        if write && entry.access == GrantAccess::ReadOnly {
            return Err(NetfrontError::Unsupported("write mapping of a read-only grant"));
        }
        entry.mapped += 1;
        Ok(entry.page.clone())
    }

    pub fn unmap(&self, gref: GrantRef) -> Result<()> {
        let mut t = self.lock();
        let entry = t
            .entries
            .get_mut(gref.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(NetfrontError::InvalidGrant(gref.0))?;
        if entry.mapped == 0 {
            return Err(NetfrontError::InvalidGrant(gref.0));
        }
        entry.mapped -= 1;
        Ok(())
    }

    /// Map, run `f`, unmap.
    pub fn with_mapped<R>(&self, gref: GrantRef, write: bool, f: impl FnOnce(&Page) -> R) -> Result<R> {
        let page = self.map(gref, write)?;
        let r = f(&page);
        self.unmap(gref)?;
        Ok(r)
    }

    pub fn is_mapped(&self, gref: GrantRef) -> bool {
        let t = self.lock();
        matches!(t.entries.get(gref.0 as usize), Some(Some(e)) if e.mapped > 0)
    }
}

impl Default for LocalGrantTable {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl GrantTable for LocalGrantTable {
    fn grant_access(&self, page: &Arc<Page>, access: GrantAccess) -> Result<GrantRef> {
        let mut t = self.lock();
        if t.active >= self.capacity {
            return Err(NetfrontError::GrantsExhausted);
        }
        if let Some(budget) = t.budget.as_mut() {
            if *budget == 0 {
                return Err(NetfrontError::GrantsExhausted);
            }
            *budget -= 1;
        }
        let entry = Entry { page: page.clone(), access, mapped: 0 };
        let idx = match t.free_refs.pop() {
            Some(idx) => {
                t.entries[idx as usize] = Some(entry);
                idx
            }
            None => {
                t.entries.push(Some(entry));
                (t.entries.len() - 1) as u32
            }
        };
        t.active += 1;
        let gref = GrantRef(idx);
        if let Some(audit) = t.audit.as_mut() {
            audit.push(GrantEvent::Granted(gref));
        }
        trace!("granted {} ({:?})", gref, access);
        Ok(gref)
    }

    fn end_access(&self, gref: GrantRef) -> Result<()> {
        let mut t = self.lock();
        match t.entries.get(gref.0 as usize) {
            Some(Some(e)) if e.mapped > 0 => return Err(NetfrontError::GrantInUse(gref.0)),
            Some(Some(_)) => {}
            _ => return Err(NetfrontError::InvalidGrant(gref.0)),
        }
        t.entries[gref.0 as usize] = None;
        t.free_refs.push(gref.0);
        t.active -= 1;
        if let Some(audit) = t.audit.as_mut() {
            audit.push(GrantEvent::Revoked(gref));
        }
        trace!("revoked {}", gref);
        Ok(())
    }

    fn active(&self) -> usize {
        self.lock().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_map_revoke() {
        let table = LocalGrantTable::with_audit(8);
        let page = Page::new().unwrap();
        let gref = table.grant_access(&page, GrantAccess::ReadWrite).unwrap();
        assert_eq!(table.active(), 1);

        table.with_mapped(gref, true, |p| p.write(0, b"abc")).unwrap();
        assert_eq!(page.to_vec(0, 3), b"abc");

        table.end_access(gref).unwrap();
        assert_eq!(table.active(), 0);
        assert_eq!(table.events(), vec![GrantEvent::Granted(gref), GrantEvent::Revoked(gref)]);
    }

    #[test]
    fn test_revoke_while_mapped_refused() {
        let table = LocalGrantTable::new(8);
        let page = Page::new().unwrap();
        let gref = table.grant_access(&page, GrantAccess::ReadOnly).unwrap();
        let _mapped = table.map(gref, false).unwrap();
        assert!(matches!(table.end_access(gref), Err(NetfrontError::GrantInUse(_))));
        table.unmap(gref).unwrap();
        table.end_access(gref).unwrap();
    }

    #[test]
    fn test_double_revoke_is_invalid() {
        let table = LocalGrantTable::new(8);
        let gref = table.grant_access(&Page::new().unwrap(), GrantAccess::ReadOnly).unwrap();
        table.end_access(gref).unwrap();
        assert!(matches!(table.end_access(gref), Err(NetfrontError::InvalidGrant(_))));
    }

    #[test]
    fn test_read_only_refuses_write_mapping() {
        let table = LocalGrantTable::new(8);
        let gref = table.grant_access(&Page::new().unwrap(), GrantAccess::ReadOnly).unwrap();
        assert!(table.map(gref, true).is_err());
        assert!(!table.is_mapped(gref));
    }

    #[test]
    fn test_capacity_and_budget() {
        let table = LocalGrantTable::new(2);
        let page = Page::new().unwrap();
        let a = table.grant_access(&page, GrantAccess::ReadOnly).unwrap();
        let _b = table.grant_access(&page, GrantAccess::ReadOnly).unwrap();
        assert!(matches!(
            table.grant_access(&page, GrantAccess::ReadOnly),
            Err(NetfrontError::GrantsExhausted)
        ));
        table.end_access(a).unwrap();

        table.set_budget(0);
        assert!(table.grant_access(&page, GrantAccess::ReadOnly).is_err());
        table.clear_budget();
        assert!(table.grant_access(&page, GrantAccess::ReadOnly).is_ok());
    }
}
