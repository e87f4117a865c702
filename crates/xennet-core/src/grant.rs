//! Grant table abstraction.
//!
//! A grant binds one local page to an opaque reference the backend can
//! map until the front-end revokes it.
//!
//! # Implementors
//!
//! - `LocalGrantTable` (default, `xennet-module`): in-process table.
//!   The loopback backend maps grants through it to copy data, which
//!   makes the engine testable without a hypervisor.
//!
//! - A hypervisor grant table (future): `GNTTABOP` hypercalls or the
//!   `/dev/xen/gntalloc` device. Same contract.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::page::Page;

/// Grant reference as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantRef(pub u32);

impl GrantRef {
    pub const INVALID: GrantRef = GrantRef(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "gref#{}", self.0)
        } else {
            write!(f, "gref#invalid")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantAccess {
    ReadOnly,
    ReadWrite,
}

/// Issues and revokes grants.
///
/// **Contract:**
/// - `grant_access()` never blocks; exhaustion is `GrantsExhausted`.
/// - `end_access()` fails with `GrantInUse` while the peer still has
///   the page mapped. The caller must not reuse the page in that case.
/// - A reference is valid from `grant_access()` until `end_access()`
///   returns `Ok`. Revoking twice is `InvalidGrant`.
pub trait GrantTable: Send + Sync {
    fn grant_access(&self, page: &Arc<Page>, access: GrantAccess) -> Result<GrantRef>;

    fn end_access(&self, gref: GrantRef) -> Result<()>;

    /// Grants currently issued (diagnostics).
    fn active(&self) -> usize;
}

impl<G: GrantTable + ?Sized> GrantTable for Arc<G> {
    fn grant_access(&self, page: &Arc<Page>, access: GrantAccess) -> Result<GrantRef> {
        (**self).grant_access(page, access)
    }

    fn end_access(&self, gref: GrantRef) -> Result<()> {
        (**self).end_access(gref)
    }

    fn active(&self) -> usize {
        (**self).active()
    }
}
