//! Event-channel abstraction.
//!
//! A `Notifier` kicks the peer after requests were published and the
//! ring's event threshold says the peer asked to be woken.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (Linux default): writes 1 to an eventfd.
//! - `ParkNotifier` (portable): sets a flag and wakes a condvar waiter.
//! - A hypervisor event channel (future): `EVTCHNOP_send`.

use std::sync::Arc;

use crate::error::Result;

/// Out-of-band, edge-triggered signal to the peer.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the peer wakes may be coalesced.
/// - Called at most once per ring publish, only when the ring's
///   notify check asked for it.
pub trait Notifier: Send + Sync {
    fn notify(&self) -> Result<()>;
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn notify(&self) -> Result<()> {
        (**self).notify()
    }
}
