//! `ParkNotifier`: portable `Notifier` over a flag and a condvar.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use xennet_core::error::Result;
use xennet_core::notifier::Notifier;

use crate::EventWait;

#[derive(Default)]
pub struct ParkNotifier {
    pending: Mutex<bool>,
    cv: Condvar,
    sent: AtomicU64,
}

impl ParkNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same shape as `EventFdNotifier::create` so either can be the default.
    pub fn create() -> Result<Self> {
        Ok(Self::new())
    }

    /// Consume a pending notification without blocking.
    pub fn take(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *pending, false)
    }

    /// Total `notify()` calls so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Notifier for ParkNotifier {
    fn notify(&self) -> Result<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.cv.notify_all();
        Ok(())
    }
}

impl EventWait for ParkNotifier {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .cv
            .wait_timeout_while(pending, timeout, |p| !*p)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::replace(&mut *pending, false))
    }
}
