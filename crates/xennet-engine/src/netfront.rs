//! `Netfront`: the compositor that wires rings, pools and the shim.
//!
//! ```text
//! Netfront<
//!     G: GrantTable,     issues grants for ring pages and buffers
//!     N: Notifier,       kicks the backend after a publish
//!     S: AdapterShim,    receives frames, completions and link changes
//! >
//! ```
//!
//! # Locking
//!
//! RX and TX each sit behind their own mutex. A pass that needs both
//! takes RX first and drops it before taking TX; configuration changes
//! take RX then TX. Shim callbacks always run with no lock held, so the
//! shim may call back into `send` or `return_rx_buffer`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use log::{debug, error, info, warn};

use xennet_core::config::{NetfrontConfig, Options, PacketFilter};
use xennet_core::error::{Busy, NetfrontError, ProtocolViolation, Result};
use xennet_core::frame::{RxFrame, SendStatus, TxFrame};
use xennet_core::grant::{GrantAccess, GrantRef, GrantTable};
use xennet_core::notifier::Notifier;
use xennet_core::page::Page;
use xennet_core::shim::AdapterShim;
use xennet_core::state::{DeviceState, LinkState};

use crate::rx::{Drain, RxConfig, RxPath};
use crate::stats::{Stats, StatsSnapshot};
use crate::tx::{Completion, TxPath};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Netfront<G, N, S>
where
    G: GrantTable,
    N: Notifier,
    S: AdapterShim,
{
    grants: Arc<G>,
    notifier: N,
    shim: Arc<S>,
    state: AtomicU8,
    rx: Mutex<RxPath<Arc<G>>>,
    /// Signalled when the shim hands back its last RX frame.
    rx_idle: Condvar,
    tx: Mutex<TxPath<Arc<G>>>,
    /// Signalled after every TX completion pass.
    tx_idle: Condvar,
    tx_queue: SegQueue<TxFrame>,
    stats: Stats,
    /// Ring grants still to revoke, `(tx, rx)`.
    ring_refs: Mutex<Option<(GrantRef, GrantRef)>>,
    shutdown_poll: Duration,
}

impl<G, N, S> Netfront<G, N, S>
where
    G: GrantTable,
    N: Notifier,
    S: AdapterShim,
{
    /// Allocate both ring pages. Nothing is shared until `connect`.
    pub fn new(config: NetfrontConfig, grants: Arc<G>, notifier: N, shim: Arc<S>) -> Result<Self> {
        config.validate()?;
        let tx_page = Page::new().ok_or(NetfrontError::OutOfMemory)?;
        let rx_page = Page::new().ok_or(NetfrontError::OutOfMemory)?;
        let rx = RxPath::new(rx_page, grants.clone(), config.rx_freelist_max, RxConfig::from_config(&config));
        let tx = TxPath::new(tx_page, grants.clone(), config.rx_freelist_max, config.options);
        Ok(Self {
            grants,
            notifier,
            shim,
            state: AtomicU8::new(DeviceState::Inactive as u8),
            rx: Mutex::new(rx),
            rx_idle: Condvar::new(),
            tx: Mutex::new(tx),
            tx_idle: Condvar::new(),
            tx_queue: SegQueue::new(),
            stats: Stats::new(),
            ring_refs: Mutex::new(None),
            shutdown_poll: config.shutdown_poll,
        })
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: DeviceState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Grant references of the `(tx, rx)` ring pages, for the backend.
    pub fn ring_refs(&self) -> Option<(GrantRef, GrantRef)> {
        *lock(&self.ring_refs)
    }

    /// RX frames held by the shim.
    pub fn rx_outstanding(&self) -> usize {
        lock(&self.rx).outstanding()
    }

    /// Idle page buffers on the RX freelist.
    pub fn rx_free_buffers(&self) -> usize {
        lock(&self.rx).pool().free_count(crate::pool::BufferKind::Page)
    }

    /// TX frames on the ring without a completion.
    pub fn tx_outstanding(&self) -> usize {
        lock(&self.tx).outstanding()
    }

    fn kick(&self) {
        if let Err(e) = self.notifier.notify() {
            warn!("backend notify failed: {}", e);
        }
    }

    // ── Lifecycle ──

    /// Share both ring pages, fill the RX ring and go `Active`.
    /// Returns the `(tx, rx)` ring grant references.
    pub fn connect(&self) -> Result<(GrantRef, GrantRef)> {
        let state = self.state();
        if state != DeviceState::Inactive {
            return Err(NetfrontError::Unsupported("connect on an engine that is not inactive"));
        }
        self.set_state(DeviceState::Initialising);

        let tx_page = lock(&self.tx).ring_page().clone();
        let rx_page = lock(&self.rx).ring_page().clone();
        let tx_ref = match self.grants.grant_access(&tx_page, GrantAccess::ReadWrite) {
            Ok(r) => r,
            Err(e) => {
                self.set_state(DeviceState::Inactive);
                return Err(e);
            }
        };
        let rx_ref = match self.grants.grant_access(&rx_page, GrantAccess::ReadWrite) {
            Ok(r) => r,
            Err(e) => {
                if let Err(e2) = self.grants.end_access(tx_ref) {
                    warn!("connect rollback: {}", e2);
                }
                self.set_state(DeviceState::Inactive);
                return Err(e);
            }
        };
        *lock(&self.ring_refs) = Some((tx_ref, rx_ref));

        self.set_state(DeviceState::Active);
        let (notify, offered) = {
            let mut rx = lock(&self.rx);
            let notify = rx.fill(DeviceState::Active);
            (notify, rx.offered())
        };
        if notify {
            self.kick();
        }
        info!("netfront connected: tx ring {} rx ring {}, {} rx buffers offered", tx_ref, rx_ref, offered);
        self.shim.on_link_state_changed(LinkState::Up);
        Ok((tx_ref, rx_ref))
    }

    /// Stop traffic and reclaim everything. Blocks until every TX frame
    /// on the ring is answered and the shim has returned every RX frame.
    ///
    /// Ring grants the backend still maps are kept and reported as
    /// `GrantInUse`; call [`release_rings`](Self::release_rings) again
    /// once it has detached.
    pub fn shutdown(&self) -> Result<()> {
        let prev = self.state();
        match prev {
            DeviceState::Inactive | DeviceState::Disconnected => {
                self.set_state(DeviceState::Disconnected);
                return self.release_rings();
            }
            DeviceState::Faulted => {}
            _ => {
                self.set_state(DeviceState::Disconnecting);
                self.shim.on_link_state_changed(LinkState::Down);
            }
        }
        info!("netfront shutdown from {}", prev);

        let mut completions = Vec::new();
        let violation = self.drain_tx(&mut completions);
        for (frame, _) in &completions {
            debug!("shutdown: failing {} byte frame", frame.len());
        }
        self.complete_tx(completions);
        if let Some(v) = violation {
            self.fault(v);
        }

        {
            let mut rx = lock(&self.rx);
            while rx.outstanding() > 0 {
                info!("shutdown: waiting for {} rx frames held by the stack", rx.outstanding());
                let (guard, _) = self
                    .rx_idle
                    .wait_timeout(rx, self.shutdown_poll)
                    .unwrap_or_else(PoisonError::into_inner);
                rx = guard;
            }
            let left = rx.teardown();
            if left > 0 {
                warn!("shutdown: {} rx buffers still referenced", left);
            }
        }
        {
            let mut tx = lock(&self.tx);
            let left = tx.teardown();
            if left > 0 {
                warn!("shutdown: {} tx bounce buffers still referenced", left);
            }
        }

        self.set_state(DeviceState::Disconnected);
        info!("netfront disconnected");
        self.release_rings()
    }

    /// Wait for TX completions, polling the ring every interval, then fail
    /// whatever never made it onto the ring.
    fn drain_tx(&self, completions: &mut Vec<Completion>) -> Option<ProtocolViolation> {
        let mut violation = None;
        let mut tx = lock(&self.tx);
        loop {
            if self.state() == DeviceState::Faulted {
                if tx.outstanding() > 0 {
                    warn!("shutdown: abandoning {} tx frames on a faulted ring", tx.outstanding());
                }
                tx.abandon_in_flight(completions);
                break;
            }
            if let Err(v) = tx.collect_completions(true, &self.stats, completions) {
                violation = Some(v);
                tx.abandon_in_flight(completions);
                break;
            }
            if tx.outstanding() == 0 {
                break;
            }
            info!("shutdown: waiting for {} tx frames", tx.outstanding());
            let (guard, _) = self
                .tx_idle
                .wait_timeout(tx, self.shutdown_poll)
                .unwrap_or_else(PoisonError::into_inner);
            tx = guard;
        }
        if let Some(frame) = tx.take_stalled() {
            self.stats.tx_error();
            completions.push((frame, SendStatus::Failure));
        }
        while let Some(frame) = self.tx_queue.pop() {
            self.stats.tx_error();
            completions.push((frame, SendStatus::Failure));
        }
        violation
    }

    /// Revoke the ring grants. A grant the backend still maps stays
    /// recorded and the call fails with `GrantInUse`; retry after the
    /// backend has unmapped it.
    pub fn release_rings(&self) -> Result<()> {
        let mut refs = lock(&self.ring_refs);
        let Some((tx_ref, rx_ref)) = *refs else {
            return Ok(());
        };
        let mut remaining = (GrantRef::INVALID, GrantRef::INVALID);
        let mut first_err = None;
        for (gref, slot) in [(tx_ref, &mut remaining.0), (rx_ref, &mut remaining.1)] {
            if !gref.is_valid() {
                continue;
            }
            if let Err(e) = self.grants.end_access(gref) {
                warn!("ring grant {} not revoked: {}", gref, e);
                *slot = gref;
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => {
                *refs = None;
                Ok(())
            }
            Some(e) => {
                *refs = Some(remaining);
                Err(e)
            }
        }
    }

    fn fault(&self, v: ProtocolViolation) {
        error!("netfront faulted: {}", v);
        self.set_state(DeviceState::Faulted);
        self.shim.on_link_state_changed(LinkState::Down);
        self.rx_idle.notify_all();
        self.tx_idle.notify_all();
    }

    // ── Data path ──

    /// Queue a frame for transmission and push as much as the ring takes.
    ///
    /// `Err(Busy)` means the frame is accepted but waiting behind
    /// backpressure; it goes out on a later completion pass. While not
    /// `Active` the frame is failed straight back through the shim.
    pub fn send(&self, frame: TxFrame) -> std::result::Result<(), Busy> {
        if !self.state().is_active() {
            self.stats.tx_error();
            self.shim.on_frame_sent(frame, SendStatus::Failure);
            return Ok(());
        }
        self.tx_queue.push(frame);

        let mut completions = Vec::new();
        let (notify, busy) = {
            let mut tx = lock(&self.tx);
            // Read under the lock: shutdown flips the state before it
            // drains the queue.
            let state = self.state();
            let notify = tx.send_queued(&self.tx_queue, state, &self.stats, &mut completions);
            (notify, tx.is_stalled() || !self.tx_queue.is_empty())
        };
        if notify {
            self.kick();
        }
        self.complete_tx(completions);
        if busy {
            self.stats.tx_busy();
            return Err(Busy);
        }
        Ok(())
    }

    /// The shim is done with a received frame.
    pub fn return_rx_buffer(&self, frame: RxFrame) {
        let remaining = lock(&self.rx).return_frame(frame);
        if remaining == 0 {
            self.rx_idle.notify_all();
        }
    }

    /// Event-channel entry point: drain RX, reclaim TX, push queued TX.
    pub fn handle_event(&self) -> Drain {
        let state = self.state();
        if !matches!(state, DeviceState::Active | DeviceState::Disconnecting) {
            return Drain::Idle;
        }

        let mut received = Vec::new();
        let rx_result = lock(&self.rx).poll(state, &self.stats, &mut received);
        let drain = match rx_result {
            Ok(pass) => {
                if pass.notify {
                    self.kick();
                }
                pass.drain
            }
            Err(v) => {
                self.fault(v);
                return Drain::Idle;
            }
        };

        let mut completions = Vec::new();
        let mut violation = None;
        let mut notify = false;
        {
            let mut tx = lock(&self.tx);
            match tx.collect_completions(drain != Drain::Reschedule, &self.stats, &mut completions) {
                Ok(()) => notify = tx.send_queued(&self.tx_queue, self.state(), &self.stats, &mut completions),
                Err(v) => violation = Some(v),
            }
        }
        if notify {
            self.kick();
        }

        for frame in received {
            self.shim.on_frame_received(frame);
        }
        self.complete_tx(completions);
        if let Some(v) = violation {
            self.fault(v);
        }
        drain
    }

    fn complete_tx(&self, completions: Vec<Completion>) {
        if completions.is_empty() {
            return;
        }
        for (frame, status) in completions {
            self.shim.on_frame_sent(frame, status);
        }
        self.tx_idle.notify_all();
    }

    // ── Configuration ──

    pub fn configure(&self, options: Options) {
        let mut rx = lock(&self.rx);
        let mut tx = lock(&self.tx);
        rx.config_mut().options = options;
        tx.set_options(options);
        info!("netfront options: {:?}", options);
    }

    pub fn options(&self) -> Options {
        lock(&self.tx).options()
    }

    pub fn set_packet_filter(&self, filter: PacketFilter) {
        lock(&self.rx).config_mut().packet_filter = filter;
        debug!("packet filter {:?}", filter);
    }

    pub fn set_multicast_list(&self, list: Vec<[u8; 6]>) {
        lock(&self.rx).config_mut().multicast_list = list;
    }

    pub fn set_mac_address(&self, mac: [u8; 6]) {
        lock(&self.rx).config_mut().mac_address = mac;
    }

    pub fn mac_address(&self) -> [u8; 6] {
        lock(&self.rx).config().mac_address
    }
}
