//! Interface counters.
//!
//! Updated under the RX or TX lock (or none, for `send` rejections), so
//! every field is a relaxed atomic; a snapshot is not a consistent cut.

use std::sync::atomic::{AtomicU64, Ordering};

use xennet_core::frame::CastKind;

#[derive(Default)]
pub struct Stats {
    rx_unicast_packets: AtomicU64,
    rx_unicast_octets: AtomicU64,
    rx_multicast_packets: AtomicU64,
    rx_multicast_octets: AtomicU64,
    rx_broadcast_packets: AtomicU64,
    rx_broadcast_octets: AtomicU64,
    rx_errors: AtomicU64,
    rx_dropped: AtomicU64,
    rx_filtered: AtomicU64,
    rx_checksum_failed: AtomicU64,
    tx_unicast_packets: AtomicU64,
    tx_unicast_octets: AtomicU64,
    tx_multicast_packets: AtomicU64,
    tx_multicast_octets: AtomicU64,
    tx_broadcast_packets: AtomicU64,
    tx_broadcast_octets: AtomicU64,
    tx_errors: AtomicU64,
    tx_busy: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_unicast_packets: u64,
    pub rx_unicast_octets: u64,
    pub rx_multicast_packets: u64,
    pub rx_multicast_octets: u64,
    pub rx_broadcast_packets: u64,
    pub rx_broadcast_octets: u64,
    /// Frames dropped because the backend flagged an error.
    pub rx_errors: u64,
    /// Frames dropped for lack of buffers.
    pub rx_dropped: u64,
    /// Frames rejected by the packet filter.
    pub rx_filtered: u64,
    pub rx_checksum_failed: u64,
    pub tx_unicast_packets: u64,
    pub tx_unicast_octets: u64,
    pub tx_multicast_packets: u64,
    pub tx_multicast_octets: u64,
    pub tx_broadcast_packets: u64,
    pub tx_broadcast_octets: u64,
    pub tx_errors: u64,
    /// `send` calls answered with `Busy`.
    pub tx_busy: u64,
}

impl StatsSnapshot {
    pub fn rx_packets(&self) -> u64 {
        self.rx_unicast_packets + self.rx_multicast_packets + self.rx_broadcast_packets
    }

    pub fn tx_packets(&self) -> u64 {
        self.tx_unicast_packets + self.tx_multicast_packets + self.tx_broadcast_packets
    }
}

#[inline]
fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rx_frame(&self, cast: CastKind, len: usize) {
        let (p, o) = match cast {
            CastKind::Unicast => (&self.rx_unicast_packets, &self.rx_unicast_octets),
            CastKind::Multicast => (&self.rx_multicast_packets, &self.rx_multicast_octets),
            CastKind::Broadcast => (&self.rx_broadcast_packets, &self.rx_broadcast_octets),
        };
        bump(p, 1);
        bump(o, len as u64);
    }

    pub fn tx_frame(&self, cast: CastKind, len: usize) {
        let (p, o) = match cast {
            CastKind::Unicast => (&self.tx_unicast_packets, &self.tx_unicast_octets),
            CastKind::Multicast => (&self.tx_multicast_packets, &self.tx_multicast_octets),
            CastKind::Broadcast => (&self.tx_broadcast_packets, &self.tx_broadcast_octets),
        };
        bump(p, 1);
        bump(o, len as u64);
    }

    pub fn rx_error(&self) {
        bump(&self.rx_errors, 1);
    }

    pub fn rx_dropped(&self) {
        bump(&self.rx_dropped, 1);
    }

    pub fn rx_filtered(&self) {
        bump(&self.rx_filtered, 1);
    }

    pub fn rx_checksum_failed(&self) {
        bump(&self.rx_checksum_failed, 1);
    }

    pub fn tx_error(&self) {
        bump(&self.tx_errors, 1);
    }

    pub fn tx_busy(&self) {
        bump(&self.tx_busy, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            rx_unicast_packets: g(&self.rx_unicast_packets),
            rx_unicast_octets: g(&self.rx_unicast_octets),
            rx_multicast_packets: g(&self.rx_multicast_packets),
            rx_multicast_octets: g(&self.rx_multicast_octets),
            rx_broadcast_packets: g(&self.rx_broadcast_packets),
            rx_broadcast_octets: g(&self.rx_broadcast_octets),
            rx_errors: g(&self.rx_errors),
            rx_dropped: g(&self.rx_dropped),
            rx_filtered: g(&self.rx_filtered),
            rx_checksum_failed: g(&self.rx_checksum_failed),
            tx_unicast_packets: g(&self.tx_unicast_packets),
            tx_unicast_octets: g(&self.tx_unicast_octets),
            tx_multicast_packets: g(&self.tx_multicast_packets),
            tx_multicast_octets: g(&self.tx_multicast_octets),
            tx_broadcast_packets: g(&self.tx_broadcast_packets),
            tx_broadcast_octets: g(&self.tx_broadcast_octets),
            tx_errors: g(&self.tx_errors),
            tx_busy: g(&self.tx_busy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_cast() {
        let s = Stats::new();
        s.rx_frame(CastKind::Unicast, 100);
        s.rx_frame(CastKind::Broadcast, 60);
        s.tx_frame(CastKind::Multicast, 1514);
        s.rx_error();
        let snap = s.snapshot();
        assert_eq!(snap.rx_packets(), 2);
        assert_eq!(snap.rx_unicast_octets, 100);
        assert_eq!(snap.rx_broadcast_octets, 60);
        assert_eq!(snap.tx_multicast_octets, 1514);
        assert_eq!(snap.tx_packets(), 1);
        assert_eq!(snap.rx_errors, 1);
    }
}
