//! Library defaults. Environment variables override these at runtime.

use crate::wire::{MAX_LOOKAHEAD, RX_RING_SIZE};

/// Transport checksum offload negotiated with the backend.
pub const CHECKSUM_OFFLOAD: bool = true;

/// Largest TCP payload accepted for large-send offload. 0 disables LSO.
pub const GSO_SEGMENT_SIZE: u32 = 61440;

/// Scatter-gather: frames may span several ring slots.
pub const SG_ENABLED: bool = true;

/// Build small multi-buffer RX frames over their first page.
pub const COALESCE_SMALL_FRAMES: bool = true;

/// Verify transport checksums of RX frames the backend did not vouch for.
pub const VERIFY_RX_CHECKSUMS: bool = false;

/// RX buffers kept offered to the backend.
pub const RX_TARGET: u32 = RX_RING_SIZE;

/// Idle page buffers kept on the freelist; extras are revoked and freed.
pub const RX_FREELIST_MAX: usize = 512;

/// Frames processed per RX pass before rescheduling.
pub const RX_PACKET_QUOTA: u32 = 2560;

/// Bytes processed per RX pass before rescheduling.
pub const RX_BYTE_QUOTA: u64 = 2560 * 1500;

/// Header bytes past the Ethernet header copied into RX header buffers.
pub const LOOKAHEAD: usize = MAX_LOOKAHEAD;

/// How often a blocked shutdown re-checks and logs progress.
pub const SHUTDOWN_POLL_MS: u64 = 1000;
