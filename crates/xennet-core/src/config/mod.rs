//! xennet configuration.
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls / `Netfront::configure` (runtime, programmatic)
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use xennet_core::config::{NetfrontConfig, RxSplitPolicy};
//!
//! let config = NetfrontConfig::from_env()
//!     .rx_target(64)
//!     .rx_split_policy(RxSplitPolicy::ByHalf);
//! ```

pub mod defaults;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;

use crate::env::{env_get, env_get_bool, env_get_opt};
use crate::error::{NetfrontError, Result};
use crate::wire::{MAX_LOOKAHEAD, RX_RING_SIZE};

/// What to do with a received TCP/IPv4 segment larger than its GSO size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxSplitPolicy {
    /// Split into segments of the backend-supplied GSO size.
    #[default]
    BySegment,
    /// Split into two halves (never below the GSO size).
    ByHalf,
    /// Deliver the large segment as one frame.
    None,
}

impl FromStr for RxSplitPolicy {
    type Err = NetfrontError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "segment" | "by-segment" | "mss" => Ok(RxSplitPolicy::BySegment),
            "half" | "by-half" => Ok(RxSplitPolicy::ByHalf),
            "none" | "off" => Ok(RxSplitPolicy::None),
            _ => Err(NetfrontError::InvalidConfig("unknown rx split policy")),
        }
    }
}

impl fmt::Display for RxSplitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RxSplitPolicy::BySegment => write!(f, "segment"),
            RxSplitPolicy::ByHalf => write!(f, "half"),
            RxSplitPolicy::None => write!(f, "none"),
        }
    }
}

bitflags! {
    /// Which received frames are passed up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFilter: u32 {
        const DIRECTED = 1 << 0;
        const MULTICAST = 1 << 1;
        const ALL_MULTICAST = 1 << 2;
        const BROADCAST = 1 << 3;
        const PROMISCUOUS = 1 << 4;
    }
}

impl Default for PacketFilter {
    fn default() -> Self {
        PacketFilter::DIRECTED | PacketFilter::MULTICAST | PacketFilter::BROADCAST
    }
}

/// Options the adapter shim may switch at runtime. The first three
/// reflect what was negotiated with the backend at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub checksum_offload: bool,
    pub gso_segment_size: u32,
    pub sg_enabled: bool,
    pub rx_split_policy: RxSplitPolicy,
    pub coalesce_small_frames: bool,
    pub verify_rx_checksums: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            checksum_offload: defaults::CHECKSUM_OFFLOAD,
            gso_segment_size: defaults::GSO_SEGMENT_SIZE,
            sg_enabled: defaults::SG_ENABLED,
            rx_split_policy: RxSplitPolicy::default(),
            coalesce_small_frames: defaults::COALESCE_SMALL_FRAMES,
            verify_rx_checksums: defaults::VERIFY_RX_CHECKSUMS,
        }
    }
}

impl Options {
    /// Defaults with environment overrides.
    ///
    /// - `XENNET_CSUM_OFFLOAD` (0/1)
    /// - `XENNET_GSO_SIZE` - max LSO payload, 0 disables
    /// - `XENNET_SG` (0/1)
    /// - `XENNET_RX_SPLIT` - segment | half | none
    /// - `XENNET_RX_COALESCE` (0/1)
    /// - `XENNET_RX_CSUM_VERIFY` (0/1)
    pub fn from_env() -> Self {
        Self {
            checksum_offload: env_get_bool("XENNET_CSUM_OFFLOAD", defaults::CHECKSUM_OFFLOAD),
            gso_segment_size: env_get("XENNET_GSO_SIZE", defaults::GSO_SEGMENT_SIZE),
            sg_enabled: env_get_bool("XENNET_SG", defaults::SG_ENABLED),
            rx_split_policy: env_get_opt("XENNET_RX_SPLIT").unwrap_or_default(),
            coalesce_small_frames: env_get_bool("XENNET_RX_COALESCE", defaults::COALESCE_SMALL_FRAMES),
            verify_rx_checksums: env_get_bool("XENNET_RX_CSUM_VERIFY", defaults::VERIFY_RX_CHECKSUMS),
        }
    }
}

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct NetfrontConfig {
    pub options: Options,
    /// RX buffers kept offered to the backend (<= ring size)
    pub rx_target: u32,
    /// Idle page buffers kept before freeing
    pub rx_freelist_max: usize,
    /// Frames per RX pass
    pub rx_packet_quota: u32,
    /// Bytes per RX pass
    pub rx_byte_quota: u64,
    /// RX header look-ahead past the Ethernet header
    pub lookahead: usize,
    /// Our MAC address (directed filter)
    pub mac_address: [u8; 6],
    pub packet_filter: PacketFilter,
    pub multicast_list: Vec<[u8; 6]>,
    /// Shutdown wait re-check interval
    pub shutdown_poll: Duration,
}

impl Default for NetfrontConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl NetfrontConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional), besides those of
    /// [`Options::from_env`]:
    /// - `XENNET_RX_TARGET`
    /// - `XENNET_RX_FREELIST_MAX`
    /// - `XENNET_RX_PACKET_QUOTA`
    /// - `XENNET_RX_BYTE_QUOTA`
    /// - `XENNET_LOOKAHEAD`
    /// - `XENNET_SHUTDOWN_POLL_MS`
    pub fn from_env() -> Self {
        Self {
            options: Options::from_env(),
            rx_target: env_get("XENNET_RX_TARGET", defaults::RX_TARGET),
            rx_freelist_max: env_get("XENNET_RX_FREELIST_MAX", defaults::RX_FREELIST_MAX),
            rx_packet_quota: env_get("XENNET_RX_PACKET_QUOTA", defaults::RX_PACKET_QUOTA),
            rx_byte_quota: env_get("XENNET_RX_BYTE_QUOTA", defaults::RX_BYTE_QUOTA),
            lookahead: env_get("XENNET_LOOKAHEAD", defaults::LOOKAHEAD),
            shutdown_poll: Duration::from_millis(env_get(
                "XENNET_SHUTDOWN_POLL_MS",
                defaults::SHUTDOWN_POLL_MS,
            )),
            ..Self::new()
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            rx_target: defaults::RX_TARGET,
            rx_freelist_max: defaults::RX_FREELIST_MAX,
            rx_packet_quota: defaults::RX_PACKET_QUOTA,
            rx_byte_quota: defaults::RX_BYTE_QUOTA,
            lookahead: defaults::LOOKAHEAD,
            mac_address: [0x00, 0x16, 0x3e, 0x00, 0x00, 0x01],
            packet_filter: PacketFilter::default(),
            multicast_list: Vec::new(),
            shutdown_poll: Duration::from_millis(defaults::SHUTDOWN_POLL_MS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rx_target == 0 || self.rx_target > RX_RING_SIZE {
            return Err(NetfrontError::InvalidConfig("rx_target must be in 1..=ring size"));
        }
        if self.lookahead > MAX_LOOKAHEAD {
            return Err(NetfrontError::InvalidConfig("lookahead above maximum"));
        }
        if self.rx_packet_quota == 0 || self.rx_byte_quota == 0 {
            return Err(NetfrontError::InvalidConfig("rx quotas must be non-zero"));
        }
        if self.shutdown_poll.is_zero() {
            return Err(NetfrontError::InvalidConfig("shutdown poll interval must be non-zero"));
        }
        Ok(())
    }

    // Builder methods

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn checksum_offload(mut self, enable: bool) -> Self {
        self.options.checksum_offload = enable;
        self
    }

    pub fn gso_segment_size(mut self, size: u32) -> Self {
        self.options.gso_segment_size = size;
        self
    }

    pub fn sg_enabled(mut self, enable: bool) -> Self {
        self.options.sg_enabled = enable;
        self
    }

    pub fn rx_split_policy(mut self, policy: RxSplitPolicy) -> Self {
        self.options.rx_split_policy = policy;
        self
    }

    pub fn coalesce_small_frames(mut self, enable: bool) -> Self {
        self.options.coalesce_small_frames = enable;
        self
    }

    pub fn verify_rx_checksums(mut self, enable: bool) -> Self {
        self.options.verify_rx_checksums = enable;
        self
    }

    pub fn rx_target(mut self, n: u32) -> Self {
        self.rx_target = n;
        self
    }

    pub fn rx_freelist_max(mut self, n: usize) -> Self {
        self.rx_freelist_max = n;
        self
    }

    pub fn rx_packet_quota(mut self, n: u32) -> Self {
        self.rx_packet_quota = n;
        self
    }

    pub fn rx_byte_quota(mut self, n: u64) -> Self {
        self.rx_byte_quota = n;
        self
    }

    pub fn lookahead(mut self, n: usize) -> Self {
        self.lookahead = n;
        self
    }

    pub fn mac_address(mut self, mac: [u8; 6]) -> Self {
        self.mac_address = mac;
        self
    }

    pub fn packet_filter(mut self, filter: PacketFilter) -> Self {
        self.packet_filter = filter;
        self
    }

    pub fn multicast_list(mut self, list: Vec<[u8; 6]>) -> Self {
        self.multicast_list = list;
        self
    }

    pub fn shutdown_poll(mut self, d: Duration) -> Self {
        self.shutdown_poll = d;
        self
    }
}
