//! # xennet-engine: the paravirtualized network front-end
//!
//! Moves Ethernet frames between a host network stack (reached through
//! an [`AdapterShim`](xennet_core::shim::AdapterShim)) and a backend
//! driver domain, over two shared rings plus granted data pages.
//!
//! ## Layout
//!
//! | Module     | Role                                                   |
//! |------------|--------------------------------------------------------|
//! | `ring`     | front half of a shared ring, notify decisions          |
//! | `pool`     | buffer descriptors, freelists, grant lifetime          |
//! | `packet`   | Ethernet/IPv4/TCP header inspection                    |
//! | `checksum` | RFC 1071 helpers                                       |
//! | `rx`       | RX refill, response drain, frame assembly, GSO split   |
//! | `tx`       | TX slot staging, coalescing, offload, completions      |
//! | `netfront` | lifecycle, locking and shim callbacks                  |
//! | `stats`    | interface counters                                     |

pub mod ring;
pub mod pool;
pub mod packet;
pub mod checksum;
pub mod rx;
pub mod tx;
pub mod netfront;
pub mod stats;

pub use netfront::Netfront;
pub use rx::Drain;
pub use stats::{Stats, StatsSnapshot};
pub use tx::{Submit, MAX_FRAME_LEN};
pub use xennet_core::error::Busy;
