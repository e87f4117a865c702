//! # xennet-module: Default (in-process) implementations
//!
//! This crate provides the default implementation for every capability
//! the engine consumes, plus a backend peer to drive it against.
//! Each impl prioritizes correctness and simplicity over performance.
//!
//! ## Default stack
//!
//! | Trait / role | Default Impl       | Alternative                 |
//! |--------------|--------------------|-----------------------------|
//! | GrantTable   | LocalGrantTable    | hypervisor grant table      |
//! | Notifier     | EventFdNotifier    | ParkNotifier (portable)     |
//! | backend peer | LoopbackBackend    | netback in a driver domain  |

pub mod local_grants;
pub mod park_notifier;
pub mod loopback;

use std::time::Duration;

use xennet_core::error::Result;

/// Consumer side of a notifier: block until the peer kicked us.
pub trait EventWait {
    /// Wait up to `timeout` for a notification and consume it.
    /// Returns `false` on timeout.
    fn wait(&self, timeout: Duration) -> Result<bool>;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod eventfd_notifier;
        pub use eventfd_notifier::EventFdNotifier as DefaultNotifier;
    } else {
        pub use park_notifier::ParkNotifier as DefaultNotifier;
    }
}

pub use local_grants::LocalGrantTable;
pub use loopback::LoopbackBackend;
pub use park_notifier::ParkNotifier;
