//! # xennet-core: Trait definitions and wire types for xennet
//!
//! This crate defines the boundaries of the paravirtualized network
//! front-end: the bit-exact ring slot layouts shared with the backend,
//! the capabilities the engine consumes (grant table, event channel),
//! and the adapter shim it reports to.
//!
//! ## Design principle
//!
//! The engine (`xennet-engine`) depends only on the traits here. Default
//! implementations live in `xennet-module`; a hypervisor-backed grant
//! table or event channel is one more impl, not an engine change.

pub mod wire;
pub mod sring;
pub mod page;
pub mod grant;
pub mod notifier;
pub mod frame;
pub mod shim;
pub mod state;
pub mod config;
pub mod env;
pub mod logger;
pub mod error;
