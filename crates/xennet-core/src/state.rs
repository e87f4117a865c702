//! Device and link state.

use std::fmt;

/// Engine lifecycle.
///
/// ```text
/// Inactive ──connect──▶ Initialising ──▶ Active ──shutdown──▶ Disconnecting ──▶ Disconnected
///                                          │
///                                          └──protocol violation──▶ Faulted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    Inactive = 0,
    Initialising = 1,
    Active = 2,
    Disconnecting = 3,
    Disconnected = 4,
    Faulted = 5,
}

impl DeviceState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceState::Initialising,
            2 => DeviceState::Active,
            3 => DeviceState::Disconnecting,
            4 => DeviceState::Disconnected,
            5 => DeviceState::Faulted,
            _ => DeviceState::Inactive,
        }
    }

    /// New page buffers may only be allocated while connecting or running.
    pub fn accepts_allocation(self) -> bool {
        matches!(self, DeviceState::Initialising | DeviceState::Active)
    }

    pub fn is_active(self) -> bool {
        self == DeviceState::Active
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Inactive => "inactive",
            DeviceState::Initialising => "initialising",
            DeviceState::Active => "active",
            DeviceState::Disconnecting => "disconnecting",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_roundtrip() {
        for s in [
            DeviceState::Inactive,
            DeviceState::Initialising,
            DeviceState::Active,
            DeviceState::Disconnecting,
            DeviceState::Disconnected,
            DeviceState::Faulted,
        ] {
            assert_eq!(DeviceState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn test_allocation_window() {
        assert!(DeviceState::Initialising.accepts_allocation());
        assert!(DeviceState::Active.accepts_allocation());
        assert!(!DeviceState::Disconnecting.accepts_allocation());
        assert!(!DeviceState::Faulted.accepts_allocation());
    }
}
