//! xennet error types.

use thiserror::Error;

use crate::state::DeviceState;
use crate::wire::Direction;

/// Peer misbehaviour. Any of these poisons the rings: the engine moves
/// to `Faulted` and only a full reconnect recovers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("{ring} ring: peer published {published} responses with only {outstanding} requests outstanding")]
    ResponseOverrun { ring: Direction, published: u32, outstanding: u32 },

    #[error("{ring} ring: response id {id} is not outstanding")]
    UnknownId { ring: Direction, id: u16 },

    #[error("rx response id {id} arrived in ring slot {slot}")]
    MisplacedResponse { id: u16, slot: u16 },

    #[error("rx response id {id}: offset {offset} + length {len} exceeds the page")]
    MalformedLength { id: u16, offset: u16, len: i16 },
}

#[derive(Debug, Error)]
pub enum NetfrontError {
    /// Ring is full, cannot offer another request.
    #[error("ring full")]
    RingFull,

    #[error("grant table exhausted")]
    GrantsExhausted,

    /// The peer still maps the page; revoking now would be unsafe.
    #[error("grant {0} is still mapped by the peer")]
    GrantInUse(u32),

    #[error("invalid grant reference {0}")]
    InvalidGrant(u32),

    #[error("out of buffer memory")]
    OutOfMemory,

    #[error("engine not active (state {0})")]
    NotActive(DeviceState),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A buffer descriptor was released more times than it was retained.
    #[error("buffer {0} released more times than retained")]
    OverRelease(u32),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// OS error with errno.
    #[error("OS error: errno {0}")]
    Os(i32),
}

pub type Result<T> = std::result::Result<T, NetfrontError>;

/// Returned by `send` when the frame was accepted but is waiting behind
/// ring, grant or buffer backpressure. It will be retried on the next
/// completion pass; the caller must not resubmit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame queued behind backpressure")]
pub struct Busy;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let v = ProtocolViolation::UnknownId { ring: Direction::Tx, id: 9 };
        assert_eq!(v.to_string(), "tx ring: response id 9 is not outstanding");

        let e: NetfrontError = v.into();
        assert_eq!(e.to_string(), "protocol violation: tx ring: response id 9 is not outstanding");

        let e = NetfrontError::NotActive(DeviceState::Disconnecting);
        assert_eq!(e.to_string(), "engine not active (state disconnecting)");
    }
}
