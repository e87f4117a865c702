//! Adapter shim boundary (outbound from the engine).
//!
//! The shim is the host network stack's side of the driver. The engine
//! calls it without holding any of its own locks, so the shim may call
//! straight back into the engine (`send`, `return_rx_buffer`).

use crate::frame::{RxFrame, SendStatus, TxFrame};
use crate::state::LinkState;

pub trait AdapterShim: Send + Sync {
    /// A frame was assembled. The shim owns it until it passes it back
    /// through `return_rx_buffer`, which may happen arbitrarily later.
    fn on_frame_received(&self, frame: RxFrame);

    /// Exactly once per frame accepted by `send`, after every ring slot
    /// of the frame has a response (or the frame was failed outright).
    fn on_frame_sent(&self, frame: TxFrame, status: SendStatus);

    fn on_link_state_changed(&self, state: LinkState);
}
