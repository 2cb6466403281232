use std::time::Duration;

use crate::error::Result;

/// A physical channel carrying raw frames to and from controllers.
///
/// Implementations must be usable from the receive thread and from caller
/// threads at the same time: `send` can race `recv_timeout`.
pub trait Channel: Send + Sync {
    /// Transmit one frame.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for one incoming frame.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a frame, which
    /// the receive loop uses as its deadline-sweep cadence.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Release channel resources. Called once during shutdown.
    fn close(&self) {}
}

pub(crate) mod udp;

pub use udp::UdpChannel;
