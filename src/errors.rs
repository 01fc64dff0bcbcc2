//! Library-wide error type.

use thiserror::Error;

/// Errors surfaced by configuration handling, the signal codec and the
/// SocketCAN transports.
///
/// All fallible operations in this crate return `Result<_, CanError>`; no
/// panics cross the library boundary. [`CanError::Timeout`] is a distinct
/// variant so callers can discriminate a quiet bus from a broken one without
/// string matching.
#[derive(Debug, Error)]
pub enum CanError {
    /// Invalid configuration: duplicate signal name, signal overrunning the
    /// frame payload, bad scaling factor, out-of-range frame id and the like.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed KCD input, or a construct outside the supported subset that
    /// cannot be safely ignored (e.g. multiplexed signals).
    #[error("KCD error: {0}")]
    Kcd(String),

    /// A signal definition whose bit geometry cannot be applied to an 8-byte
    /// payload. Validated definitions never produce this.
    #[error("codec error: {0}")]
    Codec(String),

    /// Socket-level failure; the underlying `io::Error` carries the OS errno.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// No frame arrived within the caller-supplied deadline.
    #[error("timed out waiting for CAN data")]
    Timeout,

    /// A send referenced a signal name absent from the configuration (or not
    /// part of any outbound frame).
    #[error("unknown signal name: {0}")]
    UnknownSignal(String),

    /// The kernel rejected a BCM operation for a frame it is not tracking
    /// (EINVAL on TX_DELETE / RX_DELETE).
    #[error("frame id {0:#x} is not registered with the kernel broadcast manager")]
    NotFoundByKernel(u32),
}

impl CanError {
    /// True when this error is a receive timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CanError::Timeout)
    }
}
