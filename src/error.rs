//! The stack-wide error taxonomy.

use thiserror::Error;

/// Errors surfaced by the stack's public operations.
///
/// Decode failures and transient tun I/O errors inside the worker loops are
/// logged and dropped there; only startup failures and queue teardown reach
/// callers.
#[derive(Debug, Error)]
pub enum StackError {
    /// The tun device could not be opened or configured.
    #[error("failed to open tun device")]
    DeviceOpen(#[from] tun::Error),

    /// A device-side queue was closed and drained; the stack is shutting
    /// down.
    #[error("device closed")]
    DeviceClosed,

    /// The accept queue was closed and drained; no further connections will
    /// arrive.
    #[error("accept queue closed")]
    AcceptClosed,

    /// A datagram carried a malformed IPv4 or TCP header.
    #[error("bad header: {0}")]
    BadHeader(String),
}
