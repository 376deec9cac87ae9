//! Client-side error types.

use agentwire_core::CodecError;

/// Errors returned to the application by the client handle.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The outbound queue is at capacity; the message was not accepted.
    #[error("outbound queue full ({capacity} messages)")]
    QueueFull {
        /// Configured queue bound.
        capacity: usize,
    },

    /// The driver has stopped (closed or failed).
    #[error("client driver is not running")]
    Stopped,

    /// No bearer token configured.
    #[error("no token configured for the client")]
    MissingToken,

    /// Message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors raised by a [`FrameTransport`](crate::transport::FrameTransport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not open the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),
}
