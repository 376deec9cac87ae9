//! # agentwire-client
//!
//! Reconnecting client for the agentwire protocol.
//!
//! - [`ClientDriver`] owns the socket, performs the `hello` handshake, and
//!   reconnects with exponential backoff while keeping the session ID.
//! - [`ClientHandle`] queues outbound messages (bounded, FIFO) and exposes the
//!   [`ConnectionState`].
//! - [`ClientEvent`]s deliver complete responses; streamed replies are
//!   reassembled before they are emitted.

#![deny(unsafe_code)]

pub mod driver;
pub mod error;
pub mod queue;
pub mod state;
pub mod transport;

pub use driver::{ClientDriver, ClientEvent, ClientHandle, DriverConfig};
pub use error::{ClientError, TransportError};
pub use state::{ConnectionState, FailureReason};
pub use transport::{Connector, FrameTransport, TungsteniteConnector};
