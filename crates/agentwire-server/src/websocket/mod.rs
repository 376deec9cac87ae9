//! WebSocket connection handling: connection state, the registry, the
//! per-frame protocol handler, session tasks, and the heartbeat sweep.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;
