//! Server shutdown in two phases.
//!
//! First every live connection is told to close (`close_all` queues the
//! fatal shutdown notice, then the close frame) and the registry is polled
//! until it drains. Then the root token is cancelled, which stops the
//! listener and heartbeat, and their tasks are joined.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::connection::CloseReason;
use crate::websocket::registry::ConnectionRegistry;

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// What a shutdown managed to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections sent the shutdown notice.
    pub notified: usize,
    /// Connections still registered when the drain deadline passed.
    pub lingering: usize,
    /// Whether background tasks finished before the deadline.
    pub tasks_joined: bool,
}

/// Owns the root cancellation token and the server's background tasks.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Fresh coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Child of the root token. Cancelled when shutdown reaches phase two.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Join `handle` during phase two.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Whether phase two has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every connection in `registry`, wait for them to deregister,
    /// then stop the tracked tasks. Both phases share `timeout`.
    pub async fn shutdown(
        &self,
        registry: &Arc<ConnectionRegistry>,
        timeout: Duration,
    ) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let notified = registry.close_all(&CloseReason::ServerShutdown);
        info!(notified, timeout_ms = timeout.as_millis() as u64, "shutdown started");

        while !registry.is_empty() && Instant::now() < deadline {
            time::sleep(DRAIN_POLL).await;
        }
        let lingering = registry.len();
        if lingering > 0 {
            warn!(lingering, "connections did not drain before the deadline");
        }

        self.token.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        let task_count = handles.len();
        let tasks_joined = time::timeout_at(deadline, futures::future::join_all(handles))
            .await
            .is_ok();
        if !tasks_joined {
            warn!(task_count, "background tasks still running after shutdown deadline");
        }

        ShutdownReport {
            notified,
            lingering,
            tasks_joined,
        }
    }
}
