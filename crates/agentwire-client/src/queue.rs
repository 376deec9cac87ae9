//! Bounded FIFO of messages waiting for a connected transport.

use std::collections::VecDeque;

use agentwire_core::Message;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ClientError;

/// Outbound queue shared by the handle (producer) and the driver (consumer).
///
/// The driver peeks the front, sends it, and only then pops, so a message
/// interrupted by a disconnect is retried first after reconnecting.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    /// Queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append `message`, or reject it when the queue is full.
    pub fn push(&self, message: Message) -> Result<(), ClientError> {
        {
            let mut inner = self.inner.lock();
            if inner.len() >= self.capacity {
                return Err(ClientError::QueueFull {
                    capacity: self.capacity,
                });
            }
            inner.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Clone of the oldest message.
    pub fn front(&self) -> Option<Message> {
        self.inner.lock().front().cloned()
    }

    /// Remove the oldest message.
    pub fn pop_front(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    /// Wait until at least one message is queued.
    pub async fn ready(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
