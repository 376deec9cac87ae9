//! Sliding-window duplicate detection for envelope IDs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::ids::MessageId;

/// Remembers recently seen message IDs for one connection.
///
/// Bounded both by age (`window`) and by count (`capacity`); whichever limit
/// is hit first evicts the oldest entry. An ID seen again after eviction is
/// treated as new, which is acceptable because the freshness check rejects
/// frames older than the replay window anyway.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    capacity: usize,
    seen: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
}

impl DedupWindow {
    /// Create a window keeping IDs for `window`, at most `capacity` of them.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id` at `now`. Returns `true` the first time an ID is seen,
    /// `false` for a repeat still inside the window.
    pub fn observe(&mut self, id: &MessageId, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains_key(id.as_str()) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                let _ = self.seen.remove(&old);
            }
        }
        let _ = self.seen.insert(id.clone(), now);
        self.order.push_back((id.clone(), now));
        true
    }

    /// Number of IDs currently remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                let _ = self.seen.remove(&old);
            }
        }
    }
}
