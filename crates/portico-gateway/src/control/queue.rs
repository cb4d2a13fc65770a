//! Pending-delivery queue for tunnel messages routed while no agent is attached.

use portico_core::{PorticoError, PorticoResult};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// How long an undelivered message may wait for an agent.
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(60);

/// A message waiting for an agent connection.
pub struct QueuedMessage {
    pub enqueued_at: Instant,
    /// Correlation id of the message (for logging).
    pub id: String,
    /// Encoded control frame.
    pub frame: String,
    done: oneshot::Sender<PorticoResult<()>>,
}

impl QueuedMessage {
    /// Signal the router that this entry is finished.
    pub fn resolve(self, result: PorticoResult<()>) {
        let _ = self.done.send(result);
    }
}

/// FIFO of queued messages. Each entry leaves the queue exactly once, either
/// delivered or expired.
#[derive(Default)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame; the returned receiver resolves when it is delivered or expires.
    pub fn push(
        &mut self,
        id: String,
        frame: String,
        now: Instant,
    ) -> oneshot::Receiver<PorticoResult<()>> {
        let (done, rx) = oneshot::channel();
        self.entries.push_back(QueuedMessage {
            enqueued_at: now,
            id,
            frame,
            done,
        });
        rx
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Put back an entry whose delivery failed, keeping its place in line.
    pub fn push_front(&mut self, entry: QueuedMessage) {
        self.entries.push_front(entry);
    }

    /// Reject every entry that has waited at least `timeout`. Returns the count.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if now.saturating_duration_since(entry.enqueued_at) >= timeout {
                expired.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;

        let count = expired.len();
        for entry in expired {
            entry.resolve(Err(PorticoError::Expired));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
