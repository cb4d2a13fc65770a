//! Gateway side of the control channel.
//!
//! Holds at most one attached agent. A replaced agent is not fenced: its
//! connection stays open until it closes on its own. Messages routed while
//! no agent is usable wait in a [`MessageQueue`] and are flushed, in order, when an
//! agent attaches. A background sweeper expires entries that wait too long.

pub mod queue;

use portico_core::{codec, short_id, PorticoResult, TunnelMessage};
use queue::MessageQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use queue::QUEUE_TIMEOUT;

/// Outbound half of an attached agent connection.
///
/// Frames pushed here are written to the agent socket, in order, by the
/// connection's writer task. Once that task stops, sends fail.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl AgentHandle {
    pub fn new(id: String, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { id, tx }
    }

    /// Hand a frame to the writer. On failure the frame is returned.
    fn send(&self, frame: String) -> Result<(), String> {
        self.tx.send(frame).map_err(|e| e.0)
    }

    fn is_usable(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Result of [`ControlChannel::route_to_agent`].
#[derive(Debug)]
pub enum Delivery {
    /// Handed to the attached agent.
    Sent,
    /// No usable agent; the receiver resolves on delivery or expiry.
    Queued(oneshot::Receiver<PorticoResult<()>>),
}

struct ControlState {
    agent: Option<AgentHandle>,
    /// Replaced agents whose sockets are still open. Never routed to.
    retired: Vec<AgentHandle>,
    queue: MessageQueue,
}

impl ControlState {
    /// Deliver queued entries in order until the queue is empty or a send fails.
    fn flush(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(agent) = self.agent.as_ref() {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            match agent.send(entry.frame.clone()) {
                Ok(()) => {
                    debug!(id = %short_id(&entry.id), "flushed queued message");
                    entry.resolve(Ok(()));
                    delivered += 1;
                }
                Err(_) => {
                    warn!(agent = %short_id(&agent.id), "agent send failed while flushing queue");
                    self.queue.push_front(entry);
                    self.agent = None;
                }
            }
        }
        delivered
    }
}

/// The single agent connection plus its pending-delivery queue.
pub struct ControlChannel {
    state: Mutex<ControlState>,
    queue_timeout: Duration,
}

impl ControlChannel {
    pub fn new(queue_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ControlState {
                agent: None,
                retired: Vec::new(),
                queue: MessageQueue::new(),
            }),
            queue_timeout,
        }
    }

    /// Send `message` to the agent, or queue it if no agent is usable.
    ///
    /// Earlier queued messages are always flushed first, so a message never
    /// overtakes one routed before it.
    pub async fn route_to_agent(&self, message: &TunnelMessage) -> PorticoResult<Delivery> {
        let mut frame = codec::encode(message)?;
        let mut state = self.state.lock().await;
        state.flush();

        if state.queue.is_empty() {
            if let Some(agent) = state.agent.as_ref() {
                match agent.send(frame) {
                    Ok(()) => return Ok(Delivery::Sent),
                    Err(returned) => {
                        warn!(agent = %short_id(&agent.id), "agent connection unusable, queueing");
                        frame = returned;
                        state.agent = None;
                    }
                }
            }
        }

        let rx = state
            .queue
            .push(message.id.clone(), frame, Instant::now());
        debug!(id = %short_id(&message.id), queued = state.queue.len(), "no agent attached, message queued");
        Ok(Delivery::Queued(rx))
    }

    /// Make `agent` the active connection and flush the queue to it.
    ///
    /// A previously attached agent stops receiving messages but keeps its
    /// connection until that closes. Returns the number of queued messages
    /// delivered.
    pub async fn attach(&self, agent: AgentHandle) -> usize {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.agent.replace(agent) {
            info!(agent = %short_id(&previous.id), "replacing attached agent");
            state.retired.push(previous);
        }
        state.flush()
    }

    /// Forget the agent `id`. Returns `true` only if it was the active one.
    pub async fn detach(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.retired.retain(|agent| agent.id != id);
        match &state.agent {
            Some(agent) if agent.id == id => {
                state.agent = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the attached agent and any replaced ones; their writers close
    /// the sockets.
    pub async fn close_agent(&self) {
        let mut state = self.state.lock().await;
        state.retired.clear();
        if let Some(agent) = state.agent.take() {
            info!(agent = %short_id(&agent.id), "closing agent connection");
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.state
            .lock()
            .await
            .agent
            .as_ref()
            .is_some_and(AgentHandle::is_usable)
    }

    /// Number of messages waiting for an agent.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Expire queue entries older than the queue timeout.
    pub async fn sweep(&self) -> usize {
        let expired = self
            .state
            .lock()
            .await
            .queue
            .expire(Instant::now(), self.queue_timeout);
        if expired > 0 {
            warn!(expired, "dropped undelivered messages");
        }
        expired
    }

    /// Run [`ControlChannel::sweep`] every queue-timeout period.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(control.queue_timeout);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                control.sweep().await;
            }
        })
    }
}
