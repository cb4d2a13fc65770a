//! Reconnect-aware outbound WebSocket with a FIFO send queue.
//!
//! Sends made while the connection is down are queued and drained, in
//! order and one at a time, as soon as [`TransportSocket::connect`]
//! succeeds. The reading half is handed back to the caller on connect.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use portico_core::{PorticoError, PorticoResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Reading half returned by a successful connect.
pub type WsReader = SplitStream<WsStream>;

/// Upper bound on the close handshake during dispose.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How [`TransportSocket::send`] behaves while the connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Queue the message until the next connect.
    Enqueue,
    /// Fail with [`PorticoError::NotAvailable`].
    FailFast,
}

#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Resolves when the queued message is finally written.
    Queued(oneshot::Receiver<PorticoResult<()>>),
}

struct QueuedSend {
    enqueued_at: Instant,
    message: Message,
    done: oneshot::Sender<PorticoResult<()>>,
}

#[derive(Default)]
struct SocketState {
    sink: Option<WsSink>,
    queue: VecDeque<QueuedSend>,
    connecting: bool,
    /// Bumped by dispose so an in-flight connect can tell it was cancelled.
    epoch: u64,
}

impl SocketState {
    /// Write queued messages in order. Stops at the first failure, leaving
    /// the rest queued and the connection marked down.
    async fn drain(&mut self) -> usize {
        let Some(sink) = self.sink.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        let mut failed = false;
        while let Some(entry) = self.queue.front() {
            match sink.send(entry.message.clone()).await {
                Ok(()) => {
                    if let Some(entry) = self.queue.pop_front() {
                        debug!(
                            waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                            "queued message sent"
                        );
                        let _ = entry.done.send(Ok(()));
                    }
                    sent += 1;
                }
                Err(e) => {
                    warn!(error = %e, remaining = self.queue.len(), "draining send queue failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.sink = None;
        }
        sent
    }
}

/// One outbound WebSocket connection to a fixed URL.
pub struct TransportSocket {
    url: String,
    state: Mutex<SocketState>,
    available: AtomicBool,
}

impl TransportSocket {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(SocketState::default()),
            available: AtomicBool::new(false),
        }
    }

    /// Open the connection and drain the queue.
    ///
    /// Returns the reading half on a fresh connection, or `None` when the
    /// socket is already connected or connecting.
    pub async fn connect(&self) -> PorticoResult<Option<WsReader>> {
        let epoch = {
            let mut state = self.state.lock().await;
            if state.sink.is_some() || state.connecting {
                return Ok(None);
            }
            state.connecting = true;
            state.epoch
        };

        let result = connect_async(self.url.as_str()).await;

        let mut state = self.state.lock().await;
        state.connecting = false;
        let (ws, _response) =
            result.map_err(|e| PorticoError::Transport(format!("connect failed: {e}")))?;

        if state.epoch != epoch {
            drop(state);
            let mut ws = ws;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
            return Err(PorticoError::NotAvailable);
        }

        let (sink, reader) = ws.split();
        state.sink = Some(sink);
        let drained = state.drain().await;
        if drained > 0 {
            debug!(drained, "send queue drained on connect");
        }
        self.available.store(state.sink.is_some(), Ordering::SeqCst);
        Ok(Some(reader))
    }

    /// Send `message`, or queue it while the connection is down.
    pub async fn send(&self, message: Message, mode: SendMode) -> PorticoResult<SendOutcome> {
        let mut state = self.state.lock().await;
        if let Some(sink) = state.sink.as_mut() {
            return match sink.send(message).await {
                Ok(()) => Ok(SendOutcome::Sent),
                Err(e) => {
                    state.sink = None;
                    self.available.store(false, Ordering::SeqCst);
                    Err(PorticoError::Transport(format!("send failed: {e}")))
                }
            };
        }

        if mode == SendMode::FailFast {
            return Err(PorticoError::NotAvailable);
        }

        let (done, rx) = oneshot::channel();
        state.queue.push_back(QueuedSend {
            enqueued_at: Instant::now(),
            message,
            done,
        });
        debug!(queued = state.queue.len(), "connection unavailable, message queued");
        Ok(SendOutcome::Queued(rx))
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Messages waiting for the next connect.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Close the connection if open. Queued messages are kept. Safe to call
    /// repeatedly.
    pub async fn dispose(&self) {
        let sink = {
            let mut state = self.state.lock().await;
            state.epoch += 1;
            self.available.store(false, Ordering::SeqCst);
            state.sink.take()
        };
        if let Some(mut sink) = sink {
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                debug!("close handshake timed out");
            }
        }
    }
}

/// Read the next data frame, skipping control frames.
pub async fn next_data(reader: &mut WsReader) -> Option<PorticoResult<Message>> {
    loop {
        match reader.next().await? {
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(msg) => return Some(Ok(msg)),
            Err(e) => return Some(Err(PorticoError::Transport(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    /// Loopback peer that reports every text frame it receives.
    async fn peer() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(t) = msg {
                            let _ = tx.send(t);
                        }
                    }
                });
            }
        });
        (url, rx)
    }

    #[tokio::test]
    async fn queues_until_connected_then_drains_in_order() {
        let (url, mut rx) = peer().await;
        let socket = TransportSocket::new(url);
        assert!(!socket.is_available());

        let mut pending = Vec::new();
        for text in ["one", "two", "three"] {
            match socket.send(Message::Text(text.into()), SendMode::Enqueue).await.unwrap() {
                SendOutcome::Queued(done) => pending.push(done),
                SendOutcome::Sent => panic!("not connected yet"),
            }
        }
        assert_eq!(socket.queued().await, 3);

        assert!(socket.connect().await.unwrap().is_some());
        assert!(socket.is_available());
        for done in pending {
            assert!(matches!(done.await, Ok(Ok(()))));
        }
        for expected in ["one", "two", "three"] {
            assert_eq!(rx.recv().await.unwrap(), expected);
        }

        let sent = socket.send(Message::Text("four".into()), SendMode::Enqueue).await.unwrap();
        assert!(matches!(sent, SendOutcome::Sent));
        assert_eq!(rx.recv().await.unwrap(), "four");
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (url, _rx) = peer().await;
        let socket = TransportSocket::new(url);
        assert!(socket.connect().await.unwrap().is_some());
        assert!(socket.connect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_fast_does_not_queue() {
        let socket = TransportSocket::new("ws://127.0.0.1:9/");
        let result = socket.send(Message::Text("ping".into()), SendMode::FailFast).await;
        assert!(matches!(result, Err(PorticoError::NotAvailable)));
        assert_eq!(socket.queued().await, 0);
    }

    #[tokio::test]
    async fn connect_failure_keeps_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let socket = TransportSocket::new(format!("ws://{addr}/"));
        let _ = socket.send(Message::Text("kept".into()), SendMode::Enqueue).await.unwrap();
        assert!(socket.connect().await.is_err());
        assert!(!socket.is_available());
        assert_eq!(socket.queued().await, 1);
    }

    #[tokio::test]
    async fn dispose_is_repeatable_and_allows_reconnect() {
        let (url, mut rx) = peer().await;
        let socket = TransportSocket::new(url);
        socket.dispose().await;
        assert!(socket.connect().await.unwrap().is_some());
        socket.dispose().await;
        socket.dispose().await;
        assert!(!socket.is_available());

        let _ = socket.send(Message::Text("after".into()), SendMode::Enqueue).await.unwrap();
        assert!(socket.connect().await.unwrap().is_some());
        assert_eq!(rx.recv().await.unwrap(), "after");
    }
}
