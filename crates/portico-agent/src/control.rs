//! Agent side of the control channel.
//!
//! State machine: `Disconnected → Connecting → Connected → Disconnected`,
//! then a fixed delay before the next attempt. Inbound tunnel messages are
//! dispatched to [`HttpReplay`] or [`WsBridge`]; everything they produce
//! goes through the [`Outbox`], which a single pump task writes to the
//! transport socket in call order.

use crate::bridge::WsBridge;
use crate::config::AgentConfig;
use crate::http::HttpReplay;
use crate::socket::{next_data, SendMode, SendOutcome, TransportSocket, WsReader};
use portico_core::{codec, short_id, Body, PorticoResult, TunnelMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Queue of tunnel messages bound for the gateway.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<TunnelMessage>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TunnelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: TunnelMessage) {
        if self.tx.send(message).is_err() {
            debug!("outbox closed, dropping message");
        }
    }
}

/// Asks the control channel to drop its connection and reconnect.
#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl RestartHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self) {
        let _ = self.tx.send(());
    }
}

struct Receivers {
    outbox: mpsc::UnboundedReceiver<TunnelMessage>,
    restart: mpsc::UnboundedReceiver<()>,
}

pub struct ControlChannel {
    remote_host: String,
    socket: Arc<TransportSocket>,
    http: Arc<HttpReplay>,
    bridge: Arc<WsBridge>,
    outbox: Outbox,
    state: watch::Sender<ChannelState>,
    receivers: Mutex<Option<Receivers>>,
    reconnect_delay: Duration,
}

impl ControlChannel {
    pub fn new(config: &AgentConfig) -> PorticoResult<Arc<Self>> {
        let (outbox, outbox_rx) = Outbox::channel();
        let (restart, restart_rx) = RestartHandle::channel();

        let http = Arc::new(HttpReplay::new(config, outbox.clone())?);
        let bridge = Arc::new(WsBridge::new(config, outbox.clone(), restart));
        let (state, _) = watch::channel(ChannelState::Disconnected);

        Ok(Arc::new(Self {
            remote_host: config.remote_host.clone(),
            socket: Arc::new(TransportSocket::new(config.control_url())),
            http,
            bridge,
            outbox,
            state,
            receivers: Mutex::new(Some(Receivers {
                outbox: outbox_rx,
                restart: restart_rx,
            })),
            reconnect_delay: config.reconnect_delay,
        }))
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn bridge(&self) -> &Arc<WsBridge> {
        &self.bridge
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    /// Connect, serve, and reconnect forever. Only the first call runs.
    pub async fn run(self: Arc<Self>) {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Receivers {
            outbox,
            mut restart,
        }) = receivers
        else {
            warn!("control channel already running");
            return;
        };

        self.spawn_pump(outbox);

        loop {
            while restart.try_recv().is_ok() {}

            self.set_state(ChannelState::Connecting);
            debug!(host = %self.remote_host, "connecting to gateway");
            match self.socket.connect().await {
                Ok(Some(reader)) => {
                    self.set_state(ChannelState::Connected);
                    info!(host = %self.remote_host, "connection established with gateway");
                    self.read_loop(reader, &mut restart).await;
                    info!(host = %self.remote_host, "connection lost with gateway");
                }
                Ok(None) => debug!("control socket already connected"),
                Err(e) => warn!(host = %self.remote_host, error = %e, "failed to connect to gateway"),
            }

            self.socket.dispose().await;
            self.set_state(ChannelState::Disconnected);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Drop the control connection and any local bridge.
    pub async fn shutdown(&self) {
        self.bridge.close_current().await;
        self.socket.dispose().await;
        self.set_state(ChannelState::Disconnected);
    }

    fn spawn_pump(&self, mut outbox: mpsc::UnboundedReceiver<TunnelMessage>) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                let frame = match codec::encode(&message) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "failed to encode message");
                        continue;
                    }
                };
                match socket.send(Message::Text(frame), SendMode::Enqueue).await {
                    Ok(SendOutcome::Sent) => {}
                    Ok(SendOutcome::Queued(_)) => {
                        debug!(id = %short_id(&message.id), "gateway unavailable, message queued");
                    }
                    Err(e) => {
                        warn!(id = %short_id(&message.id), error = %e, "failed to send message to gateway");
                    }
                }
            }
        });
    }

    async fn read_loop(&self, mut reader: WsReader, restart: &mut mpsc::UnboundedReceiver<()>) {
        loop {
            tokio::select! {
                frame = next_data(&mut reader) => {
                    let decoded = match frame {
                        Some(Ok(Message::Text(text))) => codec::decode(&text),
                        Some(Ok(Message::Binary(data))) => codec::decode_bytes(&data),
                        Some(Ok(Message::Close(frame))) => {
                            debug!(frame = ?frame, "gateway closed the control channel");
                            return;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "control channel error");
                            return;
                        }
                        None => return,
                    };
                    match decoded {
                        Ok(message) => self.dispatch(message).await,
                        Err(e) => debug!(error = %e, "dropping invalid message"),
                    }
                }
                Some(()) = restart.recv() => {
                    warn!("local bridge fault, restarting tunnel");
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, message: TunnelMessage) {
        match message.body {
            Body::HttpRequest(request) => {
                debug!(id = %short_id(&message.id), method = %request.method, path = %request.path, "incoming http request");
                let http = Arc::clone(&self.http);
                tokio::spawn(async move { http.handle(message.id, request).await });
            }
            body @ (Body::WsOpen(_) | Body::WsClose(_) | Body::WsMessage(_)) => {
                self.bridge.handle(body).await;
            }
            Body::HttpResponse(_) => {
                debug!(id = %short_id(&message.id), "ignoring response sent by gateway");
            }
        }
    }
}
