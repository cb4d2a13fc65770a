//! Local half of a bridged WebSocket session.
//!
//! The agent keeps at most one local socket: a new `open` tears down the
//! previous one first. Local events are reported back to the gateway as
//! `ws` messages through the outbox.

use crate::config::{AgentConfig, FaultScope};
use crate::control::{Outbox, RestartHandle};
use crate::socket::{next_data, SendMode, TransportSocket};
use portico_core::{short_id, Body, PorticoError, TunnelMessage, WsClose, WsFrame, WsOpen};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Close code reported when a session is torn down by a local fault.
const INTERNAL_ERROR: u16 = 1011;

struct LocalSession {
    session: String,
    socket: Arc<TransportSocket>,
    reader: JoinHandle<()>,
}

pub struct WsBridge {
    local_base: String,
    outbox: Outbox,
    restart: RestartHandle,
    fault_scope: FaultScope,
    current: Mutex<Option<LocalSession>>,
}

impl WsBridge {
    pub fn new(config: &AgentConfig, outbox: Outbox, restart: RestartHandle) -> Self {
        Self {
            local_base: config.local_ws_base(),
            outbox,
            restart,
            fault_scope: config.fault_scope,
            current: Mutex::new(None),
        }
    }

    /// Apply a `ws` command from the gateway.
    pub async fn handle(self: &Arc<Self>, body: Body) {
        match body {
            Body::WsOpen(open) => self.open(open).await,
            Body::WsClose(close) => self.close(close).await,
            Body::WsMessage(frame) => self.forward(frame).await,
            Body::HttpRequest(_) | Body::HttpResponse(_) => {
                debug!("ignoring http message on bridge path");
            }
        }
    }

    /// `ws(s)://local_host/<path>` for an end-user path.
    pub fn local_url(&self, path: &str) -> String {
        format!("{}/{}", self.local_base, path.strip_prefix('/').unwrap_or(path))
    }

    async fn open(self: &Arc<Self>, open: WsOpen) {
        self.close_current().await;

        let url = self.local_url(&open.path);
        info!(session = %short_id(&open.session), url = %url, "opening local socket");
        let socket = Arc::new(TransportSocket::new(url));

        let mut current = self.current.lock().await;
        let reader = tokio::spawn(Arc::clone(self).serve_local(
            open.session.clone(),
            open.path,
            Arc::clone(&socket),
        ));
        *current = Some(LocalSession {
            session: open.session,
            socket,
            reader,
        });
    }

    async fn close(&self, close: WsClose) {
        let matches = match (&close.session, self.current.lock().await.as_ref()) {
            (_, None) => return,
            (Some(wanted), Some(local)) => *wanted == local.session,
            (None, Some(_)) => true,
        };
        if matches {
            debug!(code = ?close.code, "gateway closed the bridge session");
            self.close_current().await;
        } else {
            debug!("close for a session that is no longer current, ignoring");
        }
    }

    async fn forward(&self, frame: WsFrame) {
        let socket = match self.current.lock().await.as_ref() {
            Some(local) if frame.session.is_empty() || frame.session == local.session => {
                Arc::clone(&local.socket)
            }
            Some(_) => {
                debug!(session = %short_id(&frame.session), "frame for a stale session, dropping");
                return;
            }
            None => {
                debug!("no local socket, dropping frame");
                return;
            }
        };

        let message = if frame.text {
            match String::from_utf8(frame.data) {
                Ok(text) => Message::Text(text),
                Err(e) => Message::Binary(e.into_bytes()),
            }
        } else {
            Message::Binary(frame.data)
        };
        if let Err(e) = socket.send(message, SendMode::Enqueue).await {
            warn!(error = %e, "failed to write to local socket");
        }
    }

    /// Tear down the current local socket without reporting a close.
    pub async fn close_current(&self) {
        let Some(local) = self.current.lock().await.take() else {
            return;
        };
        debug!(session = %short_id(&local.session), "closing local socket");
        local.reader.abort();
        local.socket.dispose().await;
    }

    /// Restart the whole tunnel.
    pub fn restart_tunnel(&self) {
        self.restart.request();
    }

    /// Connect the local socket and relay its events until it closes.
    async fn serve_local(self: Arc<Self>, session: String, path: String, socket: Arc<TransportSocket>) {
        let mut reader = match socket.connect().await {
            Ok(Some(reader)) => reader,
            Ok(None) => return,
            Err(e) => {
                self.on_fault(&session, e).await;
                return;
            }
        };

        self.outbox.send(TunnelMessage::ws(Body::WsOpen(WsOpen {
            session: session.clone(),
            path,
        })));

        let mut close = WsClose {
            session: Some(session.clone()),
            ..Default::default()
        };
        while let Some(frame) = next_data(&mut reader).await {
            let (data, text) = match frame {
                Ok(Message::Text(t)) => (t.into_bytes(), true),
                Ok(Message::Binary(b)) => (b, false),
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        close.code = Some(u16::from(frame.code));
                        close.reason = Some(frame.reason.into_owned());
                    }
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    self.on_fault(&session, e).await;
                    return;
                }
            };
            self.outbox.send(TunnelMessage::ws(Body::WsMessage(WsFrame {
                session: session.clone(),
                data,
                text,
            })));
        }

        info!(session = %short_id(&session), code = ?close.code, "local socket closed");
        self.outbox.send(TunnelMessage::ws(Body::WsClose(close)));
        self.forget(&session).await;
    }

    /// Drop `session` if it is still current. The reader is not aborted.
    async fn forget(&self, session: &str) -> bool {
        let local = {
            let mut current = self.current.lock().await;
            match current.as_ref() {
                Some(local) if local.session == session => current.take(),
                _ => None,
            }
        };
        match local {
            Some(local) => {
                local.socket.dispose().await;
                true
            }
            None => false,
        }
    }

    async fn on_fault(&self, session: &str, error: PorticoError) {
        warn!(session = %short_id(session), error = %error, scope = ?self.fault_scope, "local bridge fault");
        if !self.forget(session).await {
            return;
        }
        match self.fault_scope {
            FaultScope::Tunnel => self.restart.request(),
            FaultScope::Session => {
                self.outbox.send(TunnelMessage::ws(Body::WsClose(WsClose {
                    session: Some(session.to_string()),
                    code: Some(INTERNAL_ERROR),
                    reason: Some("local bridge error".into()),
                })));
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.current.lock().await.is_some()
    }
}
