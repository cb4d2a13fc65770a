//! End-user WebSocket sessions bridged through the agent.
//!
//! Each end-user socket becomes a session with a fresh id. Its lifecycle and
//! frames are routed to the agent as `ws` messages. Commands coming back
//! from the agent are applied to every registered session: only one
//! end-user session is meaningfully supported at a time.

use crate::control::ControlChannel;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use portico_core::close_code::{sanitize, truncate_reason};
use portico_core::{generate_id, short_id, Body, TunnelMessage, WsClose, WsFrame, WsOpen};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Close code sent to end-users when the gateway stops.
const GOING_AWAY: u16 = 1001;

struct BridgeSession {
    id: String,
    ip: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// Registry of live end-user WebSocket sessions.
pub struct BridgeRegistry {
    control: Arc<ControlChannel>,
    sessions: Mutex<Vec<BridgeSession>>,
}

impl BridgeRegistry {
    pub fn new(control: Arc<ControlChannel>) -> Self {
        Self {
            control,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Serve one end-user socket until it closes.
    pub async fn on_connection(self: Arc<Self>, socket: WebSocket, ip: String, path: String) {
        let session = generate_id();
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        self.register(session.clone(), ip.clone(), tx).await;
        info!(session = %short_id(&session), ip = %ip, path = %path, "bridge session opened");

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "end-user send failed");
                    return;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.route(Body::WsOpen(WsOpen {
            session: session.clone(),
            path,
        }))
        .await;

        let mut close = WsClose {
            session: Some(session.clone()),
            ..Default::default()
        };
        while let Some(frame) = stream.next().await {
            let (data, text) = match frame {
                Ok(Message::Text(t)) => (t.into_bytes(), true),
                Ok(Message::Binary(b)) => (b, false),
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        close.code = Some(frame.code);
                        close.reason = Some(frame.reason.into_owned());
                    }
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(session = %short_id(&session), error = %e, "end-user socket error");
                    break;
                }
            };
            self.route(Body::WsMessage(WsFrame {
                session: session.clone(),
                data,
                text,
            }))
            .await;
        }

        self.route(Body::WsClose(close)).await;
        self.deregister(&session).await;
        info!(session = %short_id(&session), "bridge session closed");
    }

    async fn register(&self, id: String, ip: String, tx: mpsc::UnboundedSender<Message>) {
        self.sessions.lock().await.push(BridgeSession { id, ip, tx });
    }

    /// Remove exactly the session `id`.
    async fn deregister(&self, id: &str) {
        self.sessions.lock().await.retain(|s| s.id != id);
    }

    async fn route(&self, body: Body) {
        let message = TunnelMessage::ws(body);
        if let Err(e) = self.control.route_to_agent(&message).await {
            warn!(error = %e, event = message.event(), "failed to route bridge event");
        }
    }

    /// Apply an agent-originated `ws` command to the end-user sessions.
    pub async fn on_message_from_local(&self, body: Body) {
        match body {
            Body::WsOpen(open) => {
                debug!(session = %short_id(&open.session), "local bridge connected");
            }
            Body::WsClose(close) => {
                let frame = sanitize(close.code).map(|code| CloseFrame {
                    code,
                    reason: Cow::Owned(
                        truncate_reason(close.reason.as_deref().unwrap_or_default()).to_string(),
                    ),
                });
                debug!(code = ?close.code, forwarded = frame.is_some(), "local bridge closed");
                self.broadcast(Message::Close(frame)).await;
            }
            Body::WsMessage(frame) => {
                let msg = if frame.text {
                    match String::from_utf8(frame.data) {
                        Ok(text) => Message::Text(text),
                        Err(e) => Message::Binary(e.into_bytes()),
                    }
                } else {
                    Message::Binary(frame.data)
                };
                self.broadcast(msg).await;
            }
            Body::HttpRequest(_) | Body::HttpResponse(_) => {
                debug!("ignoring non-ws message on bridge path");
            }
        }
    }

    async fn broadcast(&self, msg: Message) {
        for session in self.sessions.lock().await.iter() {
            if session.tx.send(msg.clone()).is_err() {
                debug!(session = %short_id(&session.id), ip = %session.ip, "session writer gone");
            }
        }
    }

    /// Close every end-user socket and forget all sessions.
    pub async fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        for session in sessions {
            let _ = session.tx.send(Message::Close(Some(CloseFrame {
                code: GOING_AWAY,
                reason: Cow::Borrowed("gateway shutting down"),
            })));
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
