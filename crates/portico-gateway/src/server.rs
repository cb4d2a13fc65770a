//! Gateway server: one port for end-user HTTP, end-user WebSockets, and
//! the agent's control channel.

use crate::auth::{client_ip, is_agent_path};
use crate::bridge::BridgeRegistry;
use crate::config::GatewayConfig;
use crate::control::{AgentHandle, ControlChannel, QUEUE_TIMEOUT};
use crate::listener::{HttpListener, PendingRequests};
use crate::sleep::IdleMonitor;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use portico_core::{codec, generate_id, short_id, Body, TunnelMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The gateway and its collaborators, wired together at construction.
pub struct Gateway {
    config: GatewayConfig,
    control: Arc<ControlChannel>,
    http: HttpListener,
    bridges: Arc<BridgeRegistry>,
    idle: Arc<IdleMonitor>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Self::with_queue_timeout(config, QUEUE_TIMEOUT)
    }

    pub fn with_queue_timeout(config: GatewayConfig, queue_timeout: Duration) -> Arc<Self> {
        let control = Arc::new(ControlChannel::new(queue_timeout));
        let idle = Arc::new(IdleMonitor::new(config.auto_sleep()));
        let http = HttpListener::new(
            Arc::clone(&control),
            Arc::new(PendingRequests::new()),
            Arc::clone(&idle),
            config.max_body_bytes,
        );
        let bridges = Arc::new(BridgeRegistry::new(Arc::clone(&control)));
        Arc::new(Self {
            config,
            control,
            http,
            bridges,
            idle,
        })
    }

    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    pub fn bridges(&self) -> &Arc<BridgeRegistry> {
        &self.bridges
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        self.http.pending()
    }

    pub fn idle_monitor(&self) -> &Arc<IdleMonitor> {
        &self.idle
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().fallback(entry).with_state(Arc::clone(self))
    }

    /// Serve until the auto-sleep threshold is reached or `signal` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let idle = Arc::clone(&self.idle);
        self.serve_until(listener, async move {
            tokio::select! {
                _ = idle.wait_until_idle() => info!("auto-sleep triggered"),
                _ = signal => info!("received shutdown signal"),
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then close every session and stop.
    pub async fn serve_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = self.control.spawn_sweeper();
        info!(addr = %listener.local_addr()?, "gateway listening");

        let gateway = Arc::clone(&self);
        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            gateway.shutdown_sessions().await;
        })
        .await;

        sweeper.abort();
        info!("gateway stopped");
        result
    }

    /// Close bridge sessions and the agent connection, and fail parked requests.
    pub async fn shutdown_sessions(&self) {
        let bridges = self.bridges.len().await;
        info!(bridges, pending = self.pending().len(), "shutting down sessions");
        self.bridges.close_all().await;
        self.control.close_agent().await;
        self.pending().clear();
    }

    /// Serve the agent's control socket until it closes.
    async fn on_agent_socket(self: Arc<Self>, socket: WebSocket, ip: String) {
        let agent_id = generate_id();
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(error = %e, "agent send failed");
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        let flushed = self
            .control
            .attach(AgentHandle::new(agent_id.clone(), tx))
            .await;
        info!(agent = %short_id(&agent_id), ip = %ip, flushed, "agent attached");

        while let Some(frame) = stream.next().await {
            let decoded = match frame {
                Ok(Message::Text(text)) => codec::decode(&text),
                Ok(Message::Binary(data)) => codec::decode_bytes(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(agent = %short_id(&agent_id), error = %e, "agent socket error");
                    break;
                }
            };
            match decoded {
                Ok(message) => self.on_agent_message(message).await,
                Err(e) => debug!(error = %e, "dropping invalid agent message"),
            }
        }

        if self.control.detach(&agent_id).await {
            info!(agent = %short_id(&agent_id), "agent detached");
        }
    }

    async fn on_agent_message(&self, message: TunnelMessage) {
        match message.body {
            Body::HttpResponse(response) => {
                self.http.pending().on_postback(&message.id, response);
            }
            body @ (Body::WsOpen(_) | Body::WsClose(_) | Body::WsMessage(_)) => {
                self.bridges.on_message_from_local(body).await;
            }
            Body::HttpRequest(_) => {
                debug!(id = %short_id(&message.id), "ignoring request sent by agent");
            }
        }
    }
}

/// Single entry point: WebSocket upgrades go to the control channel or a
/// bridge session, everything else is forwarded as HTTP.
async fn entry(
    State(gateway): State<Arc<Gateway>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    let ip = client_ip(request.headers(), peer.map(|ConnectInfo(addr)| addr));

    let Some(upgrade) = upgrade else {
        return gateway.http.forward(request, &ip).await;
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if is_agent_path(&path, &gateway.config.secret) {
        info!(ip = %ip, "agent connecting");
        return upgrade
            .on_upgrade(move |socket| gateway.on_agent_socket(socket, ip))
            .into_response();
    }

    gateway.idle.touch();
    let bridges = Arc::clone(&gateway.bridges);
    upgrade
        .on_upgrade(move |socket| bridges.on_connection(socket, ip, path))
        .into_response()
}
