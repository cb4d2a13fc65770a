//! End-to-end: end user → gateway → agent → local service, all on loopback.

use axum::extract::ws::{Message as LocalMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use portico_agent::config::{ConfigFile, Overrides};
use portico_agent::{AgentConfig, ChannelState, ControlChannel};
use portico_gateway::{Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "e2e-tunnel-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Seen = Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>;

struct Tunnel {
    gateway_addr: SocketAddr,
    local_addr: SocketAddr,
    gateway: Arc<Gateway>,
    agent: Arc<ControlChannel>,
    seen: Seen,
    _stop: oneshot::Sender<()>,
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            LocalMessage::Text(_) | LocalMessage::Binary(_) => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            LocalMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn local_service() -> (SocketAddr, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let app = Router::new()
        .route("/ws/echo", get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo) }))
        .fallback(move |request: Request| {
            let record = Arc::clone(&record);
            async move {
                let host = request.headers()["host"].to_str().unwrap().to_string();
                record.lock().unwrap().push((
                    request.uri().to_string(),
                    request
                        .headers()
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_str().unwrap().to_string()))
                        .collect(),
                ));
                let response: Response = match request.uri().path() {
                    "/old" => (
                        StatusCode::FOUND,
                        [("location", format!("http://{host}/new"))],
                        "",
                    )
                        .into_response(),
                    _ => (StatusCode::OK, format!("served {}", request.uri())).into_response(),
                };
                response
            }
        });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, seen)
}

async fn tunnel() -> Tunnel {
    let (local_addr, seen) = local_service().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(GatewayConfig {
        port: gateway_addr.port(),
        bind: "127.0.0.1".into(),
        secret: SECRET.into(),
        debug: true,
        auto_sleep_minutes: 0,
        max_body_bytes: 1 << 20,
    });
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(Arc::clone(&gateway).serve_until(listener, async move {
        let _ = stopped.await;
    }));

    let mut config = AgentConfig::merge(
        ConfigFile::default(),
        Overrides {
            remote_host: Some(gateway_addr.to_string()),
            local_host: Some(local_addr.to_string()),
            secret: Some(SECRET.into()),
            ..Default::default()
        },
    )
    .unwrap();
    config.reconnect_delay = Duration::from_millis(300);
    let agent = ControlChannel::new(&config).unwrap();
    tokio::spawn(Arc::clone(&agent).run());

    let tunnel = Tunnel {
        gateway_addr,
        local_addr,
        gateway,
        agent,
        seen,
        _stop: stop,
    };
    wait_attached(&tunnel).await;
    tunnel
}

async fn wait_attached(tunnel: &Tunnel) {
    while !tunnel.gateway.control().is_attached().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_data(ws: &mut Client) -> Message {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn http_request_reaches_local_service_with_rewritten_headers() {
    let t = tunnel().await;
    let gateway = t.gateway_addr.to_string();
    let local = t.local_addr.to_string();

    let response = reqwest::Client::new()
        .get(format!("http://{gateway}/foo?bar=1"))
        .header("referer", format!("http://{gateway}/"))
        .header("cors", "1")
        .header("x-trace", "abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "served /foo?bar=1");

    let (uri, headers) = t.seen.lock().unwrap()[0].clone();
    assert_eq!(uri, "/foo?bar=1");
    let header = |name: &str| headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
    assert_eq!(header("host"), Some(local));
    assert_eq!(header("x-trace"), Some("abc".into()));
    assert_eq!(header("referer"), None);
    assert_eq!(header("cors"), None);
}

#[tokio::test]
async fn redirect_location_points_at_gateway() {
    let t = tunnel().await;
    let gateway = t.gateway_addr.to_string();

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{gateway}/old"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(
        response.headers()["location"].to_str().unwrap(),
        format!("http://{gateway}/new")
    );
}

#[tokio::test]
async fn websocket_frames_echo_unchanged() {
    let t = tunnel().await;
    let (mut user, _) = connect_async(format!("ws://{}/ws/echo", t.gateway_addr))
        .await
        .unwrap();

    user.send(Message::Text("héllo".into())).await.unwrap();
    assert_eq!(next_data(&mut user).await, Message::Text("héllo".into()));

    let bytes = vec![0u8, 1, 2, 253, 254, 255];
    user.send(Message::Binary(bytes.clone())).await.unwrap();
    assert_eq!(next_data(&mut user).await, Message::Binary(bytes));
}

#[tokio::test]
async fn frames_sent_while_agent_is_away_arrive_in_order() {
    let t = tunnel().await;
    let mut state = t.agent.state();

    t.gateway.control().close_agent().await;
    let (mut user, _) = connect_async(format!("ws://{}/ws/echo", t.gateway_addr))
        .await
        .unwrap();
    for n in ["1", "2", "3"] {
        user.send(Message::Text(n.into())).await.unwrap();
    }

    wait_attached(&t).await;
    while *state.borrow_and_update() != ChannelState::Connected {
        state.changed().await.unwrap();
    }
    for n in ["1", "2", "3"] {
        assert_eq!(next_data(&mut user).await, Message::Text(n.into()));
    }
}
