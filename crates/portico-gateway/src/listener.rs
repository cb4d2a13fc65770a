//! End-user HTTP requests: correlation, forwarding, and postback delivery.

use crate::control::{ControlChannel, Delivery};
use crate::sleep::IdleMonitor;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use portico_core::{generate_id, short_id, Headers, HttpRequest, HttpResponse, TunnelMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Response headers that describe the agent-side connection, not the payload.
const HOP_BY_HOP: [&str; 3] = ["connection", "transfer-encoding", "keep-alive"];

/// A request waiting for its postback.
struct PendingRequest {
    created_at: Instant,
    sink: oneshot::Sender<HttpResponse>,
}

/// Pending HTTP requests keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park a response sink under `id`. The entry is removed when the guard drops.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
    ) -> (PendingGuard, oneshot::Receiver<HttpResponse>) {
        let (sink, rx) = oneshot::channel();
        self.lock().insert(
            id.to_string(),
            PendingRequest {
                created_at: Instant::now(),
                sink,
            },
        );
        let guard = PendingGuard {
            id: id.to_string(),
            pending: Arc::clone(self),
        };
        (guard, rx)
    }

    /// Complete the request `id`. Unknown or already-completed ids are ignored.
    pub fn on_postback(&self, id: &str, response: HttpResponse) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            debug!(id = %short_id(id), "postback for unknown request, ignoring");
            return false;
        };
        debug!(
            id = %short_id(id),
            code = response.code,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "postback received"
        );
        entry.sink.send(response).is_ok()
    }

    /// Drop every parked sink; their handlers answer 502.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes a pending entry when the request handler goes away.
pub struct PendingGuard {
    id: String,
    pending: Arc<PendingRequests>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Accepts end-user HTTP requests and forwards them to the agent.
pub struct HttpListener {
    control: Arc<ControlChannel>,
    pending: Arc<PendingRequests>,
    idle: Arc<IdleMonitor>,
    max_body_bytes: usize,
}

impl HttpListener {
    pub fn new(
        control: Arc<ControlChannel>,
        pending: Arc<PendingRequests>,
        idle: Arc<IdleMonitor>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            control,
            pending,
            idle,
            max_body_bytes,
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Forward one request and wait for the agent's postback.
    pub async fn forward(&self, request: Request<Body>, client_ip: &str) -> Response<Body> {
        self.idle.touch();
        let id = generate_id();

        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(b) => b,
            Err(e) => {
                warn!(id = %short_id(&id), error = %e, "rejecting request body");
                return plain(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
            }
        };

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let headers: Headers = parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();

        info!(id = %short_id(&id), method = %parts.method, path = %path, ip = %client_ip, "forwarding request");

        let message = TunnelMessage::http_request(
            id.clone(),
            HttpRequest {
                method: parts.method.as_str().to_string(),
                path,
                headers,
                body: body.to_vec(),
            },
        );

        let (_guard, postback) = self.pending.register(&id);
        match self.control.route_to_agent(&message).await {
            Ok(Delivery::Sent) => {}
            Ok(Delivery::Queued(done)) => {
                let short = short_id(&id).to_string();
                tokio::spawn(async move {
                    if let Ok(Err(e)) = done.await {
                        warn!(id = %short, error = %e, "request was never delivered to an agent");
                    }
                });
            }
            Err(e) => {
                warn!(id = %short_id(&id), error = %e, "failed to route request");
                return plain(StatusCode::BAD_GATEWAY, "bad gateway");
            }
        }

        match postback.await {
            Ok(response) => build_response(response),
            Err(_) => plain(StatusCode::BAD_GATEWAY, "bad gateway"),
        }
    }
}

/// Turn an agent postback into the end-user response.
pub fn build_response(data: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(data.code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(data.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (key, value) in data.headers {
        if HOP_BY_HOP.iter().any(|h| key.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %key, "skipping invalid response header"),
        }
    }
    response
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AgentHandle, QUEUE_TIMEOUT};
    use portico_core::{codec, Body as MsgBody};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn ok(body: &str) -> HttpResponse {
        HttpResponse {
            code: 200,
            headers: Headers::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn postback_completes_pending_request() {
        let pending = Arc::new(PendingRequests::new());
        let (_guard, rx) = pending.register("abc");
        assert_eq!(pending.len(), 1);

        assert!(pending.on_postback("abc", ok("hi")));
        assert_eq!(rx.await.unwrap().body, b"hi");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_or_duplicate_postback_is_noop() {
        let pending = Arc::new(PendingRequests::new());
        let (_guard, _rx) = pending.register("abc");

        assert!(!pending.on_postback("nope", ok("x")));
        assert_eq!(pending.len(), 1);
        assert!(pending.on_postback("abc", ok("x")));
        assert!(!pending.on_postback("abc", ok("x")));
    }

    #[test]
    fn dropping_guard_removes_entry() {
        let pending = Arc::new(PendingRequests::new());
        let (guard, _rx) = pending.register("gone");
        drop(guard);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn clear_fails_waiters() {
        let pending = Arc::new(PendingRequests::new());
        let (_guard, rx) = pending.register("abc");
        pending.clear();
        assert!(rx.await.is_err());
    }

    #[test]
    fn response_skips_hop_by_hop_and_invalid_headers() {
        let response = build_response(HttpResponse {
            code: 404,
            headers: Headers::new()
                .with("content-type", "text/plain")
                .with("Transfer-Encoding", "chunked")
                .with("connection", "close")
                .with("bad header", "x")
                .with("set-cookie", "a=1")
                .with("set-cookie", "b=2"),
            body: b"missing".to_vec(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert!(!response.headers().contains_key("transfer-encoding"));
        assert!(!response.headers().contains_key("connection"));
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn invalid_status_becomes_bad_gateway() {
        let response = build_response(HttpResponse {
            code: 42,
            headers: Headers::new(),
            body: Vec::new(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn forward_round_trip() {
        let control = Arc::new(ControlChannel::new(QUEUE_TIMEOUT));
        let (tx, mut rx) = mpsc::unbounded_channel();
        control.attach(AgentHandle::new("agent".into(), tx)).await;
        let listener = Arc::new(HttpListener::new(
            control,
            Arc::new(PendingRequests::new()),
            Arc::new(IdleMonitor::new(Duration::ZERO)),
            1024,
        ));

        let agent_side = {
            let pending = Arc::clone(listener.pending());
            tokio::spawn(async move {
                let frame = rx.recv().await.unwrap();
                let msg = codec::decode(&frame).unwrap();
                let MsgBody::HttpRequest(req) = msg.body else {
                    panic!("expected http request");
                };
                assert_eq!(req.method, "POST");
                assert_eq!(req.path, "/submit?x=1");
                assert_eq!(req.headers.get("x-test"), Some("yes"));
                assert_eq!(req.body, b"payload");
                pending.on_postback(
                    &msg.id,
                    HttpResponse {
                        code: 201,
                        headers: Headers::new().with("x-reply", "1"),
                        body: b"created".to_vec(),
                    },
                );
            })
        };

        let request = Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .header("x-test", "yes")
            .body(Body::from("payload"))
            .unwrap();
        let response = listener.forward(request, "127.0.0.1").await;
        agent_side.await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-reply"], "1");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"created");
        assert!(listener.pending().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let listener = HttpListener::new(
            Arc::new(ControlChannel::new(QUEUE_TIMEOUT)),
            Arc::new(PendingRequests::new()),
            Arc::new(IdleMonitor::new(Duration::ZERO)),
            4,
        );
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("far too long"))
            .unwrap();
        let response = listener.forward(request, "127.0.0.1").await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
