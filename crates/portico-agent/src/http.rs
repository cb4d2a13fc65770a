//! Replays forwarded HTTP requests against the local service.

use crate::config::AgentConfig;
use crate::control::Outbox;
use portico_core::headers::{rewrite_request, rewrite_response, strip_absolute_host};
use portico_core::{short_id, Headers, HttpRequest, HttpResponse, PorticoError, PorticoResult, TunnelMessage};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info, warn};

/// Message-framing headers; the outbound client sets its own.
const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

pub struct HttpReplay {
    client: reqwest::Client,
    local_base: String,
    local_host: String,
    public_host: String,
    outbox: Outbox,
}

impl HttpReplay {
    pub fn new(config: &AgentConfig, outbox: Outbox) -> PorticoResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| PorticoError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            local_base: config.local_http_base(),
            local_host: config.local_host.clone(),
            public_host: config.remote_host.clone(),
            outbox,
        })
    }

    /// Replay `request` and post the response back under `id`.
    ///
    /// Any HTTP status from the local service is a success. When the service
    /// cannot be reached at all, nothing is sent back.
    pub async fn handle(&self, id: String, request: HttpRequest) {
        let method = request.method.clone();
        let path = request.path.clone();
        match self.replay(request).await {
            Ok(response) => {
                info!(id = %short_id(&id), method = %method, path = %path, code = response.code, "replayed request");
                self.outbox.send(TunnelMessage::http_response(id, response));
            }
            Err(e) => {
                warn!(id = %short_id(&id), method = %method, path = %path, error = %e, "local service unreachable, dropping request");
            }
        }
    }

    pub async fn replay(&self, request: HttpRequest) -> PorticoResult<HttpResponse> {
        let headers = rewrite_request(request.headers, &self.public_host, &self.local_host);
        let url = self.url_for(&request.path);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| PorticoError::InvalidMessage(format!("bad method: {e}")))?;

        debug!(url = %url, headers = headers.len(), "issuing local request");
        let response = self
            .client
            .request(method, &url)
            .headers(to_header_map(&headers))
            .body(request.body)
            .send()
            .await
            .map_err(|e| PorticoError::Upstream(e.to_string()))?;

        let code = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| PorticoError::Upstream(e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            code,
            headers: rewrite_response(headers, &self.local_host, &self.public_host),
            body,
        })
    }

    /// `scheme://local_host/<path>` with public-host absolute URLs removed.
    fn url_for(&self, path: &str) -> String {
        let path = strip_absolute_host(path, &self.public_host);
        format!("{}/{}", self.local_base, path.strip_prefix('/').unwrap_or(path.as_str()))
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if FRAMING_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!(header = %name, "skipping invalid request header"),
        }
    }
    map
}
