//! Control-channel authentication and end-user addressing.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Whether a WebSocket request path identifies the agent's control channel.
///
/// The agent dials `<gateway>/<secret>`; the percent-decoded path (query
/// included) must contain the secret. Anything else is an end-user session.
pub fn is_agent_path(raw_path: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    match urlencoding::decode(raw_path) {
        Ok(decoded) => decoded.contains(secret),
        Err(_) => raw_path.contains(secret),
    }
}

/// Best-effort end-user address: first `X-Forwarded-For` entry, else the peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').map(str::trim).find(|s| !s.is_empty()));

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_in_path_authenticates() {
        assert!(is_agent_path("/hunter2", "hunter2"));
        assert!(is_agent_path("/tunnel/hunter2?v=1", "hunter2"));
        assert!(!is_agent_path("/echo", "hunter2"));
    }

    #[test]
    fn secret_is_percent_decoded() {
        assert!(is_agent_path("/p%40ss%20word", "p@ss word"));
        assert!(!is_agent_path("/p%40ss", "p@ss word"));
    }

    #[test]
    fn empty_secret_never_authenticates() {
        assert!(!is_agent_path("/anything", ""));
    }

    #[test]
    fn forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" , 203.0.113.7, 10.0.0.1"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_peer() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }
}
