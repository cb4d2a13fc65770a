//! Ordered header map and the host-rewrite stages applied on each side of
//! the tunnel.
//!
//! Headers travel as a JSON object whose key order is preserved. Repeated
//! keys are allowed so multi-valued headers (`set-cookie`) survive the trip.
//! Every rewrite stage takes a [`Headers`] value and returns a new one; no
//! stage mutates shared state.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Header keys (and exact values) that never reach the local service.
pub const HEADER_BLACKLIST: [&str; 6] = [
    "cors",
    "same-origin",
    "host",
    "sec-fetch-",
    "referer",
    "access-control",
];

/// An ordered list of `(name, value)` header pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Builder-style [`Headers::push`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every entry named `name` (case-insensitive).
    pub fn without(mut self, name: &str) -> Self {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A header value on the wire: a single string or a list of strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
    One(String),
    Many(Vec<String>),
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = Headers;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of header names to string values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
        let mut headers = Headers(Vec::with_capacity(access.size_hint().unwrap_or(0)));
        while let Some((name, value)) = access.next_entry::<String, WireValue>()? {
            match value {
                WireValue::One(v) => headers.push(name, v),
                WireValue::Many(vs) => {
                    for v in vs {
                        headers.push(name.clone(), v);
                    }
                }
            }
        }
        Ok(headers)
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(HeadersVisitor)
    }
}

// ── Rewrite stages ───────────────────────────────────────────────────

/// Replace every occurrence of `from` with `to` in header values and names.
///
/// A header whose name contains `from` is renamed in place, keeping its
/// position (e.g. `x-forwarded-gateway.example` → `x-forwarded-local.example`).
pub fn replace_host(headers: Headers, from: &str, to: &str) -> Headers {
    if from.is_empty() {
        return headers;
    }
    headers
        .into_iter()
        .map(|(k, v)| (k.replace(from, to), v.replace(from, to)))
        .collect()
}

/// Whether a header must be dropped before reaching the local service.
pub fn is_blacklisted(name: &str, value: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let value = value.trim().to_ascii_lowercase();
    HEADER_BLACKLIST
        .iter()
        .any(|entry| name == *entry || value == *entry)
        || name.contains("sec-fetch-")
        || name.starts_with("access-control")
}

/// Drop blacklisted headers.
pub fn strip_blacklisted(headers: Headers) -> Headers {
    headers
        .into_iter()
        .filter(|(k, v)| !is_blacklisted(k, v))
        .collect()
}

/// Replace any `host` header with a single `host: <host>`.
pub fn with_host(headers: Headers, host: &str) -> Headers {
    headers.without("host").with("host", host)
}

/// Agent-side request stages: public → local host, blacklist, inject local host.
pub fn rewrite_request(headers: Headers, public_host: &str, local_host: &str) -> Headers {
    let headers = replace_host(headers, public_host, local_host);
    let headers = strip_blacklisted(headers);
    with_host(headers, local_host)
}

/// Agent-side response stages: local → public host, inject public host.
pub fn rewrite_response(headers: Headers, local_host: &str, public_host: &str) -> Headers {
    let headers = replace_host(headers, local_host, public_host);
    with_host(headers, public_host)
}

/// Remove absolute `http(s)://<host>` prefixes from a request path.
///
/// Matching is ASCII case-insensitive.
pub fn strip_absolute_host(path: &str, host: &str) -> String {
    if host.is_empty() {
        return path.to_string();
    }
    let mut out = path.to_string();
    for scheme in ["https://", "http://"] {
        let needle = format!("{scheme}{host}").to_ascii_lowercase();
        loop {
            let lower = out.to_ascii_lowercase();
            match lower.find(&needle) {
                Some(at) => out.replace_range(at..at + needle.len(), ""),
                None => break,
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser_request() -> Headers {
        Headers::new()
            .with("host", "gateway.example")
            .with("user-agent", "curl/8.0")
            .with("referer", "https://gateway.example/index.html")
            .with("cors", "1")
            .with("sec-fetch-mode", "navigate")
            .with("access-control-request-method", "GET")
            .with("x-forwarded-gateway.example", "yes")
            .with("origin", "https://gateway.example")
    }

    #[test]
    fn request_rewrite_strips_and_injects() {
        let out = rewrite_request(browser_request(), "gateway.example", "local.example");

        assert_eq!(out.get("host"), Some("local.example"));
        assert_eq!(out.get("user-agent"), Some("curl/8.0"));
        assert_eq!(out.get("origin"), Some("https://local.example"));
        assert_eq!(out.get("x-forwarded-local.example"), Some("yes"));
        assert!(!out.contains("x-forwarded-gateway.example"));
        for banned in ["referer", "cors", "sec-fetch-mode", "access-control-request-method"] {
            assert!(!out.contains(banned), "{banned} should be stripped");
        }
        assert_eq!(out.iter().filter(|(k, _)| *k == "host").count(), 1);
    }

    #[test]
    fn blacklist_matches_values_too() {
        assert!(is_blacklisted("sec-fetch-site", "cross-site"));
        assert!(is_blacklisted("x-mode", "same-origin"));
        assert!(is_blacklisted("Access-Control-Allow-Origin", "*"));
        assert!(is_blacklisted("Host", "anything"));
        assert!(!is_blacklisted("accept", "text/html"));
        assert!(!is_blacklisted("x-referer-id", "42"));
    }

    #[test]
    fn host_references_round_trip() {
        let original = Headers::new()
            .with("location", "http://local.example/next")
            .with("x-served-by-local.example", "node-1")
            .with("content-type", "text/plain");

        let there = replace_host(original.clone(), "local.example", "gateway.example");
        assert_eq!(there.get("location"), Some("http://gateway.example/next"));
        assert!(there.contains("x-served-by-gateway.example"));

        let back = replace_host(there, "gateway.example", "local.example");
        assert_eq!(back, original);
    }

    #[test]
    fn response_rewrite_sets_public_host() {
        let out = rewrite_response(
            Headers::new()
                .with("Host", "local.example")
                .with("location", "http://local.example/login"),
            "local.example",
            "gateway.example",
        );
        assert_eq!(out.get("host"), Some("gateway.example"));
        assert_eq!(out.get("location"), Some("http://gateway.example/login"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn replace_with_empty_pattern_is_noop() {
        let h = Headers::new().with("a", "b");
        assert_eq!(replace_host(h.clone(), "", "x"), h);
    }

    #[test]
    fn strip_absolute_host_from_path() {
        assert_eq!(
            strip_absolute_host("/proxy/https://Gateway.Example/a?b=1", "gateway.example"),
            "/proxy//a?b=1"
        );
        assert_eq!(strip_absolute_host("http://gateway.example/x", "gateway.example"), "/x");
        assert_eq!(strip_absolute_host("/plain", "gateway.example"), "/plain");
    }

    #[test]
    fn serde_preserves_order_and_duplicates() {
        let h = Headers::new()
            .with("z-first", "1")
            .with("set-cookie", "a=1")
            .with("set-cookie", "b=2")
            .with("a-last", "3");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(
            json,
            r#"{"z-first":"1","set-cookie":"a=1","set-cookie":"b=2","a-last":"3"}"#
        );
        let back: Headers = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn deserialize_accepts_list_values() {
        let h: Headers =
            serde_json::from_str(r#"{"set-cookie":["a=1","b=2"],"x":"y"}"#).unwrap();
        let cookies: Vec<&str> = h
            .iter()
            .filter(|(k, _)| *k == "set-cookie")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(h.get("X"), Some("y"));
    }
}
