//! Correlation and session identifiers.

use rand::Rng;

/// Generate a random identifier (hex-encoded, 16 bytes = 32 hex chars).
///
/// Used for HTTP correlation ids, WebSocket event ids and bridge session ids.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// Shorten an id for log output.
pub fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(i, _)| &id[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_hex_and_sized() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "01234567");
    }

    #[test]
    fn short_id_counts_chars_not_bytes() {
        assert_eq!(short_id("aéééé"), "aéééé");
        assert_eq!(short_id("ééééééééé"), "éééééééé");
        assert_eq!(short_id("日本語のリクエストです"), "日本語のリクエス");
    }
}
