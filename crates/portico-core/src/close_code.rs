//! WebSocket close-code validation.
//!
//! Only codes an application may legitimately send are forwarded to an
//! end-user socket. Reserved codes (1004, 1005, 1006, 1015) and anything
//! outside the standard/registered/private ranges are dropped.

/// Whether `code` may be passed to a WebSocket `close()` call.
pub fn is_forwardable(code: u16) -> bool {
    ((1000..=1014).contains(&code) && !matches!(code, 1004 | 1005 | 1006))
        || (3000..=4999).contains(&code)
}

/// Keep `code` only if it is forwardable.
pub fn sanitize(code: Option<u16>) -> Option<u16> {
    code.filter(|c| is_forwardable(*c))
}

/// Longest close reason that fits in a control frame.
pub const MAX_REASON_BYTES: usize = 123;

/// Trim `reason` to [`MAX_REASON_BYTES`] on a character boundary.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
