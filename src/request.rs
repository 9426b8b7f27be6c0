//! Raw request construction.
//!
//! Scenarios send hand-crafted byte sequences, not a client library:
//! the point is exact control over what hits the wire, including requests
//! that are deliberately incomplete. The cookie helpers exist purely to
//! replay a server-issued cookie on a follow-up request.

/// A complete HTTP/1.1 GET request.
pub fn get(path: &str, host: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n").into_bytes()
}

/// A complete HTTP/1.1 GET request with extra headers.
pub fn get_with_headers(path: &str, host: &str, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// A complete HTTP/1.0 GET request.
pub fn get_http10(path: &str, host: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.0\r\nHost: {host}\r\n\r\n").into_bytes()
}

/// A complete HTTP/1.0 GET request with extra headers.
pub fn get_http10_with_headers(path: &str, host: &str, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut req = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// An HTTP/1.0 request with an arbitrary method and no Host header.
/// HTTP/1.0 does not require Host, so a conforming server must accept
/// (or reject on the method, not the missing header).
pub fn method_http10(method: &str, path: &str) -> Vec<u8> {
    format!("{method} {path} HTTP/1.0\r\n\r\n").into_bytes()
}

/// Request line and headers with the final CRLF withheld, so the server
/// sits waiting for the rest of the header block.
pub fn partial_get(path: &str, host: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n").into_bytes()
}

/// POST prelude declaring `content_length`; the body is streamed by the
/// caller afterwards.
pub fn post_prelude(path: &str, host: &str, content_length: usize) -> Vec<u8> {
    format!("POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Length: {content_length}\r\n\r\n")
        .into_bytes()
}

/// Pick the `Set-Cookie` header for `name` out of the response's values.
/// The same cookie can appear on several lines; one carrying `Max-Age`
/// wins, otherwise the first match.
pub fn pick_set_cookie<'a>(values: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("{name}=");
    let matches: Vec<&str> = values
        .iter()
        .map(String::as_str)
        .filter(|v| v.starts_with(&prefix))
        .collect();
    matches
        .iter()
        .find(|v| v.contains("Max-Age="))
        .or_else(|| matches.first())
        .copied()
}

/// Extract the bare cookie value from a `Set-Cookie` header value
/// (`NAME=value; attributes...`).
pub fn cookie_value<'a>(set_cookie: &'a str, name: &str) -> Option<&'a str> {
    let rest = set_cookie.strip_prefix(name)?.strip_prefix('=')?;
    Some(rest.split(';').next().unwrap_or(rest))
}
