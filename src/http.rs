//! HTTP sniffing, request-line rewriting, and wire responses
//!
//! This layer never parses a full HTTP message. Classification and routing
//! look only at the first request line inside the initial buffer; everything
//! after it is forwarded untouched.

use std::path::Path;

// Pre-computed responses, always `Connection: close`
pub const RESPONSE_404: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
Content-Type: text/plain\r\n\
Content-Length: 9\r\n\
Connection: close\r\n\r\nNot Found";

pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
Content-Type: text/plain\r\n\
Content-Length: 9\r\n\
Connection: close\r\n\r\nForbidden";

pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Type: text/plain\r\n\
Content-Length: 11\r\n\
Connection: close\r\n\r\nBad Gateway";

const HTTP_METHODS: &[&str] = &[
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

/// True when the buffer starts with an HTTP method token followed by a space
pub fn is_http(buf: &[u8]) -> bool {
    HTTP_METHODS
        .iter()
        .any(|m| buf.starts_with(m.as_bytes()))
}

/// Index of the first `\n`, or `None`
pub fn first_line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Extract the request path from a request line: trim, split on spaces, take
/// the second token. Empty when the line has fewer than two tokens.
pub fn extract_path(line: &str) -> &str {
    line.trim().split(' ').nth(1).unwrap_or("")
}

/// Request line of the initial buffer (everything before the first `\n`,
/// or the whole buffer when no newline arrived yet)
pub fn request_line(buf: &[u8]) -> &[u8] {
    match first_line_end(buf) {
        Some(idx) => &buf[..idx],
        None => buf,
    }
}

/// Rewrite the first request line's path prefix `from` to `to`, leaving the
/// method, HTTP version token, and everything after the first CRLF unchanged.
/// The buffer is returned unmodified when it has no CRLF, fewer than three
/// request-line tokens, or a path that does not start with `from`.
pub fn rewrite_path(buf: &[u8], from: &str, to: &str) -> Vec<u8> {
    let Some(crlf) = buf.windows(2).position(|w| w == b"\r\n") else {
        return buf.to_vec();
    };

    let Ok(line) = std::str::from_utf8(&buf[..crlf]) else {
        return buf.to_vec();
    };

    let mut tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() < 3 || !tokens[1].starts_with(from) {
        return buf.to_vec();
    }

    let new_path = format!("{}{}", to, &tokens[1][from.len()..]);
    tokens[1] = &new_path;

    let mut out = tokens.join(" ").into_bytes();
    out.extend_from_slice(&buf[crlf..]);
    out
}

/// Build a `200 OK` response serving file bytes, with the Content-Type chosen
/// by the file extension
pub fn file_response(path: &Path, body: &[u8]) -> Vec<u8> {
    let content_type = content_type_for(path);
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        _ => "text/html; charset=utf-8",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_http_all_methods() {
        for req in [
            "GET / HTTP/1.1\r\n",
            "POST /api HTTP/1.1\r\n",
            "PUT /x HTTP/1.1\r\n",
            "DELETE /x HTTP/1.1\r\n",
            "HEAD / HTTP/1.1\r\n",
            "OPTIONS * HTTP/1.1\r\n",
            "PATCH /x HTTP/1.1\r\n",
            "CONNECT example.com:443 HTTP/1.1\r\n",
            "TRACE / HTTP/1.1\r\n",
        ] {
            assert!(is_http(req.as_bytes()), "{req}");
        }
    }

    #[test]
    fn test_is_http_negatives() {
        assert!(!is_http(b"SSH-2.0-OpenSSH_9.6\r\n"));
        assert!(!is_http(b"GETX / HTTP/1.1\r\n"));
        assert!(!is_http(b"get / HTTP/1.1\r\n"));
        assert!(!is_http(b"\x16\x03\x01\x02\x00"));
        assert!(!is_http(b""));
        // Method without the trailing space is not a classified request yet
        assert!(!is_http(b"GET"));
    }

    #[test]
    fn test_first_line_end() {
        assert_eq!(first_line_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), Some(15));
        assert_eq!(first_line_end(b"no newline here"), None);
    }

    #[test]
    fn test_extract_path() {
        assert_eq!(extract_path("GET /slt HTTP/1.1\r"), "/slt");
        assert_eq!(extract_path("POST /api/v1/users HTTP/1.1"), "/api/v1/users");
        assert_eq!(extract_path("GET"), "");
        assert_eq!(extract_path(""), "");
    }

    #[test]
    fn test_rewrite_path_basic() {
        let buf = b"GET /old/users HTTP/1.1\r\nHost: x\r\n\r\n";
        let out = rewrite_path(buf, "/old", "/new");
        assert_eq!(&out[..], b"GET /new/users HTTP/1.1\r\nHost: x\r\n\r\n" as &[u8]);
    }

    #[test]
    fn test_rewrite_path_round_trip() {
        let buf = b"GET /old/users?q=1 HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n";
        let there = rewrite_path(buf, "/old", "/new");
        let back = rewrite_path(&there, "/new", "/old");
        assert_eq!(&back[..], &buf[..]);
    }

    #[test]
    fn test_rewrite_path_no_crlf_unchanged() {
        let buf = b"GET /old HTTP/1.1";
        assert_eq!(rewrite_path(buf, "/old", "/new"), buf.to_vec());
    }

    #[test]
    fn test_rewrite_path_non_matching_prefix_unchanged() {
        let buf = b"GET /other HTTP/1.1\r\n\r\n";
        assert_eq!(rewrite_path(buf, "/old", "/new"), buf.to_vec());
    }

    #[test]
    fn test_rewrite_path_short_line_unchanged() {
        let buf = b"GET /old\r\n\r\n";
        assert_eq!(rewrite_path(buf, "/old", "/new"), buf.to_vec());
    }

    #[test]
    fn test_rewrite_only_touches_first_line() {
        let buf = b"GET /old HTTP/1.1\r\nX-Path: /old/keep\r\n\r\n";
        let out = rewrite_path(buf, "/old", "/new");
        assert_eq!(&out[..], b"GET /new HTTP/1.1\r\nX-Path: /old/keep\r\n\r\n" as &[u8]);
    }

    #[test]
    fn test_canned_response_lengths() {
        // Content-Length must match the fixed body lengths
        assert!(RESPONSE_404.ends_with(b"Not Found"));
        assert!(RESPONSE_404.windows(18).any(|w| w == b"Content-Length: 9\r"));
        assert!(RESPONSE_403.ends_with(b"Forbidden"));
        assert!(RESPONSE_403.windows(18).any(|w| w == b"Content-Length: 9\r"));
        assert!(RESPONSE_502.ends_with(b"Bad Gateway"));
        assert!(RESPONSE_502.windows(19).any(|w| w == b"Content-Length: 11\r"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a.json")), "application/json");
        assert_eq!(content_type_for(Path::new("a.txt")), "text/plain; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.css")), "text/css");
        assert_eq!(content_type_for(Path::new("a.js")), "application/javascript");
        assert_eq!(content_type_for(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("noext")), "text/html; charset=utf-8");
    }

    #[test]
    fn test_file_response_shape() {
        let out = file_response(Path::new("data.json"), b"{\"ok\":true}");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Connection: close\r\n\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }
}
