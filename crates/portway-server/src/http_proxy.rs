//! HTTP proxy-mode head rewriting
//!
//! Tunnels with an `http`/`https` scheme in proxy mode rewrite the first
//! request head of each connection: the `Host` header becomes the dial
//! target, hop-by-hop headers are stripped, and `Connection: close` pins the
//! connection to a single request so the raw passthrough that follows stays
//! well-formed.

/// Largest request head the rewriter will buffer.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Find the end of the request head (the blank line), if complete.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Rewrite a complete request head for forwarding to `target_host`.
/// Returns `None` when the input is not parseable as an HTTP/1.x head, in
/// which case the caller should pass the bytes through untouched.
pub fn rewrite_head(head: &[u8], target_host: &str) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    let _uri = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }

    let mut out = String::with_capacity(head.len());
    out.push_str(request_line);
    out.push_str("\r\n");
    out.push_str(&format!("Host: {target_host}\r\n"));

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, _value)) = line.split_once(':') else {
            return None;
        };
        let lower = name.trim().to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out.push_str("Connection: close\r\n\r\n");
    Some(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_head_boundary() {
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n\r\nBODY"), Some(18));
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn rewrites_host_and_strips_hop_by_hop() {
        let head = b"GET /path HTTP/1.1\r\nHost: public.example\r\nConnection: keep-alive\r\nAccept: */*\r\nProxy-Authorization: Basic xx\r\n\r\n";
        let rewritten = rewrite_head(head, "10.0.0.5:8080").unwrap();
        let text = String::from_utf8(rewritten).unwrap();

        assert!(text.starts_with("GET /path HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.5:8080\r\n"));
        assert!(!text.contains("public.example"));
        assert!(!text.contains("keep-alive"));
        assert!(!text.contains("Proxy-Authorization"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn preserves_content_headers() {
        let head =
            b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\n";
        let text = String::from_utf8(rewrite_head(head, "t:1").unwrap()).unwrap();
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
    }

    #[test]
    fn non_http_input_passes_through() {
        assert!(rewrite_head(b"\x16\x03\x01\x02\x00garbage\r\n\r\n", "t:1").is_none());
        assert!(rewrite_head(b"GET /only-two-fields\r\n\r\n", "t:1").is_none());
    }
}
