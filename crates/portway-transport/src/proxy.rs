//! Upstream proxy dialing
//!
//! Agents often sit behind corporate egress proxies. An `http://` proxy URL
//! selects HTTP CONNECT, `socks://`/`socks5://` selects SOCKS5; credentials
//! come from the URL userinfo.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::TransportError;

/// Establish a TCP stream to `target_host:target_port` through the proxy.
pub async fn dial_via_proxy(
    proxy_url: &str,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, TransportError> {
    let url =
        Url::parse(proxy_url).map_err(|e| TransportError::InvalidUrl(format!("proxy: {e}")))?;

    let proxy_host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("proxy url has no host".to_string()))?;
    let proxy_port = url.port().ok_or_else(|| {
        TransportError::InvalidUrl("proxy url must carry an explicit port".to_string())
    })?;

    debug!(proxy = %format!("{proxy_host}:{proxy_port}"), scheme = url.scheme(), "dialing upstream proxy");
    let stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let username = url.username();
    let password = url.password().unwrap_or("");

    match url.scheme() {
        "http" => {
            let auth = if username.is_empty() {
                None
            } else {
                Some((username.to_string(), password.to_string()))
            };
            http_connect(stream, target_host, target_port, auth).await
        }
        "socks" | "socks5" => {
            let auth = if username.is_empty() {
                None
            } else {
                Some((username.to_string(), password.to_string()))
            };
            socks5_connect(stream, target_host, target_port, auth).await
        }
        other => Err(TransportError::InvalidUrl(format!(
            "unsupported proxy scheme: {other}"
        ))),
    }
}

/// HTTP CONNECT tunnel establishment.
async fn http_connect(
    mut stream: TcpStream,
    host: &str,
    port: u16,
    auth: Option<(String, String)>,
) -> Result<TcpStream, TransportError> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((user, pass)) = auth {
        let credentials = STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;

    // Read the response head. Anything past the blank line belongs to the
    // tunneled protocol, so stop exactly there.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(TransportError::Proxy(
                "proxy CONNECT response too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::Proxy(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .map(|code| code.starts_with('2'))
        .unwrap_or(false);

    if !ok {
        return Err(TransportError::Proxy(format!(
            "proxy CONNECT refused: {status_line}"
        )));
    }

    debug!(target = %format!("{host}:{port}"), "HTTP CONNECT tunnel established");
    Ok(stream)
}

/// SOCKS5 (RFC 1928) connect, with optional username/password (RFC 1929).
async fn socks5_connect(
    mut stream: TcpStream,
    host: &str,
    port: u16,
    auth: Option<(String, String)>,
) -> Result<TcpStream, TransportError> {
    // Method negotiation.
    let greeting: &[u8] = if auth.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(TransportError::Proxy(
            "not a SOCKS5 proxy".to_string(),
        ));
    }

    match choice[1] {
        0x00 => {}
        0x02 => {
            let (user, pass) = auth.ok_or_else(|| {
                TransportError::Proxy("proxy requires credentials".to_string())
            })?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(TransportError::Proxy(
                    "SOCKS5 credentials too long".to_string(),
                ));
            }
            let mut msg = vec![0x01, user.len() as u8];
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream.write_all(&msg).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(TransportError::Proxy(
                    "SOCKS5 authentication rejected".to_string(),
                ));
            }
        }
        0xff => {
            return Err(TransportError::Proxy(
                "SOCKS5 proxy accepted no auth method".to_string(),
            ))
        }
        other => {
            return Err(TransportError::Proxy(format!(
                "SOCKS5 proxy chose unsupported method {other:#x}"
            )))
        }
    }

    // Connect request with a domain-name address.
    if host.len() > 255 {
        return Err(TransportError::Proxy("target host too long".to_string()));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(TransportError::Proxy(format!(
            "SOCKS5 connect failed with code {:#x}",
            reply[1]
        )));
    }

    // Drain the bound address field.
    match reply[3] {
        0x01 => {
            let mut skip = [0u8; 6];
            stream.read_exact(&mut skip).await?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut skip = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut skip).await?;
        }
        0x04 => {
            let mut skip = [0u8; 18];
            stream.read_exact(&mut skip).await?;
        }
        other => {
            return Err(TransportError::Proxy(format!(
                "SOCKS5 reply with unknown address type {other:#x}"
            )))
        }
    }

    debug!(target = %format!("{host}:{port}"), "SOCKS5 tunnel established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn http_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            req
        });

        let proxy_url = format!("http://{addr}");
        let stream = dial_via_proxy(&proxy_url, "example.com", 8080).await.unwrap();
        drop(stream);

        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT example.com:8080 HTTP/1.1"));
        assert!(!req.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn http_connect_sends_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            req
        });

        let proxy_url = format!("http://admin:secret@{addr}");
        dial_via_proxy(&proxy_url, "target", 22).await.unwrap();

        let req = server.await.unwrap();
        let expected = STANDARD.encode("admin:secret");
        assert!(req.contains(&format!("Proxy-Authorization: Basic {expected}")));
    }

    #[tokio::test]
    async fn http_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy_url = format!("http://{addr}");
        let err = dial_via_proxy(&proxy_url, "target", 22).await.unwrap_err();
        assert!(matches!(err, TransportError::Proxy(_)));
    }

    #[tokio::test]
    async fn socks5_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            sock.read_exact(&mut rest).await.unwrap();

            // Reply: success, bound to 0.0.0.0:0.
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let proxy_url = format!("socks5://{addr}");
        dial_via_proxy(&proxy_url, "inner.example", 443).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_scheme_rejected() {
        let err = dial_via_proxy("ftp://127.0.0.1:1080", "t", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }
}
