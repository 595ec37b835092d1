//! WebSocket transport
//!
//! The agent dials the server URL with an HTTP(S) upgrade, optionally
//! through an upstream proxy and with user-supplied headers; the server
//! accepts plain or TLS connections. Both ends expose the socket as a
//! [`Transport`] of binary messages.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HOST;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, client_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{proxy, Transport, TransportError, TransportReader, TransportWriter};

/// How the agent reaches the server.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Server URL; `http(s)://` is upgraded to `ws(s)://`.
    pub url: String,
    /// Extra headers for the upgrade request.
    pub headers: Vec<(String, String)>,
    /// Optional `Host` header override.
    pub hostname: Option<String>,
    /// Optional upstream proxy URL (`http://` = CONNECT, `socks5://` = SOCKS5).
    pub proxy: Option<String>,
    /// Handshake deadline.
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            hostname: None,
            proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Normalize the configured server URL to a ws/wss URL.
fn websocket_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(format!("{raw:?}: {e}")))?;
    let normalized = match url.scheme() {
        "ws" | "wss" => url,
        "http" => Url::parse(&raw.replacen("http://", "ws://", 1))
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?,
        "https" => Url::parse(&raw.replacen("https://", "wss://", 1))
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?,
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {other:?} in {raw:?}"
            )))
        }
    };
    if normalized.host_str().is_none() {
        return Err(TransportError::InvalidUrl(format!("{raw:?} has no host")));
    }
    Ok(normalized)
}

/// Dial the server and return the established transport.
pub async fn dial(opts: &DialOptions) -> Result<Box<dyn Transport>, TransportError> {
    let url = websocket_url(&opts.url)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    for (name, value) in &opts.headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| TransportError::InvalidUrl(format!("bad header name: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| TransportError::InvalidUrl(format!("bad header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    if let Some(hostname) = &opts.hostname {
        let value = HeaderValue::from_str(hostname)
            .map_err(|e| TransportError::InvalidUrl(format!("bad hostname: {e}")))?;
        request.headers_mut().insert(HOST, value);
    }

    let handshake = async {
        let ws_stream = match &opts.proxy {
            None => {
                let (ws_stream, _response) = connect_async(request)
                    .await
                    .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                ws_stream
            }
            Some(proxy_url) => {
                let host = url.host_str().unwrap_or_default().to_string();
                let port = url.port_or_known_default().unwrap_or(80);
                let tcp = proxy::dial_via_proxy(proxy_url, &host, port).await?;

                let stream = if url.scheme() == "wss" {
                    let connector = tls_connector();
                    let dns_name = rustls::pki_types::ServerName::try_from(host.clone())
                        .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;
                    let tls = connector
                        .connect(dns_name, tcp)
                        .await
                        .map_err(|e| TransportError::Tls(e.to_string()))?;
                    MaybeTlsStream::Rustls(tls)
                } else {
                    MaybeTlsStream::Plain(tcp)
                };

                let (ws_stream, _response) = client_async(request, stream)
                    .await
                    .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                ws_stream
            }
        };
        Ok::<_, TransportError>(ws_stream)
    };

    let ws_stream = tokio::time::timeout(opts.timeout, handshake)
        .await
        .map_err(|_| TransportError::Timeout)??;

    debug!(url = %url, "websocket connected");
    Ok(Box::new(WebSocketTransport::new(ws_stream)))
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// WebSocket-backed [`Transport`].
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    connected: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            connected: true,
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::ConnectionClosed);
        }

        self.stream
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.connected {
            return Err(TransportError::ConnectionClosed);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) => {
                    debug!("websocket closed by remote");
                    self.connected = false;
                    return Ok(None);
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                }
                Some(Ok(_)) => {
                    // Text and pong frames are not part of the protocol.
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Err(TransportError::WebSocket(e.to_string()));
                }
                None => {
                    self.connected = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WsWriter { sink }),
            Box::new(WsReader { stream }),
        )
    }
}

struct WsWriter<S> {
    sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

struct WsReader<S> {
    stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => {
                    // Ping/pong bookkeeping happens inside tungstenite.
                }
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Server listener configuration.
#[derive(Debug, Clone, Default)]
pub struct WsListenerConfig {
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

/// Accepts agent connections, optionally terminating TLS.
pub struct WsListener {
    tcp: TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl WsListener {
    pub async fn bind(addr: SocketAddr, config: WsListenerConfig) -> Result<Self, TransportError> {
        let tls = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Some(build_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(TransportError::Tls(
                    "tls requires both cert and key paths".to_string(),
                ))
            }
        };

        let tcp = TcpListener::bind(addr).await?;
        info!(
            addr = %tcp.local_addr()?,
            tls = tls.is_some(),
            "control listener bound"
        );
        Ok(Self { tcp, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept the next agent connection and finish the upgrade handshake.
    pub async fn accept(&self) -> Result<(Box<dyn Transport>, SocketAddr), TransportError> {
        loop {
            let (tcp_stream, peer_addr) = self.tcp.accept().await?;
            debug!(peer = %peer_addr, "incoming tcp connection");

            match &self.tls {
                Some(acceptor) => {
                    let tls_stream = match acceptor.accept(tcp_stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "tls handshake failed");
                            continue;
                        }
                    };
                    match accept_async(tls_stream).await {
                        Ok(ws) => return Ok((Box::new(WebSocketTransport::new(ws)), peer_addr)),
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "websocket handshake failed");
                            continue;
                        }
                    }
                }
                None => match accept_async(tcp_stream).await {
                    Ok(ws) => return Ok((Box::new(WebSocketTransport::new(ws)), peer_addr)),
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "websocket handshake failed");
                        continue;
                    }
                },
            }
        }
    }
}

fn build_tls_acceptor(
    cert_path: &str,
    key_path: &str,
) -> Result<tokio_rustls::TlsAcceptor, TransportError> {
    ensure_crypto_provider();

    let certs = load_certs(Path::new(cert_path))?;
    let key = load_private_key(Path::new(key_path))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("invalid cert/key: {e}")))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("failed to open cert file: {e}")))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certs: {e}")))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("failed to open key file: {e}")))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("failed to parse key: {e}")))?
        .ok_or_else(|| TransportError::Tls("no private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization() {
        assert_eq!(
            websocket_url("http://server:8080").unwrap().as_str(),
            "ws://server:8080/"
        );
        assert_eq!(
            websocket_url("https://server").unwrap().scheme(),
            "wss"
        );
        assert_eq!(websocket_url("ws://server").unwrap().scheme(), "ws");
        assert!(websocket_url("ftp://server").is_err());
        assert!(websocket_url("not a url").is_err());
    }

    #[tokio::test]
    async fn loopback_roundtrip() {
        let listener = WsListener::bind("127.0.0.1:0".parse().unwrap(), WsListenerConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut transport, _peer) = listener.accept().await.unwrap();
            let msg = transport.recv().await.unwrap().unwrap();
            transport.send(msg).await.unwrap();
            transport.close().await.unwrap();
        });

        let opts = DialOptions {
            url: format!("http://{addr}"),
            ..Default::default()
        };
        let mut client = dial(&opts).await.unwrap();
        client.send(Bytes::from_static(b"echo me")).await.unwrap();
        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(echoed, Bytes::from_static(b"echo me"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn custom_headers_are_sent() {
        // A raw TCP acceptor lets the test observe the upgrade request head.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let opts = DialOptions {
            url: format!("ws://{addr}"),
            headers: vec![("Foo".to_string(), "Bar".to_string())],
            hostname: Some("pinned.example".to_string()),
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        // The handshake never completes; only the request head matters.
        let _ = dial(&opts).await;

        let head = server.await.unwrap();
        assert!(head.contains("Foo: Bar") || head.contains("foo: Bar"));
        assert!(head.to_lowercase().contains("host: pinned.example"));
    }
}
