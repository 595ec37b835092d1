//! Multiplexed session
//!
//! A [`Session`] owns one control link. It multiplexes tunnel data channels
//! and global requests over the transport: a writer task drains an outbox,
//! a reader task routes inbound frames to per-channel buffers, pending
//! reply slots, or the application's event queue. All channel buffers are
//! bounded, so a slow consumer backpressures the sender instead of growing
//! memory.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use portway_proto::{
    ChannelIds, ControlCodec, ControlMessage, Frame, FrameKind, Side, StreamId,
};
use portway_transport::{Transport, TransportReader, TransportWriter};

/// Per-channel inbound buffer, in frames.
const STREAM_BUFFER: usize = 64;
/// Application event queue depth.
const EVENT_BUFFER: usize = 64;
/// Outbox depth shared by all writers on the session.
const OUTBOX_BUFFER: usize = 256;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("channel rejected: {0}")]
    ChannelRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Codec(#[from] portway_proto::CodecError),

    #[error(transparent)]
    Mux(#[from] portway_proto::MuxError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A global request from the peer; the application must answer it through
/// [`Session::reply`].
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: u64,
    pub name: String,
    pub payload: Vec<u8>,
}

/// A channel-open from the peer; answer with [`Session::accept_channel`] or
/// [`Session::reject_channel`].
#[derive(Debug)]
pub struct IncomingChannel {
    pub stream_id: StreamId,
    pub target: String,
}

/// Events surfaced to the application.
#[derive(Debug)]
pub enum SessionEvent {
    Request(IncomingRequest),
    Channel(IncomingChannel),
    /// The transport ended; no further events follow.
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    outbox: mpsc::Sender<Bytes>,
    pending_replies: DashMap<u64, oneshot::Sender<(bool, Vec<u8>)>>,
    pending_channels: DashMap<StreamId, oneshot::Sender<Result<(), String>>>,
    streams: DashMap<StreamId, mpsc::Sender<Bytes>>,
    next_request_id: AtomicU64,
    channel_ids: ChannelIds,
    closed_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionInner {
    fn mark_closed(&self) {
        let _ = self.closed_tx.send(true);
        self.pending_replies.clear();
        self.pending_channels.clear();
        self.streams.clear();
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Take over an authenticated transport and start the IO tasks. Returns
    /// the session handle and the stream of peer-initiated events.
    pub fn start(transport: Box<dyn Transport>, side: Side) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (closed_tx, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            outbox: outbox_tx,
            pending_replies: DashMap::new(),
            pending_channels: DashMap::new(),
            streams: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            channel_ids: ChannelIds::new(side),
            closed_tx,
            shutdown_tx,
        });

        let (writer, reader) = transport.split();
        tokio::spawn(run_writer(writer, outbox_rx, shutdown_rx.clone()));
        tokio::spawn(run_reader(reader, inner.clone(), event_tx, shutdown_rx));

        (Self { inner }, event_rx)
    }

    /// True once the transport has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Watch for session closure.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Close the session: the writer sends a close frame and both IO tasks
    /// wind down. Idempotent.
    pub fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Send a global request and await its reply. An `ok=false` reply comes
    /// back as [`SessionError::Remote`] carrying the peer's error string.
    pub async fn request(
        &self,
        name: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        if self.inner.is_closed() {
            return Err(SessionError::Closed);
        }

        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_replies.insert(id, tx);

        let msg = ControlMessage::Request {
            id,
            name: name.to_string(),
            payload,
        };
        if let Err(e) = self.send_control(msg).await {
            self.inner.pending_replies.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.inner.pending_replies.remove(&id);
                Err(SessionError::Timeout)
            }
            Ok(Err(_)) => Err(SessionError::Closed),
            Ok(Ok((true, body))) => Ok(body),
            Ok(Ok((false, body))) => {
                Err(SessionError::Remote(String::from_utf8_lossy(&body).into_owned()))
            }
        }
    }

    /// Answer an incoming request.
    pub async fn reply(
        &self,
        id: u64,
        result: Result<Vec<u8>, String>,
    ) -> Result<(), SessionError> {
        let (ok, payload) = match result {
            Ok(body) => (true, body),
            Err(message) => (false, message.into_bytes()),
        };
        self.send_control(ControlMessage::Reply { id, ok, payload }).await
    }

    /// Open a data channel toward `target` (`"host:port"`).
    pub async fn open_channel(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<ChannelStream, SessionError> {
        if self.inner.is_closed() {
            return Err(SessionError::Closed);
        }

        let stream_id = self.inner.channel_ids.next();
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        let (accept_tx, accept_rx) = oneshot::channel();

        // Register before sending so data arriving right after the accept is
        // never dropped.
        self.inner.streams.insert(stream_id, data_tx);
        self.inner.pending_channels.insert(stream_id, accept_tx);

        let msg = ControlMessage::ChannelOpen {
            stream_id,
            target: target.to_string(),
        };
        if let Err(e) = self.send_control(msg).await {
            self.inner.streams.remove(&stream_id);
            self.inner.pending_channels.remove(&stream_id);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(timeout, accept_rx).await {
            Err(_) => Err(SessionError::Timeout),
            Ok(Err(_)) => Err(SessionError::Closed),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(SessionError::ChannelRejected(reason)),
        };

        match outcome {
            Ok(()) => Ok(ChannelStream {
                stream_id,
                rx: data_rx,
                session: self.clone(),
            }),
            Err(e) => {
                self.inner.streams.remove(&stream_id);
                self.inner.pending_channels.remove(&stream_id);
                Err(e)
            }
        }
    }

    /// Accept a peer-opened channel.
    pub async fn accept_channel(
        &self,
        incoming: &IncomingChannel,
    ) -> Result<ChannelStream, SessionError> {
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        self.inner.streams.insert(incoming.stream_id, data_tx);

        let msg = ControlMessage::ChannelAccept {
            stream_id: incoming.stream_id,
        };
        if let Err(e) = self.send_control(msg).await {
            self.inner.streams.remove(&incoming.stream_id);
            return Err(e);
        }

        Ok(ChannelStream {
            stream_id: incoming.stream_id,
            rx: data_rx,
            session: self.clone(),
        })
    }

    /// Reject a peer-opened channel.
    pub async fn reject_channel(
        &self,
        incoming: &IncomingChannel,
        reason: &str,
    ) -> Result<(), SessionError> {
        self.send_control(ControlMessage::ChannelReject {
            stream_id: incoming.stream_id,
            reason: reason.to_string(),
        })
        .await
    }

    async fn send_control(&self, msg: ControlMessage) -> Result<(), SessionError> {
        let payload = ControlCodec::encode(&msg)?;
        let frame = Frame::control(payload).encode()?;
        self.inner
            .outbox
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn send_data(&self, stream_id: StreamId, data: Bytes) -> Result<(), SessionError> {
        let frame = Frame::data(stream_id, data).encode()?;
        self.inner
            .outbox
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn send_close(&self, stream_id: StreamId) -> Result<(), SessionError> {
        self.inner.streams.remove(&stream_id);
        let frame = Frame::close(stream_id).encode()?;
        self.inner
            .outbox
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// One data channel on a session.
#[derive(Debug)]
pub struct ChannelStream {
    stream_id: StreamId,
    rx: mpsc::Receiver<Bytes>,
    session: Session,
}

impl ChannelStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        self.session.send_data(self.stream_id, data).await
    }

    /// Next chunk; `None` once the peer closed the channel or the session
    /// ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Close the channel, notifying the peer.
    pub async fn close(self) {
        let _ = self.session.send_close(self.stream_id).await;
    }

    /// Split into independently owned send and receive halves so a copy
    /// loop can drive both directions from one `select!`.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (
            ChannelSender {
                stream_id: self.stream_id,
                session: self.session,
            },
            ChannelReceiver { rx: self.rx },
        )
    }
}

/// Send half of a split channel.
pub struct ChannelSender {
    stream_id: StreamId,
    session: Session,
}

impl ChannelSender {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        self.session.send_data(self.stream_id, data).await
    }

    pub async fn close(self) {
        let _ = self.session.send_close(self.stream_id).await;
    }
}

/// Receive half of a split channel.
pub struct ChannelReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelReceiver {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

async fn run_writer(
    mut writer: Box<dyn TransportWriter>,
    mut outbox_rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = writer.close().await;
                break;
            }
            item = outbox_rx.recv() => match item {
                Some(bytes) => {
                    if let Err(e) = writer.send(bytes).await {
                        debug!(error = %e, "transport write failed");
                        break;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            }
        }
    }
    trace!("session writer ended");
}

async fn run_reader(
    mut reader: Box<dyn TransportReader>,
    inner: Arc<SessionInner>,
    event_tx: mpsc::Sender<SessionEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = reader.recv() => match frame {
                Ok(Some(bytes)) => {
                    if let Err(e) = route_frame(&inner, &event_tx, bytes).await {
                        warn!(error = %e, "dropping link after protocol error");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "transport read failed");
                    break;
                }
            }
        }
    }

    inner.mark_closed();
    let _ = event_tx.send(SessionEvent::Closed).await;
    trace!("session reader ended");
}

async fn route_frame(
    inner: &Arc<SessionInner>,
    event_tx: &mpsc::Sender<SessionEvent>,
    bytes: Bytes,
) -> Result<(), SessionError> {
    let frame = Frame::decode(bytes)?;

    match frame.kind {
        FrameKind::Control => {
            let mut buf = BytesMut::from(frame.payload.as_ref());
            while let Some(msg) = ControlCodec::decode(&mut buf)? {
                route_control(inner, event_tx, msg).await?;
            }
            Ok(())
        }
        FrameKind::Data => {
            // Clone the sender out of the map; holding a map guard across
            // the bounded send would block unrelated routing.
            let sender = inner
                .streams
                .get(&frame.stream_id)
                .map(|entry| entry.value().clone());
            match sender {
                Some(tx) => {
                    if tx.send(frame.payload).await.is_err() {
                        trace!(stream_id = frame.stream_id, "channel receiver gone");
                        inner.streams.remove(&frame.stream_id);
                    }
                }
                None => {
                    trace!(stream_id = frame.stream_id, "data for unknown channel");
                }
            }
            Ok(())
        }
        FrameKind::Close => {
            inner.streams.remove(&frame.stream_id);
            Ok(())
        }
    }
}

async fn route_control(
    inner: &Arc<SessionInner>,
    event_tx: &mpsc::Sender<SessionEvent>,
    msg: ControlMessage,
) -> Result<(), SessionError> {
    match msg {
        ControlMessage::Request { id, name, payload } => {
            let event = SessionEvent::Request(IncomingRequest { id, name, payload });
            event_tx
                .send(event)
                .await
                .map_err(|_| SessionError::Closed)?;
        }
        ControlMessage::Reply { id, ok, payload } => {
            match inner.pending_replies.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send((ok, payload));
                }
                None => warn!(id, "reply for unknown request"),
            }
        }
        ControlMessage::ChannelOpen { stream_id, target } => {
            let event = SessionEvent::Channel(IncomingChannel { stream_id, target });
            event_tx
                .send(event)
                .await
                .map_err(|_| SessionError::Closed)?;
        }
        ControlMessage::ChannelAccept { stream_id } => {
            if let Some((_, tx)) = inner.pending_channels.remove(&stream_id) {
                let _ = tx.send(Ok(()));
            }
        }
        ControlMessage::ChannelReject { stream_id, reason } => {
            if let Some((_, tx)) = inner.pending_channels.remove(&stream_id) {
                let _ = tx.send(Err(reason));
            }
        }
        other => {
            return Err(SessionError::Protocol(format!(
                "unexpected handshake message on running session: {other:?}"
            )));
        }
    }
    Ok(())
}

/// Pre-session control exchange used during the handshake, before the IO
/// tasks take over the transport.
pub mod handshake {
    use super::*;
    use std::time::Instant;

    pub async fn send(
        transport: &mut dyn Transport,
        msg: &ControlMessage,
    ) -> Result<(), SessionError> {
        let payload = ControlCodec::encode(msg)?;
        let frame = Frame::control(payload).encode()?;
        transport
            .send(frame)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Receive the next control message, skipping stray data frames.
    pub async fn recv(
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<ControlMessage, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout);
            }

            let received = tokio::time::timeout(remaining, transport.recv())
                .await
                .map_err(|_| SessionError::Timeout)?
                .map_err(|e| SessionError::Transport(e.to_string()))?;

            let bytes = received.ok_or(SessionError::Closed)?;
            let frame = Frame::decode(bytes)?;
            if frame.kind != FrameKind::Control {
                continue;
            }

            let mut buf = BytesMut::from(frame.payload.as_ref());
            if let Some(msg) = ControlCodec::decode(&mut buf)? {
                return Ok(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use portway_transport::TransportError;

    struct MockTransport {
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    fn transport_pair() -> (MockTransport, MockTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MockTransport { tx: a_tx, rx: a_rx },
            MockTransport { tx: b_tx, rx: b_rx },
        )
    }

    struct MockWriter {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    struct MockReader {
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
            self.tx
                .send(data)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(self.rx.recv().await)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn split(
            self: Box<Self>,
        ) -> (
            Box<dyn portway_transport::TransportWriter>,
            Box<dyn portway_transport::TransportReader>,
        ) {
            (
                Box::new(MockWriter { tx: self.tx }),
                Box::new(MockReader { rx: self.rx }),
            )
        }
    }

    #[async_trait]
    impl portway_transport::TransportWriter for MockWriter {
        async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
            self.tx
                .send(data)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl portway_transport::TransportReader for MockReader {
        async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(self.rx.recv().await)
        }
    }

    fn session_pair() -> (
        Session,
        mpsc::Receiver<SessionEvent>,
        Session,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (a, b) = transport_pair();
        let (sess_a, events_a) = Session::start(Box::new(a), Side::Agent);
        let (sess_b, events_b) = Session::start(Box::new(b), Side::Server);
        (sess_a, events_a, sess_b, events_b)
    }

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let (client, _events_a, server, mut events_b) = session_pair();

        tokio::spawn(async move {
            while let Some(event) = events_b.recv().await {
                if let SessionEvent::Request(req) = event {
                    assert_eq!(req.name, "ping");
                    server.reply(req.id, Ok(b"{}".to_vec())).await.unwrap();
                }
            }
        });

        let body = client
            .request("ping", b"{}".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_remote_error() {
        let (client, _events_a, server, mut events_b) = session_pair();

        tokio::spawn(async move {
            while let Some(event) = events_b.recv().await {
                if let SessionEvent::Request(req) = event {
                    server
                        .reply(req.id, Err("no such command".to_string()))
                        .await
                        .unwrap();
                }
            }
        });

        let err = client
            .request("bogus", b"{}".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SessionError::Remote(msg) => assert_eq!(msg, "no such command"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let (client, _events_a, _server, _events_b) = session_pair();

        let err = client
            .request("ping", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
    }

    #[tokio::test]
    async fn channel_echo() {
        let (client, _events_a, server, mut events_b) = session_pair();

        tokio::spawn(async move {
            while let Some(event) = events_b.recv().await {
                if let SessionEvent::Channel(incoming) = event {
                    assert_eq!(incoming.target, "127.0.0.1:80");
                    let mut ch = server.accept_channel(&incoming).await.unwrap();
                    while let Some(data) = ch.recv().await {
                        ch.send(data).await.unwrap();
                    }
                }
            }
        });

        let mut ch = client
            .open_channel("127.0.0.1:80", Duration::from_secs(1))
            .await
            .unwrap();
        ch.send(Bytes::from_static(b"abc")).await.unwrap();
        ch.send(Bytes::from_static(b"def")).await.unwrap();

        assert_eq!(ch.recv().await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(ch.recv().await.unwrap(), Bytes::from_static(b"def"));
    }

    #[tokio::test]
    async fn channel_rejection() {
        let (client, _events_a, server, mut events_b) = session_pair();

        tokio::spawn(async move {
            while let Some(event) = events_b.recv().await {
                if let SessionEvent::Channel(incoming) = event {
                    server
                        .reject_channel(&incoming, "target unreachable")
                        .await
                        .unwrap();
                }
            }
        });

        let err = client
            .open_channel("10.0.0.1:99", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SessionError::ChannelRejected(reason) => assert_eq!(reason, "target unreachable"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_propagates_to_peer() {
        let (client, _events_a, _server, mut events_b) = session_pair();

        client.close();

        // The peer's reader observes the writer dropping and reports Closed.
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events_b.recv())
                .await
                .unwrap()
            {
                Some(SessionEvent::Closed) | None => break,
                Some(_) => continue,
            }
        }

        // The local reader observes shutdown within a scheduling round.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_closed());
    }
}
