//! Shared WebSocket connection types and logic for both client and server.
//!
//! A [`Connection`] is a cheap, cloneable handle. Once the opening handshake
//! succeeds, two background tasks drive it: the transfer task reads frames,
//! answers control frames and queues complete messages; the close supervisor
//! tears the transport down once the transfer task is over.

pub mod client;
pub mod server;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::codec::{self, EndpointType, Opcode, WebsocketCodec, WebsocketFrame};
use crate::config::ConnectionConfig;
use crate::errors::{ConnectionError, WebsocketCodecError};
use crate::extensions::Extension;
use crate::handshake::HandshakeResult;
use crate::http11::Headers;
use crate::stream::{StreamReader, StreamWriter, Transport};

/// A message returned to end-users from a WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebsocketMessage {
    /// A string of text
    Text(String),
    /// A block of binary data
    Binary(Bytes),
}

impl WebsocketMessage {
    fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    fn into_frame(self, fin: bool) -> WebsocketFrame {
        match self {
            Self::Text(text) => WebsocketFrame::new(fin, Opcode::TextFrame, text.into_bytes()),
            Self::Binary(data) => WebsocketFrame::new(fin, Opcode::BinaryFrame, data),
        }
    }

    /// The text content, if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// The raw payload, text included.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(data) => data,
        }
    }
}

impl From<String> for WebsocketMessage {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for WebsocketMessage {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for WebsocketMessage {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for WebsocketMessage {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value.into())
    }
}

impl From<&[u8]> for WebsocketMessage {
    fn from(value: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(value))
    }
}

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl State {
    fn invalid_write(self) -> ConnectionError {
        ConnectionError::InvalidState(match self {
            State::Connecting => "cannot write to a WebSocket in the CONNECTING state",
            State::Open => "cannot write to a WebSocket in the OPEN state",
            State::Closing => "cannot write to a WebSocket in the CLOSING state",
            State::Closed => "cannot write to a WebSocket in the CLOSED state",
        })
    }
}

/// What the opening handshake exchanged, kept for the application.
#[derive(Debug, Clone)]
pub(crate) struct HandshakeInfo {
    pub(crate) path: String,
    pub(crate) request_headers: Headers,
    pub(crate) response_headers: Headers,
    pub(crate) result: HandshakeResult,
}

/// Pings waiting for their pong, oldest first.
#[derive(Default)]
struct PendingPings {
    order: VecDeque<Bytes>,
    waiters: HashMap<Bytes, (Instant, oneshot::Sender<Duration>)>,
}

impl PendingPings {
    fn register(&mut self, data: Bytes) -> Option<oneshot::Receiver<Duration>> {
        if self.waiters.contains_key(&data) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.order.push_back(data.clone());
        self.waiters.insert(data, (Instant::now(), tx));
        Some(rx)
    }

    /// Resolves the ping matching `data` and every older one still pending.
    fn acknowledge(&mut self, data: &[u8]) -> usize {
        if !self.waiters.contains_key(data) {
            return 0;
        }
        let mut resolved = 0;
        while let Some(key) = self.order.pop_front() {
            if let Some((sent, tx)) = self.waiters.remove(&key) {
                let _ = tx.send(sent.elapsed());
                resolved += 1;
            }
            if key[..] == *data {
                break;
            }
        }
        resolved
    }

    fn cancel_all(&mut self) {
        self.order.clear();
        self.waiters.clear();
    }
}

struct Inner {
    state: State,
    close_rcvd: Option<(u16, String)>,
    cause: Option<Arc<WebsocketCodecError>>,
    pings: PendingPings,
    sender: Option<mpsc::Sender<WebsocketMessage>>,
    transfer: Option<AbortHandle>,
    supervising: bool,
}

struct Shared {
    role: EndpointType,
    config: ConnectionConfig,
    reader: StreamReader,
    writer: StreamWriter,
    /// Write turn: frames are encoded and queued while holding it.
    codec: tokio::sync::Mutex<WebsocketCodec>,
    /// Held for the whole of a data message, fragmented or not.
    fragments: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    messages: tokio::sync::Mutex<mpsc::Receiver<WebsocketMessage>>,
    handshake: OnceLock<HandshakeInfo>,
    transfer_done: CancellationToken,
    closed: CancellationToken,
    span: tracing::Span,
}

/// A websocket connection
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps a transport in a connection in the `Connecting` state.
    pub(crate) fn new(transport: Transport, role: EndpointType, config: ConnectionConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_queue.max(1));
        let span = tracing::debug_span!("websocket", %role);
        Self {
            shared: Arc::new(Shared {
                role,
                reader: transport.reader,
                writer: transport.writer,
                codec: tokio::sync::Mutex::new(WebsocketCodec::new(role)),
                fragments: tokio::sync::Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: State::Connecting,
                    close_rcvd: None,
                    cause: None,
                    pings: PendingPings::default(),
                    sender: Some(sender),
                    transfer: None,
                    supervising: false,
                }),
                messages: tokio::sync::Mutex::new(receiver),
                handshake: OnceLock::new(),
                transfer_done: CancellationToken::new(),
                closed: CancellationToken::new(),
                config,
                span,
            }),
        }
    }

    pub(crate) fn reader(&self) -> &StreamReader {
        &self.shared.reader
    }

    pub(crate) fn writer(&self) -> &StreamWriter {
        &self.shared.writer
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Switches to `Open` and starts the background tasks.
    pub(crate) async fn connection_open(&self, info: HandshakeInfo) {
        let shared = &self.shared;
        let extensions = info.result.extensions.clone();
        shared.codec.lock().await.set_extensions(extensions.clone());
        let _ = shared.handshake.set(info);

        let mut inner = shared.inner.lock();
        if inner.state != State::Connecting {
            return;
        }
        inner.state = State::Open;
        tracing::debug!(parent: &shared.span, "connection open");
        if let Some(sender) = inner.sender.take() {
            let transfer = tokio::spawn(
                transfer_data(shared.clone(), sender, extensions).instrument(shared.span.clone()),
            );
            inner.transfer = Some(transfer.abort_handle());
        }
        inner.supervising = true;
        tokio::spawn(close_connection(shared.clone()).instrument(shared.span.clone()));
        if shared.config.ping_interval.is_some() {
            tokio::spawn(keepalive(shared.clone()).instrument(shared.span.clone()));
        }
    }

    /// Aborts the connection, sending a close frame first unless `code` is 1006.
    pub(crate) fn fail_connection(&self, code: u16, reason: &str) {
        self.shared.fail_connection(code, reason);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// Whether this side opened the connection.
    #[must_use]
    pub fn role(&self) -> EndpointType {
        self.shared.role
    }

    /// Close code, once the connection is closed. 1006 when no close frame was received.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        let inner = self.shared.inner.lock();
        (inner.state == State::Closed).then(|| inner.close_rcvd.as_ref().map_or(1006, |(code, _)| *code))
    }

    /// Close reason, once the connection is closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        let inner = self.shared.inner.lock();
        (inner.state == State::Closed).then(|| {
            inner
                .close_rcvd
                .as_ref()
                .map(|(_, reason)| reason.clone())
                .unwrap_or_default()
        })
    }

    /// Request path of the opening handshake.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.shared.handshake.get().map(|h| h.path.as_str())
    }

    /// Headers of the upgrade request.
    #[must_use]
    pub fn request_headers(&self) -> Option<&Headers> {
        self.shared.handshake.get().map(|h| &h.request_headers)
    }

    /// Headers of the `101 Switching Protocols` response.
    #[must_use]
    pub fn response_headers(&self) -> Option<&Headers> {
        self.shared.handshake.get().map(|h| &h.response_headers)
    }

    /// Negotiated subprotocol.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.shared
            .handshake
            .get()
            .and_then(|h| h.result.subprotocol.as_deref())
    }

    /// Names of the negotiated extensions, in the order they apply.
    #[must_use]
    pub fn extensions(&self) -> Vec<&str> {
        self.shared
            .handshake
            .get()
            .map(|h| h.result.extensions.iter().map(|e| e.name()).collect())
            .unwrap_or_default()
    }

    /// Waits for the next message.
    ///
    /// Messages received before the closing handshake are still delivered.
    ///
    /// # Errors
    /// [`ConnectionError::Closed`] once the connection is closed and every
    /// queued message was consumed, [`ConnectionError::ConcurrentRecv`] if
    /// another task is already waiting.
    pub async fn recv(&self) -> Result<WebsocketMessage, ConnectionError> {
        let shared = &self.shared;
        if self.state() == State::Connecting {
            return Err(ConnectionError::InvalidState(
                "WebSocket connection isn't established yet",
            ));
        }
        let Ok(mut messages) = shared.messages.try_lock() else {
            return Err(ConnectionError::ConcurrentRecv);
        };
        if let Some(message) = messages.recv().await {
            return Ok(message);
        }
        drop(messages);
        shared.ensure_open().await?;
        Err(shared.closed_error())
    }

    /// Poll for the next application message.
    ///
    /// Returns `None` once the connection closed normally (1000 or 1001).
    pub async fn next_message(&self) -> Option<Result<WebsocketMessage, ConnectionError>> {
        match self.recv().await {
            Ok(message) => Some(Ok(message)),
            Err(e) if e.is_closed_ok() => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Sends a message in a single frame.
    ///
    /// # Errors
    /// [`ConnectionError::Closed`] if the connection is not open or breaks
    /// while writing.
    pub async fn send(&self, message: impl Into<WebsocketMessage>) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        shared.ensure_open().await?;
        let _turn = shared.fragments.lock().await;
        shared.write_user_frame(message.into().into_frame(true)).await
    }

    /// Send a text message.
    /// # Errors
    /// Returns an error if the connection is closed or sending fails.
    pub async fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.send(text).await
    }

    /// Send a binary message.
    /// # Errors
    /// Returns an error if the connection is closed or sending fails.
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.send(data).await
    }

    /// Sends one message split over several frames, one per item.
    ///
    /// Control frames may be interleaved; other messages wait until the last
    /// fragment is written. An empty iterator sends nothing.
    ///
    /// # Errors
    /// [`ConnectionError::InvalidState`] when fragments mix text and binary,
    /// which also fails the connection with 1011.
    pub async fn send_fragments<I, M>(&self, fragments: I) -> Result<(), ConnectionError>
    where
        I: IntoIterator<Item = M>,
        M: Into<WebsocketMessage>,
    {
        let shared = &self.shared;
        shared.ensure_open().await?;
        let _turn = shared.fragments.lock().await;

        let mut fragments = fragments.into_iter().map(Into::into).peekable();
        let Some(first) = fragments.next() else {
            return Ok(());
        };
        let text = first.is_text();
        let mut frame = first.into_frame(fragments.peek().is_none());
        loop {
            let last = frame.fin;
            shared.write_user_frame(frame).await?;
            if last {
                return Ok(());
            }
            let Some(next) = fragments.next() else {
                return Ok(());
            };
            if next.is_text() != text {
                shared.fail_connection(1011, "");
                return Err(ConnectionError::InvalidState(
                    "data fragments must all be of the same type",
                ));
            }
            frame = next.into_frame(fragments.peek().is_none());
            frame.opcode = Opcode::ContinuationFrame;
        }
    }

    /// Sends a ping. The returned waiter resolves with the round-trip time
    /// once the matching pong, or a pong for a later ping, arrives.
    ///
    /// # Errors
    /// [`ConnectionError::DuplicatePing`] when a ping with the same payload is
    /// still pending, [`ConnectionError::Closed`] if the connection is not open.
    pub async fn ping(&self, data: impl Into<Bytes>) -> Result<PongWaiter, ConnectionError> {
        let shared = &self.shared;
        shared.ensure_open().await?;
        let frame = WebsocketFrame::new(true, Opcode::Ping, data);
        frame.check()?;
        let rx = shared
            .inner
            .lock()
            .pings
            .register(frame.payload.clone())
            .ok_or(ConnectionError::DuplicatePing)?;
        shared.write_user_frame(frame).await?;
        Ok(PongWaiter {
            rx,
            shared: shared.clone(),
        })
    }

    /// Sends an unsolicited pong.
    ///
    /// # Errors
    /// [`ConnectionError::Closed`] if the connection is not open.
    pub async fn pong(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        shared.ensure_open().await?;
        let frame = WebsocketFrame::new(true, Opcode::Pong, data);
        frame.check()?;
        shared.write_user_frame(frame).await
    }

    /// Performs the closing handshake and waits until the transport is closed.
    ///
    /// Calling it again, or on a closed connection, does nothing. The
    /// handshake runs on its own task and completes even if the returned
    /// future is dropped.
    ///
    /// # Errors
    /// [`ConnectionError::Codec`] when `code` may not be sent or `reason` is
    /// longer than 123 bytes.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ConnectionError> {
        let data = codec::serialize_close(code, reason)?;
        WebsocketFrame::new(true, Opcode::ConnectionClose, data.clone()).check()?;
        let shared = self.shared.clone();
        let span = shared.span.clone();
        let handshake = tokio::spawn(shared.close_handshake(data).instrument(span));
        if let Err(e) = handshake.await {
            tracing::error!(error = %e, "closing handshake task failed");
        }
        Ok(())
    }

    /// Resolves once the connection is closed.
    pub async fn wait_closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

/// Resolves when the pong for a ping arrives, with the measured latency.
#[must_use = "a ping waiter does nothing unless awaited"]
pub struct PongWaiter {
    rx: oneshot::Receiver<Duration>,
    shared: Arc<Shared>,
}

impl fmt::Debug for PongWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PongWaiter").finish_non_exhaustive()
    }
}

impl Future for PongWaiter {
    type Output = Result<Duration, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(latency)) => Poll::Ready(Ok(latency)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(self.shared.closed_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Shared {
    fn state(&self) -> State {
        self.inner.lock().state
    }

    fn closed_error(&self) -> ConnectionError {
        let inner = self.inner.lock();
        let (code, reason) = inner
            .close_rcvd
            .clone()
            .unwrap_or_else(|| (1006, String::new()));
        ConnectionError::Closed {
            code,
            reason,
            cause: inner.cause.clone(),
        }
    }

    /// Fails unless the connection is open; waits for the teardown to finish
    /// before reporting a closure.
    async fn ensure_open(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        match state {
            State::Open if !self.transfer_done.is_cancelled() => Ok(()),
            State::Connecting => Err(ConnectionError::InvalidState(
                "WebSocket connection isn't established yet",
            )),
            State::Open | State::Closing | State::Closed => {
                self.closed.cancelled().await;
                Err(self.closed_error())
            }
        }
    }

    /// Encodes and queues a frame while holding the write turn, then drains.
    async fn write_frame(
        self: &Arc<Self>,
        frame: WebsocketFrame,
        expected: State,
    ) -> Result<(), ConnectionError> {
        {
            let mut codec = self.codec.lock().await;
            let state = self.state();
            if state != expected {
                return Err(state.invalid_write());
            }
            tracing::trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "write frame");
            let bytes = codec.encode_to_bytes(frame)?;
            self.writer.write(&bytes);
        }
        if let Err(e) = self.writer.drain().await {
            tracing::debug!(error = %e, "write failed");
            self.fail_connection(1006, "");
            return Err(e.into());
        }
        Ok(())
    }

    /// Like `write_frame`, but surfaces transport failures as the closure they cause.
    async fn write_user_frame(self: &Arc<Self>, frame: WebsocketFrame) -> Result<(), ConnectionError> {
        match self.write_frame(frame, State::Open).await {
            Err(ConnectionError::Io(_) | ConnectionError::InvalidState(_)) => {
                self.closed.cancelled().await;
                Err(self.closed_error())
            }
            other => other,
        }
    }

    async fn write_close_frame(self: &Arc<Self>, data: Bytes) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != State::Open {
                return Ok(());
            }
            inner.state = State::Closing;
        }
        tracing::debug!("state OPEN -> CLOSING");
        self.write_frame(
            WebsocketFrame::new(true, Opcode::ConnectionClose, data),
            State::Closing,
        )
        .await
    }

    fn fail_connection(self: &Arc<Self>, code: u16, reason: &str) {
        let _span = self.span.enter();
        tracing::debug!(code, reason, "failing connection");
        let mut inner = self.inner.lock();
        match &inner.transfer {
            Some(transfer) => transfer.abort(),
            None => self.transfer_done.cancel(),
        }

        if inner.state == State::Open && code != 1006 {
            inner.state = State::Closing;
            tracing::debug!("state OPEN -> CLOSING");
            // Best effort: the supervisor flushes whatever is queued.
            let encoded = codec::serialize_close(code, reason).and_then(|data| {
                let frame = WebsocketFrame::new(true, Opcode::ConnectionClose, data);
                match self.codec.try_lock() {
                    Ok(mut codec) => codec.encode_to_bytes(frame),
                    Err(_) => WebsocketCodec::new(self.role).encode_to_bytes(frame),
                }
            });
            match encoded {
                Ok(bytes) => self.writer.write(&bytes),
                Err(e) => tracing::warn!(error = %e, "could not encode close frame"),
            }
        }

        if !inner.supervising {
            inner.supervising = true;
            tokio::spawn(close_connection(self.clone()).instrument(self.span.clone()));
        }
    }

    async fn close_handshake(self: Arc<Self>, data: Bytes) {
        let timeout = self.config.close_timeout;
        if self.state() == State::Connecting {
            self.fail_connection(1006, "");
        } else if tokio::time::timeout(timeout, self.write_close_frame(data))
            .await
            .is_err()
        {
            self.fail_connection(1006, "");
        }
        if tokio::time::timeout(timeout, self.transfer_done.cancelled())
            .await
            .is_err()
        {
            self.fail_connection(1006, "");
        }
        self.closed.cancelled().await;
    }

    async fn read_message(
        self: &Arc<Self>,
        extensions: &[Arc<dyn Extension>],
    ) -> Result<Option<WebsocketMessage>, WebsocketCodecError> {
        let max_size = self.config.max_size;
        let Some(frame) = self.read_data_frame(max_size, extensions).await? else {
            return Ok(None);
        };
        let text = match frame.opcode {
            Opcode::TextFrame => true,
            Opcode::BinaryFrame => false,
            _ => return Err(WebsocketCodecError::protocol("unexpected opcode")),
        };

        if frame.fin {
            return Ok(Some(if text {
                let text = std::str::from_utf8(&frame.payload)
                    .map_err(|_| WebsocketCodecError::InvalidUtf8)?;
                WebsocketMessage::Text(text.to_owned())
            } else {
                WebsocketMessage::Binary(frame.payload)
            }));
        }

        let mut budget = max_size.map(|max| max.saturating_sub(frame.payload.len()));
        let mut decoder = Utf8Decoder::default();
        let mut binary = BytesMut::new();
        let mut push = |payload: &[u8]| -> Result<(), WebsocketCodecError> {
            if text {
                decoder.push(payload)
            } else {
                binary.extend_from_slice(payload);
                Ok(())
            }
        };
        push(&frame.payload)?;
        loop {
            let Some(frame) = self.read_data_frame(budget, extensions).await? else {
                return Err(WebsocketCodecError::protocol("incomplete fragmented message"));
            };
            if frame.opcode != Opcode::ContinuationFrame {
                return Err(WebsocketCodecError::protocol("unexpected opcode"));
            }
            budget = budget.map(|left| left.saturating_sub(frame.payload.len()));
            push(&frame.payload)?;
            if frame.fin {
                break;
            }
        }
        Ok(Some(if text {
            WebsocketMessage::Text(decoder.finish()?)
        } else {
            WebsocketMessage::Binary(binary.freeze())
        }))
    }

    /// Reads frames until a data frame comes, handling control frames on the way.
    /// `None` means a close frame was received.
    async fn read_data_frame(
        self: &Arc<Self>,
        max_size: Option<usize>,
        extensions: &[Arc<dyn Extension>],
    ) -> Result<Option<WebsocketFrame>, WebsocketCodecError> {
        let masked = self.role == EndpointType::Server;
        loop {
            let frame = codec::read_frame(&self.reader, masked, max_size, extensions).await?;
            tracing::trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "read frame");
            match frame.opcode {
                Opcode::ConnectionClose => {
                    let (code, reason) = codec::parse_close(&frame.payload)?;
                    tracing::debug!(code, reason = %reason, "received close frame");
                    self.inner.lock().close_rcvd = Some((code, reason));
                    if let Err(e) = self.write_close_frame(frame.payload).await {
                        tracing::debug!(error = %e, "could not echo close frame");
                    }
                    return Ok(None);
                }
                Opcode::Ping => {
                    let pong = WebsocketFrame::new(true, Opcode::Pong, frame.payload);
                    if let Err(e) = self.write_frame(pong, State::Open).await {
                        tracing::debug!(error = %e, "could not answer ping");
                    }
                }
                Opcode::Pong => {
                    let resolved = self.inner.lock().pings.acknowledge(&frame.payload);
                    if resolved == 0 {
                        tracing::debug!("unsolicited pong");
                    }
                }
                _ => return Ok(Some(frame)),
            }
        }
    }
}

async fn transfer_data(
    shared: Arc<Shared>,
    sender: mpsc::Sender<WebsocketMessage>,
    extensions: Vec<Arc<dyn Extension>>,
) {
    let _done = shared.transfer_done.clone().drop_guard();
    loop {
        match shared.read_message(&extensions).await {
            Ok(Some(message)) => {
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let code = e.close_code();
                match code {
                    1006 => tracing::debug!(error = %e, "connection lost"),
                    1011 => tracing::error!(error = %e, "unexpected error while reading"),
                    _ => tracing::debug!(error = %e, code, "protocol error"),
                }
                shared.inner.lock().cause = Some(Arc::new(e));
                shared.fail_connection(code, "");
                break;
            }
        }
    }
}

/// Tears the transport down once the transfer task is over.
///
/// A client gives the server a chance to close the TCP connection first;
/// a server half-closes right away. Each wait is bounded by `close_timeout`.
async fn close_connection(shared: Arc<Shared>) {
    let timeout = shared.config.close_timeout;
    shared.transfer_done.cancelled().await;
    shared.inner.lock().pings.cancel_all();

    let writer = &shared.writer;
    let _ = tokio::time::timeout(timeout, writer.drain()).await;

    let wait_lost = move || async move { tokio::time::timeout(timeout, writer.wait_lost()).await.is_ok() };
    let mut lost = false;
    if shared.role == EndpointType::Client {
        lost = wait_lost().await;
    }
    if !lost && writer.can_write_eof() {
        let _ = tokio::time::timeout(timeout, writer.write_eof()).await;
        lost = wait_lost().await;
    }
    if !lost {
        tracing::debug!("peer did not close the connection in time");
    }
    if tokio::time::timeout(timeout, writer.close()).await.is_err() {
        tracing::warn!("closing the transport timed out, aborting");
        writer.abort();
    }

    {
        let mut inner = shared.inner.lock();
        inner.state = State::Closed;
        inner.sender = None;
        inner.transfer = None;
        let code = inner.close_rcvd.as_ref().map_or(1006, |(code, _)| *code);
        tracing::debug!(code, "connection closed");
    }
    shared.closed.cancel();
}

async fn keepalive(shared: Arc<Shared>) {
    let Some(interval) = shared.config.ping_interval else {
        return;
    };
    let connection = Connection {
        shared: shared.clone(),
    };
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = shared.transfer_done.cancelled() => return,
        }
        let mut data = [0u8; 4];
        rand::rng().fill_bytes(&mut data);
        let Ok(waiter) = connection.ping(Bytes::copy_from_slice(&data)).await else {
            return;
        };
        let Some(ping_timeout) = shared.config.ping_timeout else {
            continue;
        };
        match tokio::time::timeout(ping_timeout, waiter).await {
            Ok(Ok(latency)) => tracing::trace!(?latency, "keepalive pong"),
            Ok(Err(_)) => return,
            Err(_) => {
                tracing::warn!("keepalive ping timeout");
                shared.fail_connection(1011, "keepalive ping timeout");
                return;
            }
        }
    }
}

/// Accumulates text split over several frames, where a frame boundary may
/// fall inside a UTF-8 sequence.
#[derive(Default)]
struct Utf8Decoder {
    text: String,
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, chunk: &[u8]) -> Result<(), WebsocketCodecError> {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);
        match std::str::from_utf8(&input) {
            Ok(valid) => self.text.push_str(valid),
            Err(e) if e.error_len().is_none() => {
                let (valid, rest) = input.split_at(e.valid_up_to());
                let valid =
                    std::str::from_utf8(valid).map_err(|_| WebsocketCodecError::InvalidUtf8)?;
                self.text.push_str(valid);
                self.pending = rest.to_vec();
            }
            Err(_) => return Err(WebsocketCodecError::InvalidUtf8),
        }
        Ok(())
    }

    fn finish(self) -> Result<String, WebsocketCodecError> {
        if self.pending.is_empty() {
            Ok(self.text)
        } else {
            Err(WebsocketCodecError::InvalidUtf8)
        }
    }
}

// WebSocket close reason codes as defined in RFC 6455 §7.4.1
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 1000: Normal closure
    NormalClosure = 1000,
    /// 1001: Endpoint is going away
    GoingAway = 1001,
    /// 1002: Protocol error
    ProtocolError = 1002,
    /// 1003: Unsupported data
    UnsupportedData = 1003,
    /// 1005: No status received (reserved, not to be sent)
    NoStatusReceived = 1005,
    /// 1006: Abnormal closure (reserved, not to be sent)
    AbnormalClosure = 1006,
    /// 1007: Invalid payload data
    InvalidPayloadData = 1007,
    /// 1008: Policy violation
    PolicyViolation = 1008,
    /// 1009: Message too big
    MessageTooBig = 1009,
    /// 1010: Mandatory extension (client only)
    MandatoryExtension = 1010,
    /// 1011: Internal server error
    InternalServerError = 1011,
    /// 1012: Service restart
    ServiceRestart = 1012,
    /// 1013: Try again later
    TryAgainLater = 1013,
    /// 1014: Bad gateway
    BadGateway = 1014,
    /// 1015: TLS handshake failure (reserved, not to be sent)
    TlsHandshake = 1015,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::NormalClosure => write!(f, "Normal closure"),
            CloseReason::GoingAway => write!(f, "Endpoint is going away"),
            CloseReason::ProtocolError => write!(f, "Protocol error"),
            CloseReason::UnsupportedData => write!(f, "Unsupported data"),
            CloseReason::NoStatusReceived => write!(f, "No status received"),
            CloseReason::AbnormalClosure => write!(f, "Abnormal closure"),
            CloseReason::InvalidPayloadData => write!(f, "Invalid payload data"),
            CloseReason::PolicyViolation => write!(f, "Policy violation"),
            CloseReason::MessageTooBig => write!(f, "Message too big"),
            CloseReason::MandatoryExtension => write!(f, "Mandatory extension"),
            CloseReason::InternalServerError => write!(f, "Internal server error"),
            CloseReason::ServiceRestart => write!(f, "Service restart"),
            CloseReason::TryAgainLater => write!(f, "Try again later"),
            CloseReason::BadGateway => write!(f, "Bad gateway"),
            CloseReason::TlsHandshake => write!(f, "TLS handshake failure"),
        }
    }
}

impl TryFrom<u16> for CloseReason {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1000 => Ok(CloseReason::NormalClosure),
            1001 => Ok(CloseReason::GoingAway),
            1002 => Ok(CloseReason::ProtocolError),
            1003 => Ok(CloseReason::UnsupportedData),
            1005 => Ok(CloseReason::NoStatusReceived),
            1006 => Ok(CloseReason::AbnormalClosure),
            1007 => Ok(CloseReason::InvalidPayloadData),
            1008 => Ok(CloseReason::PolicyViolation),
            1009 => Ok(CloseReason::MessageTooBig),
            1010 => Ok(CloseReason::MandatoryExtension),
            1011 => Ok(CloseReason::InternalServerError),
            1012 => Ok(CloseReason::ServiceRestart),
            1013 => Ok(CloseReason::TryAgainLater),
            1014 => Ok(CloseReason::BadGateway),
            1015 => Ok(CloseReason::TlsHandshake),
            _ => Err(()),
        }
    }
}

impl From<CloseReason> for u16 {
    fn from(value: CloseReason) -> Self {
        value as u16
    }
}

/// Human-readable description of a close code and reason.
#[must_use]
pub fn format_close(code: u16, reason: &str) -> String {
    let explanation = match CloseReason::try_from(code) {
        Ok(known) => known.to_string(),
        Err(()) if (3000..4000).contains(&code) => "registered".to_owned(),
        Err(()) if (4000..5000).contains(&code) => "private use".to_owned(),
        Err(()) => "unknown".to_owned(),
    };
    if reason.is_empty() {
        format!("code = {code} ({explanation}), no reason")
    } else {
        format!("code = {code} ({explanation}), reason = {reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_resolves_older_pings_in_order() {
        let mut pings = PendingPings::default();
        let mut p1 = pings.register(Bytes::from_static(b"p1")).unwrap();
        let mut p2 = pings.register(Bytes::from_static(b"p2")).unwrap();
        let mut p3 = pings.register(Bytes::from_static(b"p3")).unwrap();
        assert!(pings.register(Bytes::from_static(b"p3")).is_none());

        assert_eq!(pings.acknowledge(b"p2"), 2);
        assert!(p1.try_recv().is_ok());
        assert!(p2.try_recv().is_ok());
        assert!(matches!(
            p3.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        assert_eq!(pings.acknowledge(b"nope"), 0);
        pings.cancel_all();
        assert!(matches!(
            p3.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn utf8_split_across_fragments() {
        let snowman = "\u{2603}".as_bytes();
        let mut decoder = Utf8Decoder::default();
        decoder.push(b"a").unwrap();
        decoder.push(&snowman[..1]).unwrap();
        decoder.push(&snowman[1..]).unwrap();
        assert_eq!(decoder.finish().unwrap(), "a\u{2603}");

        let mut truncated = Utf8Decoder::default();
        truncated.push(&snowman[..2]).unwrap();
        assert!(truncated.finish().is_err());

        let mut invalid = Utf8Decoder::default();
        assert!(invalid.push(b"\xff").is_err());
    }

    #[test]
    fn close_descriptions() {
        assert_eq!(format_close(1000, ""), "code = 1000 (Normal closure), no reason");
        assert_eq!(format_close(4001, "bye"), "code = 4001 (private use), reason = bye");
        assert_eq!(format_close(3000, ""), "code = 3000 (registered), no reason");
    }
}
