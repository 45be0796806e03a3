//! Incremental buffer over inbound bytes.
//!
//! Chunks are queued in arrival order and sliced out without copying unless a
//! read spans several chunks. A pump task feeds the buffer; readers suspend
//! until enough bytes, end of stream, or a stored exception is available.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::bytes::{Bytes, BytesMut};

use crate::errors::StreamError;
use crate::http11::{
    Headers, MAX_HEADERS, MAX_LINE, RawRequestMessage, RawResponseMessage, latin1, parse_version,
};

/// Queued chunk count above which the transport is asked to stop reading.
pub const MAX_CHUNKS: usize = 32;

/// Headers tried by the single-chunk fast path before falling back to lines.
const FAST_PATH_HEADERS: usize = 64;

/// Buffered, incrementally fed reader. Cloning yields another handle on the
/// same buffer, which is how the transport pump feeds it.
#[derive(Clone, Default)]
pub struct StreamReader {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    buffer: Mutex<Buffer>,
    data_ready: Notify,
    resumed: Notify,
}

#[derive(Default)]
struct Buffer {
    chunks: VecDeque<Bytes>,
    offset: usize,
    len: usize,
    eof: bool,
    exception: Option<StreamError>,
    paused: bool,
}

impl Buffer {
    fn take(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.len);
        if n == 0 {
            return Bytes::new();
        }
        self.len -= n;
        let head_left = self.chunks[0].len() - self.offset;
        if head_left >= n {
            let out = self.chunks[0].slice(self.offset..self.offset + n);
            self.advance_head(n);
            return out;
        }
        let mut out = BytesMut::with_capacity(n);
        let mut needed = n;
        while needed > 0 {
            let head = &self.chunks[0];
            let available = head.len() - self.offset;
            let step = available.min(needed);
            out.extend_from_slice(&head[self.offset..self.offset + step]);
            self.advance_head(step);
            needed -= step;
        }
        out.freeze()
    }

    fn advance_head(&mut self, n: usize) {
        self.offset += n;
        if self.offset == self.chunks[0].len() {
            self.chunks.pop_front();
            self.offset = 0;
        }
    }

    /// Position just past the first `\n`, counted from the read cursor.
    fn find_newline(&self) -> Option<usize> {
        let mut seen = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let start = if i == 0 { self.offset } else { 0 };
            if let Some(pos) = chunk[start..].iter().position(|&b| b == b'\n') {
                return Some(seen + pos + 1);
            }
            seen += chunk.len() - start;
        }
        None
    }

    fn head_slice(&self) -> Option<&[u8]> {
        self.chunks.front().map(|chunk| &chunk[self.offset..])
    }
}

impl StreamReader {
    /// A new, empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk, pausing the transport when too many chunks are queued.
    pub fn feed_data(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut buffer = self.shared.buffer.lock();
        buffer.len += chunk.len();
        buffer.chunks.push_back(chunk);
        if buffer.chunks.len() > MAX_CHUNKS && !buffer.paused {
            tracing::trace!(chunks = buffer.chunks.len(), "pausing transport reads");
            buffer.paused = true;
        }
        drop(buffer);
        self.shared.data_ready.notify_waiters();
    }

    /// Marks the end of the stream and wakes pending readers.
    pub fn feed_eof(&self) {
        self.shared.buffer.lock().eof = true;
        self.shared.data_ready.notify_waiters();
    }

    /// Stores an exception raised by every current and future read.
    pub fn set_exception(&self, error: StreamError) {
        self.shared.buffer.lock().exception = Some(error);
        self.shared.data_ready.notify_waiters();
    }

    /// Whether the transport was asked to stop reading.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.buffer.lock().paused
    }

    /// Whether the stream ended and every buffered byte was consumed.
    #[must_use]
    pub fn at_eof(&self) -> bool {
        let buffer = self.shared.buffer.lock();
        buffer.eof && buffer.len == 0
    }

    /// Number of buffered, unread bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.buffer.lock().len
    }

    /// Suspends the transport pump while reading is paused.
    pub(crate) async fn wait_resumed(&self) {
        loop {
            let resumed = self.shared.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if !self.shared.buffer.lock().paused {
                return;
            }
            resumed.await;
        }
    }

    fn maybe_resume(&self, buffer: &mut Buffer) {
        if buffer.paused && buffer.chunks.len() <= MAX_CHUNKS {
            tracing::trace!("resuming transport reads");
            buffer.paused = false;
            self.shared.resumed.notify_waiters();
        }
    }

    /// Runs `attempt` against the buffer until it yields a result, suspending
    /// between attempts until new data, end of stream or an exception arrives.
    async fn wait_for<T>(
        &self,
        mut attempt: impl FnMut(&mut Buffer) -> Option<Result<T, StreamError>>,
    ) -> Result<T, StreamError> {
        loop {
            let data_ready = self.shared.data_ready.notified();
            tokio::pin!(data_ready);
            data_ready.as_mut().enable();
            {
                let mut buffer = self.shared.buffer.lock();
                if let Some(error) = &buffer.exception {
                    return Err(error.clone());
                }
                if let Some(result) = attempt(&mut *buffer) {
                    self.maybe_resume(&mut *buffer);
                    return result;
                }
                if buffer.paused {
                    buffer.paused = false;
                    self.shared.resumed.notify_waiters();
                }
            }
            data_ready.await;
        }
    }

    /// Reads exactly `n` bytes.
    ///
    /// # Errors
    /// [`StreamError::UnexpectedEof`] carrying the partial data when the
    /// stream ends first, or the stored stream exception.
    pub async fn read_exactly(&self, n: usize) -> Result<Bytes, StreamError> {
        self.wait_for(|buffer| {
            if buffer.len >= n {
                Some(Ok(buffer.take(n)))
            } else if buffer.eof {
                let len = buffer.len;
                let partial = buffer.take(len);
                Some(Err(StreamError::UnexpectedEof {
                    partial,
                    expected: n,
                }))
            } else {
                None
            }
        })
        .await
    }

    /// Reads one line, returning it without its `\r\n` terminator.
    ///
    /// # Errors
    /// [`StreamError::LineTooLong`] beyond [`MAX_LINE`] bytes,
    /// [`StreamError::Payload`] for a line not ending in `\r\n`,
    /// [`StreamError::UnexpectedEof`] when the stream ends mid-line.
    pub async fn read_line(&self) -> Result<Bytes, StreamError> {
        let line = self
            .wait_for(|buffer| match buffer.find_newline() {
                Some(end) if end > MAX_LINE + 2 => Some(Err(StreamError::LineTooLong(MAX_LINE))),
                Some(end) => Some(Ok(buffer.take(end))),
                None if buffer.len > MAX_LINE + 2 => {
                    Some(Err(StreamError::LineTooLong(MAX_LINE)))
                }
                None if buffer.eof => {
                    let len = buffer.len;
                    let partial = buffer.take(len);
                    let expected = partial.len() + 2;
                    Some(Err(StreamError::UnexpectedEof { partial, expected }))
                }
                None => None,
            })
            .await?;
        match line.strip_suffix(b"\r\n") {
            Some(stripped) => Ok(line.slice_ref(stripped)),
            None => Err(StreamError::Payload("line without CRLF".to_owned())),
        }
    }

    /// Reads and parses an HTTP request line and headers.
    ///
    /// # Errors
    /// Any [`StreamError`] raised while reading, or [`StreamError::Payload`]
    /// for a malformed head.
    pub async fn read_http_request_head(&self) -> Result<RawRequestMessage, StreamError> {
        if let Some(request) = self.try_fast_request() {
            return Ok(request);
        }
        let line = self.read_line().await?;
        let mut parts = line.splitn(3, |&b| b == b' ');
        let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid_line("request line", &line));
        };
        let version = parse_version(&latin1(version))
            .ok_or_else(|| invalid_line("protocol version", version))?;
        let headers = self.read_headers().await?;
        Ok(RawRequestMessage {
            method: latin1(method),
            path: latin1(path),
            version,
            headers,
        })
    }

    /// Reads and parses an HTTP status line and headers.
    ///
    /// # Errors
    /// Any [`StreamError`] raised while reading, or [`StreamError::Payload`]
    /// for a malformed head.
    pub async fn read_http_response_head(&self) -> Result<RawResponseMessage, StreamError> {
        if let Some(response) = self.try_fast_response() {
            return Ok(response);
        }
        let line = self.read_line().await?;
        let mut parts = line.splitn(3, |&b| b == b' ');
        let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
            return Err(invalid_line("status line", &line));
        };
        let reason = parts.next().map(latin1).unwrap_or_default();
        let version = parse_version(&latin1(version))
            .ok_or_else(|| invalid_line("protocol version", version))?;
        let status = std::str::from_utf8(status)
            .ok()
            .filter(|s| s.len() == 3)
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|code| (100..600).contains(code))
            .ok_or_else(|| invalid_line("status code", status))?;
        let headers = self.read_headers().await?;
        Ok(RawResponseMessage {
            version,
            status,
            reason,
            headers,
        })
    }

    async fn read_headers(&self) -> Result<Headers, StreamError> {
        let mut headers = Headers::new();
        for _ in 0..=MAX_HEADERS {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            if line[0] == b' ' || line[0] == b'\t' {
                let Some(value) = headers.last_mut() else {
                    return Err(invalid_line("header line", &line));
                };
                value.push(' ');
                value.push_str(latin1(&line).trim_matches([' ', '\t']));
                continue;
            }
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                return Err(invalid_line("header line", &line));
            };
            let name = &line[..colon];
            if name.is_empty() || name.iter().any(|b| !is_token_byte(*b)) {
                return Err(invalid_line("header name", name));
            }
            let value = latin1(&line[colon + 1..]);
            headers.insert(latin1(name), value.trim_matches([' ', '\t']));
        }
        Err(StreamError::TooManyHeaders)
    }

    fn try_fast_request(&self) -> Option<RawRequestMessage> {
        let mut buffer = self.shared.buffer.lock();
        let mut slots = [httparse::EMPTY_HEADER; FAST_PATH_HEADERS];
        let mut request = httparse::Request::new(&mut slots);
        let httparse::Status::Complete(consumed) = request.parse(buffer.head_slice()?).ok()?
        else {
            return None;
        };
        let parsed = RawRequestMessage {
            method: request.method?.to_owned(),
            path: request.path?.to_owned(),
            version: fast_version(request.version?)?,
            headers: fast_headers(request.headers),
        };
        buffer.take(consumed);
        self.maybe_resume(&mut *buffer);
        Some(parsed)
    }

    fn try_fast_response(&self) -> Option<RawResponseMessage> {
        let mut buffer = self.shared.buffer.lock();
        let mut slots = [httparse::EMPTY_HEADER; FAST_PATH_HEADERS];
        let mut response = httparse::Response::new(&mut slots);
        let httparse::Status::Complete(consumed) = response.parse(buffer.head_slice()?).ok()?
        else {
            return None;
        };
        let parsed = RawResponseMessage {
            version: fast_version(response.version?)?,
            status: response.code?,
            reason: response.reason.unwrap_or_default().to_owned(),
            headers: fast_headers(response.headers),
        };
        buffer.take(consumed);
        self.maybe_resume(&mut *buffer);
        Some(parsed)
    }
}

fn fast_version(minor: u8) -> Option<http::Version> {
    match minor {
        1 => Some(http::Version::HTTP_11),
        0 => Some(http::Version::HTTP_10),
        _ => None,
    }
}

fn fast_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    parsed
        .iter()
        .map(|header| (header.name.to_owned(), latin1(header.value)))
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn invalid_line(what: &str, raw: &[u8]) -> StreamError {
    StreamError::Payload(format!("invalid HTTP {what}: {}", latin1(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(chunks: &[&[u8]]) -> StreamReader {
        let reader = StreamReader::new();
        for chunk in chunks {
            reader.feed_data(Bytes::copy_from_slice(chunk));
        }
        reader
    }

    #[tokio::test]
    async fn read_exactly_spans_chunks() {
        let reader = fed(&[b"ab", b"cde", b"f"]);
        assert_eq!(reader.read_exactly(1).await.unwrap(), &b"a"[..]);
        assert_eq!(reader.read_exactly(4).await.unwrap(), &b"bcde"[..]);
        assert_eq!(reader.buffered(), 1);
    }

    #[tokio::test]
    async fn read_exactly_reports_partial_data_on_eof() {
        let reader = fed(&[b"xyz"]);
        reader.feed_eof();
        match reader.read_exactly(5).await {
            Err(StreamError::UnexpectedEof { partial, expected }) => {
                assert_eq!(partial, &b"xyz"[..]);
                assert_eq!(expected, 5);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_waits_for_later_data() {
        let reader = StreamReader::new();
        let feeder = reader.clone();
        let pending = tokio::spawn(async move { reader.read_exactly(3).await });
        tokio::task::yield_now().await;
        feeder.feed_data(Bytes::from_static(b"12"));
        tokio::task::yield_now().await;
        feeder.feed_data(Bytes::from_static(b"34"));
        assert_eq!(pending.await.unwrap().unwrap(), &b"123"[..]);
        assert_eq!(feeder.buffered(), 1);
    }

    #[tokio::test]
    async fn exception_is_raised_on_every_read() {
        let reader = fed(&[b"data"]);
        reader.set_exception(StreamError::Payload("broken".to_owned()));
        assert!(matches!(reader.read_exactly(1).await, Err(StreamError::Payload(_))));
        assert!(matches!(reader.read_line().await, Err(StreamError::Payload(_))));
    }

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let reader = fed(&[b"hello\r", b"\nworld\r\n"]);
        assert_eq!(reader.read_line().await.unwrap(), &b"hello"[..]);
        assert_eq!(reader.read_line().await.unwrap(), &b"world"[..]);
    }

    #[tokio::test]
    async fn read_line_rejects_bare_newline() {
        let reader = fed(&[b"hello\n"]);
        assert!(matches!(reader.read_line().await, Err(StreamError::Payload(_))));
    }

    #[tokio::test]
    async fn read_line_enforces_limit() {
        let reader = fed(&[&vec![b'a'; MAX_LINE + 10][..]]);
        assert!(matches!(
            reader.read_line().await,
            Err(StreamError::LineTooLong(MAX_LINE))
        ));
    }

    #[test]
    fn too_many_chunks_pause_transport() {
        let reader = StreamReader::new();
        for _ in 0..=MAX_CHUNKS {
            reader.feed_data(Bytes::from_static(b"x"));
        }
        assert!(reader.is_paused());
    }

    #[tokio::test]
    async fn consuming_resumes_transport() {
        let reader = StreamReader::new();
        for _ in 0..=MAX_CHUNKS {
            reader.feed_data(Bytes::from_static(b"x"));
        }
        reader.read_exactly(2).await.unwrap();
        assert!(!reader.is_paused());
    }

    #[tokio::test]
    async fn folded_header_is_joined_with_space() {
        let reader = fed(&[b"GET /chat HTTP/1.1\r\nX-Foo: a\r\n\tb\r\n\r\n"]);
        let request = reader.read_http_request_head().await.unwrap();
        assert_eq!(request.path, "/chat");
        assert_eq!(request.headers.get("x-foo"), Some("a b"));
    }

    #[tokio::test]
    async fn fast_path_leaves_trailing_bytes_buffered() {
        let reader = fed(&[b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x00"]);
        let response = reader.read_http_response_head().await.unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(response.reason, "Switching Protocols");
        assert_eq!(response.headers.get("upgrade"), Some("websocket"));
        assert_eq!(reader.read_exactly(2).await.unwrap(), &b"\x81\x00"[..]);
    }

    #[tokio::test]
    async fn slow_path_handles_split_head() {
        let reader = fed(&[b"HTTP/1.1 404 Not", b" Found\r\nServer: x\r\n", b"\r\n"]);
        let response = reader.read_http_response_head().await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.reason, "Not Found");
        assert_eq!(response.headers.get("server"), Some("x"));
    }

    #[tokio::test]
    async fn non_utf8_header_values_are_kept() {
        let reader = fed(&[b"GET / HTTP/1.1\r\nX-Bin: caf\xe9\r\n\r\n"]);
        let request = reader.read_http_request_head().await.unwrap();
        assert_eq!(request.headers.get("X-Bin"), Some("caf\u{e9}"));
    }

    #[tokio::test]
    async fn invalid_status_code_is_rejected() {
        let reader = fed(&[b"HTTP/1.1 1x1 Nope\r\n", b"\r\n"]);
        assert!(matches!(
            reader.read_http_response_head().await,
            Err(StreamError::Payload(_))
        ));
    }
}
