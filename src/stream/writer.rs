//! Outbound byte sink wrapping the write half of a transport.
//!
//! Writes only append to an in-memory buffer and never suspend; `drain`
//! pushes the buffer to the transport.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio_util::bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use super::BoxedStream;
use crate::http11::{Headers, serialize_request, serialize_response};

/// Buffered writer owning the write half of a transport.
pub struct StreamWriter {
    sink: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    buffer: Mutex<BytesMut>,
    closing: AtomicBool,
    lost: CancellationToken,
}

fn connection_lost() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection lost")
}

impl StreamWriter {
    pub(crate) fn new(sink: WriteHalf<BoxedStream>, lost: CancellationToken) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(Some(sink)),
            buffer: Mutex::new(BytesMut::new()),
            closing: AtomicBool::new(false),
            lost,
        }
    }

    /// Queues raw bytes. Bytes written once the transport is closing are dropped.
    pub fn write(&self, data: &[u8]) {
        if self.is_closing() {
            tracing::debug!(len = data.len(), "dropping write on closing transport");
            return;
        }
        self.buffer.lock().extend_from_slice(data);
    }

    /// Queues an HTTP request line and headers.
    pub fn write_request(&self, path: &str, headers: &Headers) {
        self.write(&serialize_request(path, headers));
    }

    /// Queues an HTTP status line, headers and optional body.
    pub fn write_response(&self, status: StatusCode, headers: &Headers, body: &[u8]) {
        self.write(&serialize_response(status, headers, body));
    }

    /// Whether `close` or `abort` was called, or the connection was lost.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.lost.is_cancelled()
    }

    /// Whether the transport supports half-closing its write side.
    #[must_use]
    pub fn can_write_eof(&self) -> bool {
        true
    }

    /// Whether the connection is gone, for whatever reason.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the connection is gone.
    pub async fn wait_lost(&self) {
        self.lost.cancelled().await;
    }

    /// Pushes every buffered byte to the transport.
    ///
    /// On a closing transport nothing more can be written, so this waits for
    /// the connection-lost signal and reports the loss.
    ///
    /// # Errors
    /// Returns the transport's I/O error, or `ConnectionReset` once the
    /// connection is lost.
    pub async fn drain(&self) -> io::Result<()> {
        if self.is_closing() {
            self.lost.cancelled().await;
            return Err(connection_lost());
        }
        let mut sink = self.sink.lock().await;
        let data = self.buffer.lock().split().freeze();
        let Some(stream) = sink.as_mut() else {
            return Err(connection_lost());
        };
        if data.is_empty() {
            return Ok(());
        }
        let result = tokio::select! {
            result = async {
                stream.write_all(&data).await?;
                stream.flush().await
            } => result,
            () = self.lost.cancelled() => Err(connection_lost()),
        };
        if let Err(e) = &result {
            tracing::debug!(error = %e, "write failed, dropping transport");
            *sink = None;
            self.connection_lost();
        }
        result
    }

    /// Flushes the buffer then half-closes the write side.
    ///
    /// # Errors
    /// Returns the transport's I/O error.
    pub async fn write_eof(&self) -> io::Result<()> {
        self.drain().await?;
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(stream) => tokio::select! {
                result = stream.shutdown() => result,
                () = self.lost.cancelled() => Err(connection_lost()),
            },
            None => Err(connection_lost()),
        }
    }

    /// Flushes what is buffered, then closes the transport.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let data = self.buffer.lock().split().freeze();
        let mut sink = self.sink.lock().await;
        if let Some(mut stream) = sink.take() {
            let flushed = tokio::select! {
                result = async {
                    stream.write_all(&data).await?;
                    stream.shutdown().await
                } => result,
                () = self.lost.cancelled() => Ok(()),
            };
            if let Err(e) = flushed {
                tracing::debug!(error = %e, "error while closing transport");
            }
        }
        drop(sink);
        self.connection_lost();
    }

    /// Closes the transport immediately, discarding buffered data.
    pub fn abort(&self) {
        self.closing.store(true, Ordering::Release);
        self.buffer.lock().clear();
        if let Ok(mut sink) = self.sink.try_lock() {
            sink.take();
        }
        self.connection_lost();
    }

    /// Stops the reading pump, which then feeds end-of-stream to the reader.
    fn connection_lost(&self) {
        self.lost.cancel();
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.lost.cancel();
    }
}
