//! Byte-stream plumbing between a raw transport and the protocol engine.

mod reader;
mod writer;

pub use reader::{MAX_CHUNKS, StreamReader};
pub use writer::StreamWriter;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio_util::bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use crate::errors::StreamError;

const READ_CHUNK: usize = 64 * 1024;

// Trait alias for the boxed stream type carried by a transport
pub trait WebSocketStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> WebSocketStream for T {}

pub(crate) type BoxedStream = Box<dyn WebSocketStream + Send>;

/// A transport split into a fed reader and a buffered writer.
pub struct Transport {
    pub reader: StreamReader,
    pub writer: StreamWriter,
}

impl Transport {
    /// Splits `stream` and spawns the task feeding the reader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: WebSocketStream + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(Box::new(stream) as BoxedStream);
        let reader = StreamReader::new();
        let lost = CancellationToken::new();
        tokio::spawn(pump(read_half, reader.clone(), lost.clone()));
        let writer = StreamWriter::new(write_half, lost);
        Self { reader, writer }
    }
}

async fn pump(mut source: ReadHalf<BoxedStream>, reader: StreamReader, lost: CancellationToken) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        tokio::select! {
            () = reader.wait_resumed() => {}
            () = lost.cancelled() => break,
        }
        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            read = source.read_buf(&mut buf) => read,
            () = lost.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => reader.feed_data(buf.split().freeze()),
            Err(e) => {
                tracing::debug!(error = %e, "transport read failed");
                reader.set_exception(StreamError::Io(e));
                break;
            }
        }
    }
    reader.feed_eof();
    lost.cancel();
}
