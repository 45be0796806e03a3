//! Error types for the allagan-wsproto crate.

use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;
use tokio_util::bytes::Bytes;

use crate::http11::Headers;

/// Errors produced while reading raw bytes or HTTP heads from a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream ended before the requested number of bytes arrived.
    #[error("stream ends after {} bytes, before end of line or {expected} bytes", .partial.len())]
    UnexpectedEof {
        /// Bytes received before the end of the stream.
        partial: Bytes,
        /// Number of bytes that were requested.
        expected: usize,
    },
    /// A line exceeded the maximum line length.
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
    /// A request line, status line or header line is malformed.
    #[error("{0}")]
    Payload(String),
    /// The HTTP head has more headers than allowed.
    #[error("too many HTTP headers")]
    TooManyHeaders,
    /// An underlying I/O error occurred while reading.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether this error means the peer went away rather than sent garbage.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof { .. } | Self::Io(_))
    }
}

impl Clone for StreamError {
    fn clone(&self) -> Self {
        match self {
            StreamError::UnexpectedEof { partial, expected } => StreamError::UnexpectedEof {
                partial: partial.clone(),
                expected: *expected,
            },
            StreamError::LineTooLong(limit) => StreamError::LineTooLong(*limit),
            StreamError::Payload(msg) => StreamError::Payload(msg.clone()),
            StreamError::TooManyHeaders => StreamError::TooManyHeaders,
            StreamError::Io(e) => StreamError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Errors produced by the WebSocket codec (framing, protocol, IO, etc).
#[derive(Debug, Error)]
pub enum WebsocketCodecError {
    /// The opcode in the WebSocket frame is not recognized.
    #[error("Unknown Opcode {0}")]
    UnknownOpcode(u8),
    /// The WebSocket frame or message is too large.
    #[error("Payload too big: {size} > {max} bytes")]
    PayloadTooLarge {
        /// Size announced or accumulated so far.
        size: u64,
        /// Configured limit.
        max: usize,
    },
    /// The WebSocket protocol was violated in some way.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    /// A text message or close reason is not valid UTF-8.
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// A negotiated extension rejected a frame.
    #[error("Extension failure: {0}")]
    Extension(String),
    /// Reading from the underlying stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl From<std::io::Error> for WebsocketCodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Stream(StreamError::Io(e))
    }
}

impl WebsocketCodecError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// The close code a connection fails with when this error aborts it.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::UnknownOpcode(_) | Self::ProtocolViolation(_) => 1002,
            Self::PayloadTooLarge { .. } => 1009,
            Self::InvalidUtf8 => 1007,
            Self::Stream(e) if e.is_eof() => 1006,
            Self::Stream(_) | Self::Extension(_) => 1011,
        }
    }
}

/// Errors raised while performing the opening handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer did not send a well-formed HTTP message.
    #[error("did not receive a valid HTTP {0}")]
    InvalidMessage(&'static str, #[source] StreamError),
    /// A required header is missing, empty, duplicated or wrong.
    #[error("{}", describe_header(.name, .value.as_deref()))]
    InvalidHeader {
        /// Header name.
        name: String,
        /// Offending value, `None` when the header is missing.
        value: Option<String>,
    },
    /// A header value does not follow the header grammar.
    #[error("invalid {name} header: {error} at {pos} in {header}")]
    InvalidHeaderFormat {
        /// Header name.
        name: String,
        /// What the parser expected.
        error: &'static str,
        /// Full header value.
        header: String,
        /// Byte offset of the failure.
        pos: usize,
    },
    /// A header has a syntactically valid but unacceptable value.
    #[error("invalid {name} header: {value}")]
    InvalidHeaderValue {
        /// Header name.
        name: String,
        /// Offending value.
        value: String,
    },
    /// The `Connection` or `Upgrade` header does not request a WebSocket upgrade.
    #[error("invalid {name} header: {value}")]
    InvalidUpgrade {
        /// Header name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// The `Origin` header is missing or not allowed.
    #[error("invalid Origin header: {}", .0.as_deref().unwrap_or("missing"))]
    InvalidOrigin(Option<String>),
    /// The server answered with a status other than 101.
    #[error("server rejected WebSocket connection: HTTP {status}")]
    InvalidStatus {
        /// Status code received.
        status: u16,
        /// Response headers received.
        headers: Headers,
    },
    /// Extension or subprotocol negotiation failed.
    #[error("{0}")]
    Negotiation(String),
    /// An extension parameter appears more than once.
    #[error("duplicate parameter: {0}")]
    DuplicateParameter(String),
    /// An extension parameter name is not recognized.
    #[error("invalid parameter name: {0}")]
    InvalidParameterName(String),
    /// An extension parameter value is not acceptable.
    #[error("invalid value for parameter {name}: {value}")]
    InvalidParameterValue {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
    },
    /// The handshake was aborted with an explicit HTTP response.
    #[error("HTTP {status}, {} headers, {} bytes", .headers.len(), .body.len())]
    AbortHandshake {
        /// Status to send.
        status: StatusCode,
        /// Headers to send.
        headers: Headers,
        /// Body to send.
        body: Bytes,
    },
    /// The server is shutting down and does not accept new connections.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The provided URI is invalid.
    #[error("Invalid URI: {0}")]
    InvalidUri(&'static str),
    /// The handshake did not complete within the open timeout.
    #[error("timed out during opening handshake")]
    Timeout,
    /// An I/O failure while exchanging the handshake.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

fn describe_header(name: &str, value: Option<&str>) -> String {
    match value {
        None => format!("Missing {name} header"),
        Some("") => format!("Empty {name} header"),
        Some(value) => format!("Invalid {name} header: {value}"),
    }
}

fn describe_close(code: &u16, reason: &str) -> String {
    crate::connection::format_close(*code, reason)
}

impl HandshakeError {
    pub(crate) fn missing(name: &str) -> Self {
        Self::InvalidHeader {
            name: name.to_owned(),
            value: None,
        }
    }

    pub(crate) fn multiple(name: &str) -> Self {
        Self::InvalidHeader {
            name: name.to_owned(),
            value: Some(format!("more than one {name} header found")),
        }
    }

    pub(crate) fn header_value(name: &str, value: &str) -> Self {
        Self::InvalidHeaderValue {
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }

    /// HTTP status a server answers with when the handshake fails with this error.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AbortHandshake { status, .. } => *status,
            Self::InvalidOrigin(_) => StatusCode::FORBIDDEN,
            Self::InvalidUpgrade { .. } => StatusCode::UPGRADE_REQUIRED,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidMessage(..)
            | Self::InvalidHeader { .. }
            | Self::InvalidHeaderFormat { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::InvalidStatus { .. }
            | Self::Negotiation(_)
            | Self::DuplicateParameter(_)
            | Self::InvalidParameterName(_)
            | Self::InvalidParameterValue { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidUri(_) | Self::Timeout | Self::Stream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Errors produced by the WebSocket connection and handshake logic.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The WebSocket connection is closed; carries the close code and reason.
    #[error("{}", describe_close(.code, .reason))]
    Closed {
        /// Close code received from, or assumed for, the peer.
        code: u16,
        /// Close reason received from the peer.
        reason: String,
        /// Failure that brought the connection down, if any.
        #[source]
        cause: Option<Arc<WebsocketCodecError>>,
    },
    /// The opening handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// An error occurred in the WebSocket codec.
    #[error("Codec error: {0}")]
    Codec(#[from] WebsocketCodecError),
    /// The operation is not allowed in the current connection state.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    /// Another task is already waiting for the next message.
    #[error("cannot call recv while another task is already waiting for the next message")]
    ConcurrentRecv,
    /// A ping with the same payload is still waiting for its pong.
    #[error("already waiting for a pong with the same data")]
    DuplicatePing,
    /// The provided URI is invalid.
    #[error("Invalid URI: {0}")]
    InvalidUri(&'static str),
    /// Failed to connect to the server.
    #[error("Failed to connect to server: {0}")]
    ConnectFailed(#[source] std::io::Error),
    /// An I/O error outside of the framing layer.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// The close code carried by a [`ConnectionError::Closed`] error.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is a closure with a normal (1000) or going-away (1001) code.
    #[must_use]
    pub fn is_closed_ok(&self) -> bool {
        matches!(self, Self::Closed { code: 1000 | 1001, .. })
    }
}
