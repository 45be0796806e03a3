//! Server-side opening handshake over an accepted stream.

use http::StatusCode;
use tokio_util::bytes::Bytes;

use crate::codec::EndpointType;
use crate::connection::{Connection, HandshakeInfo};
use crate::errors::{ConnectionError, HandshakeError};
use crate::handshake::server::Accepted;
use crate::http11::{Headers, RawRequestMessage, http_date};
use crate::server::ServerConfig;
use crate::stream::{Transport, WebSocketStream};

/// Performs the server side of the opening handshake on `stream`.
///
/// On failure an HTTP error response is sent when possible and the
/// transport is closed.
///
/// # Errors
/// The handshake failure, as a [`ConnectionError::Handshake`], or an I/O error.
pub async fn accept<S>(stream: S, config: &ServerConfig) -> Result<Connection, ConnectionError>
where
    S: WebSocketStream + Send + 'static,
{
    let connection = Connection::new(
        Transport::new(stream),
        EndpointType::Server,
        config.connection.clone(),
    );
    handshake(&connection, config, || true).await?;
    Ok(connection)
}

/// Runs the handshake on a fresh connection, bounded by `open_timeout`.
pub(crate) async fn handshake(
    connection: &Connection,
    config: &ServerConfig,
    is_serving: impl Fn() -> bool,
) -> Result<(), ConnectionError> {
    let exchange = exchange(connection, config, is_serving);
    let result = match connection.config().open_timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or_else(|_| Err(HandshakeError::Timeout.into())),
        None => exchange.await,
    };
    if let Err(e) = result {
        connection.fail_connection(1006, "");
        connection.wait_closed().await;
        return Err(e);
    }
    Ok(())
}

async fn exchange(
    connection: &Connection,
    config: &ServerConfig,
    is_serving: impl Fn() -> bool,
) -> Result<(), ConnectionError> {
    let request = match connection.reader().read_http_request_head().await {
        Ok(request) => request,
        Err(e) if e.is_eof() => {
            tracing::debug!(error = %e, "connection closed before the request head");
            return Err(HandshakeError::InvalidMessage("request", e).into());
        }
        Err(e) => {
            let err = HandshakeError::InvalidMessage("request", e);
            reject(connection, config, &err).await;
            return Err(err.into());
        }
    };
    tracing::debug!(path = %request.path, "upgrade request");

    let accepted = if is_serving() {
        negotiate(config, &request)
    } else {
        Err(HandshakeError::ShuttingDown)
    };
    let Accepted {
        mut headers,
        result,
    } = match accepted {
        Ok(accepted) => accepted,
        Err(err) => {
            reject(connection, config, &err).await;
            return Err(err.into());
        }
    };

    headers.insert("Date", http_date());
    if let Some(server) = &config.server_header {
        headers.insert("Server", server.as_str());
    }
    headers.extend(
        config
            .extra_headers
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned())),
    );
    connection
        .writer()
        .write_response(StatusCode::SWITCHING_PROTOCOLS, &headers, b"");
    connection.writer().drain().await?;
    connection
        .connection_open(HandshakeInfo {
            path: request.path,
            request_headers: request.headers,
            response_headers: headers,
            result,
        })
        .await;
    Ok(())
}

fn negotiate(config: &ServerConfig, request: &RawRequestMessage) -> Result<Accepted, HandshakeError> {
    if let Some(process_request) = &config.process_request {
        process_request(request)?;
    }
    config.handshake.accept(request)
}

/// Writes the HTTP response for a failed handshake.
async fn reject(connection: &Connection, config: &ServerConfig, err: &HandshakeError) {
    let (status, mut headers, body) = error_response(err);
    headers.set_default("Date", http_date());
    if let Some(server) = &config.server_header {
        headers.set_default("Server", server.as_str());
    }
    headers.set_default("Content-Length", body.len().to_string());
    headers.set_default("Content-Type", "text/plain");
    headers.set_default("Connection", "close");
    connection.writer().write_response(status, &headers, &body);
    if let Err(e) = connection.writer().drain().await {
        tracing::debug!(error = %e, "could not send the rejection");
    }
    tracing::info!(
        status = status.as_u16(),
        reason = status.canonical_reason().unwrap_or(""),
        error = %err,
        "connection rejected"
    );
}

fn error_response(err: &HandshakeError) -> (StatusCode, Headers, Bytes) {
    let status = err.http_status();
    match err {
        HandshakeError::AbortHandshake {
            status,
            headers,
            body,
        } => (*status, headers.clone(), body.clone()),
        HandshakeError::ShuttingDown => (
            status,
            Headers::new(),
            Bytes::from_static(b"Server is shutting down.\n"),
        ),
        HandshakeError::InvalidUpgrade { .. } => (
            status,
            [("Upgrade", "websocket")].into_iter().collect(),
            Bytes::from(format!(
                "Failed to open a WebSocket connection: {err}.\n\n\
                 You cannot access a WebSocket server directly with a browser. \
                 You need a WebSocket client.\n"
            )),
        ),
        _ if status == StatusCode::INTERNAL_SERVER_ERROR => (
            status,
            Headers::new(),
            Bytes::from_static(b"Failed to open a WebSocket connection.\n"),
        ),
        _ => (
            status,
            Headers::new(),
            Bytes::from(format!("Failed to open a WebSocket connection: {err}.\n")),
        ),
    }
}
