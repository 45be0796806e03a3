#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use allagan_wsproto::{ConnectionConfig, ServerConfig, accept};
use allagan_wsproto::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Installs a test subscriber once; `RUST_LOG` overrides the default level.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Connection settings without keepalive and with short close timeouts.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_ping_interval(None)
        .with_close_timeout(Duration::from_secs(2))
}

pub fn test_server_config() -> ServerConfig {
    ServerConfig::default().with_connection_config(test_config())
}

/// A client and a server connected over an in-memory pipe.
pub async fn connection_pair(server: ServerConfig) -> (Connection, Connection) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let builder = Connection::builder("ws://localhost/chat".parse().unwrap()).config(test_config());
    let (client, server) = tokio::join!(
        builder.connect_with_stream(client_io),
        accept(server_io, &server)
    );
    (client.unwrap(), server.unwrap())
}

pub const UPGRADE_REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
Host: localhost\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";

/// Reads an HTTP head byte by byte, up to and including the blank line.
pub async fn read_head(raw: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(raw.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// A server connection whose peer is driven by hand.
pub async fn raw_client(config: ServerConfig) -> (DuplexStream, Connection) {
    let (mut raw, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { accept(server_io, &config).await });
    raw.write_all(UPGRADE_REQUEST).await.unwrap();
    let head = read_head(&mut raw).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    (raw, server.await.unwrap().unwrap())
}

/// A client frame with an all-zero mask, so the payload is sent as is.
pub fn masked_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mut frame = vec![first_byte, 0x80 | payload.len() as u8, 0, 0, 0, 0];
    frame.extend_from_slice(payload);
    frame
}
