//! Server handshake rejections and the TCP server lifecycle.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use allagan_wsproto::http11::RawRequestMessage;
use allagan_wsproto::{Connection, ConnectionError, HandshakeError, accept, connect, serve};
use common::{UPGRADE_REQUEST, init_test_logging, test_config, test_server_config};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::bytes::Bytes;

const WAIT: Duration = Duration::from_secs(5);

/// Sends `request` to a server-side handshake and returns the raw response.
async fn reject(request: &[u8], config: allagan_wsproto::ServerConfig) -> (String, ConnectionError) {
    let (mut raw, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { accept(server_io, &config).await });
    raw.write_all(request).await.unwrap();
    let mut response = Vec::new();
    raw.read_to_end(&mut response).await.unwrap();
    drop(raw);
    let err = timeout(WAIT, server).await.unwrap().unwrap().unwrap_err();
    (String::from_utf8(response).unwrap(), err)
}

#[tokio::test]
async fn missing_version_is_a_bad_request() {
    init_test_logging();
    let request = b"GET / HTTP/1.1\r\n\
Host: localhost\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
\r\n";
    let (response, err) = reject(request, test_server_config()).await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.ends_with(
        "\r\n\r\nFailed to open a WebSocket connection: Missing Sec-WebSocket-Version header.\n"
    ));
    assert!(matches!(
        err,
        ConnectionError::Handshake(HandshakeError::InvalidHeader { .. })
    ));
}

#[tokio::test]
async fn plain_http_request_needs_an_upgrade() {
    init_test_logging();
    let (response, _) = reject(
        b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
        test_server_config(),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{response}");
    assert!(response.contains("Upgrade: websocket\r\n"));
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() {
    init_test_logging();
    let config = test_server_config().with_origins(vec![Some("https://good.example".to_owned())]);
    let (response, err) = reject(UPGRADE_REQUEST, config).await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");
    assert!(matches!(
        err,
        ConnectionError::Handshake(HandshakeError::InvalidOrigin(None))
    ));
}

#[tokio::test]
async fn request_hook_can_answer_instead() {
    init_test_logging();
    let config = test_server_config().with_process_request(Arc::new(|request: &RawRequestMessage| {
        if request.headers.contains("Authorization") {
            return Ok(());
        }
        Err(HandshakeError::AbortHandshake {
            status: StatusCode::UNAUTHORIZED,
            headers: [("WWW-Authenticate", "Basic")].into_iter().collect(),
            body: Bytes::from_static(b"credentials required\n"),
        })
    }));
    let (response, _) = reject(UPGRADE_REQUEST, config).await;
    assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{response}");
    assert!(response.contains("WWW-Authenticate: Basic\r\n"));
    assert!(response.contains("Content-Length: 21\r\n"));
    assert!(response.ends_with("credentials required\n"));
}

#[tokio::test]
async fn subprotocol_is_negotiated() {
    init_test_logging();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let config = test_server_config().with_subprotocols(["superchat", "chat"]);
    let builder = Connection::builder("ws://localhost/".parse().unwrap())
        .config(test_config())
        .add_sub_protocol("chat")
        .add_sub_protocol("superchat");
    let (client, server) = tokio::join!(
        builder.connect_with_stream(client_io),
        accept(server_io, &config)
    );
    let (client, server) = (client.unwrap(), server.unwrap());
    assert_eq!(client.subprotocol(), Some("chat"));
    assert_eq!(server.subprotocol(), Some("chat"));
    assert!(client.response_headers().unwrap().contains("Date"));
    client.close(1000, "").await.unwrap();
}

async fn echo(connection: Connection) {
    while let Some(Ok(message)) = connection.next_message().await {
        if connection.send(message).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn server_echoes_and_shuts_down_with_going_away() {
    init_test_logging();
    let server = serve(echo, "127.0.0.1:0", test_server_config())
        .await
        .unwrap();
    let addr = server.local_addr();

    let client = connect(&format!("ws://{addr}/echo")).await.unwrap();
    client.send_text("ping?").await.unwrap();
    assert_eq!(client.recv().await.unwrap().as_text(), Some("ping?"));
    assert_eq!(server.connection_count(), 1);

    timeout(WAIT, server.close()).await.unwrap();
    assert!(!server.is_serving());
    assert_eq!(server.connection_count(), 0);

    let err = client.recv().await.unwrap_err();
    assert_eq!(err.close_code(), Some(1001));
    assert!(matches!(
        connect(&format!("ws://{addr}/")).await,
        Err(ConnectionError::ConnectFailed(_))
    ));
}

#[tokio::test]
async fn handler_panic_fails_with_internal_error() {
    init_test_logging();
    let server = serve(
        |_connection: Connection| async move { panic!("handler bug") },
        "127.0.0.1:0",
        test_server_config(),
    )
    .await
    .unwrap();

    let client = connect(&format!("ws://{}/", server.local_addr()))
        .await
        .unwrap();
    let err = timeout(WAIT, client.recv()).await.unwrap().unwrap_err();
    assert_eq!(err.close_code(), Some(1011));
    timeout(WAIT, server.close()).await.unwrap();
}

#[tokio::test]
async fn handler_return_closes_normally() {
    init_test_logging();
    let server = serve(
        |connection: Connection| async move {
            let _ = connection.send_text("bye").await;
        },
        "127.0.0.1:0",
        test_server_config(),
    )
    .await
    .unwrap();

    let client = connect(&format!("ws://{}/", server.local_addr()))
        .await
        .unwrap();
    assert_eq!(client.recv().await.unwrap().as_text(), Some("bye"));
    assert!(client.next_message().await.is_none());
    assert_eq!(client.close_code(), Some(1000));
    timeout(WAIT, server.close()).await.unwrap();
}

#[tokio::test]
async fn connection_opened_during_shutdown_goes_away_without_the_handler() {
    init_test_logging();
    let slot: Arc<Mutex<Option<allagan_wsproto::Server>>> = Arc::new(Mutex::new(None));
    let hook_slot = slot.clone();
    // Dropping the server stops it after the handshake has checked it is serving.
    let config = test_server_config().with_process_request(Arc::new(move |_: &RawRequestMessage| {
        drop(hook_slot.lock().unwrap().take());
        Ok(())
    }));
    let ran = Arc::new(AtomicBool::new(false));
    let handler_ran = ran.clone();
    let server = serve(
        move |_connection: Connection| {
            let handler_ran = handler_ran.clone();
            async move { handler_ran.store(true, Ordering::SeqCst) }
        },
        "127.0.0.1:0",
        config,
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    *slot.lock().unwrap() = Some(server);

    let client = connect(&format!("ws://{addr}/")).await.unwrap();
    let err = timeout(WAIT, client.recv()).await.unwrap().unwrap_err();
    assert_eq!(err.close_code(), Some(1001));
    timeout(WAIT, client.wait_closed()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!ran.load(Ordering::SeqCst));
}
