//! Connects to a WebSocket server, sends one message and prints what comes back.
//!
//! Usage: `cargo run --example client -- ws://127.0.0.1:8765/`

use allagan_wsproto::{Connection, ConnectionConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let uri: http::Uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8765/".to_owned())
        .parse()?;

    let conn = Connection::builder(uri)
        .config(ConnectionConfig::default().with_max_size(Some(4096)))
        .add_sub_protocol("chat")
        .connect()
        .await?;

    // Send a text message
    conn.send_text("Hello, WebSocket!").await?;
    let latency = conn.ping("hi").await?.await?;
    println!("Round trip: {latency:?}");

    // Wait for a response
    if let Some(msg) = conn.next_message().await {
        println!("Received: {:?}", msg?);
    }
    conn.close(1000, "").await?;

    Ok(())
}
