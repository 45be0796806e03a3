//! Echoes every message back until the client leaves or Ctrl-C is pressed.
//!
//! Usage: `cargo run --example echo_server -- 127.0.0.1:8765`

use allagan_wsproto::{Connection, ServerConfig, serve};

async fn echo(conn: Connection) {
    while let Some(Ok(message)) = conn.next_message().await {
        if conn.send(message).await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8765".to_owned());
    let server = serve(echo, addr, ServerConfig::default().with_subprotocols(["chat"])).await?;
    println!("Listening on ws://{}/", server.local_addr());

    tokio::signal::ctrl_c().await?;
    server.close().await;
    Ok(())
}
