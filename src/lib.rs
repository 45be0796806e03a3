//! WebSocket protocol implementation.
//!
//! This crate provides the necessary types and functions to work with the WebSocket
//! protocol as defined in RFC 6455: framing, the opening handshake on both sides,
//! the connection state machine with its closing handshake, and a small server.
//! It supports text and binary messages, fragmentation, ping/pong with latency
//! measurement, keepalive, subprotocols and pluggable extensions.
//!
//! TLS is not handled here; wrap a TLS stream yourself and use
//! [`ClientConnectionBuilder::connect_with_stream`] or [`accept`].
pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod extensions;
pub mod handshake;
pub mod headers;
pub mod http11;
pub mod server;
pub mod stream;

pub use codec::{EndpointType, Opcode, WebsocketFrame};
pub use config::ConnectionConfig;
pub use connection::client::{ClientConnectionBuilder, connect};
pub use connection::server::accept;
pub use connection::{CloseReason, Connection, PongWaiter, State, WebsocketMessage};
pub use errors::{ConnectionError, HandshakeError, StreamError, WebsocketCodecError};
pub use http11::Headers;
pub use server::{Server, ServerConfig, serve};
