//! Opening handshake logic shared by both sides (RFC 6455 section 4).
//!
//! The functions here only build and validate HTTP heads; reading and writing
//! them is done by the connection modules.

pub mod client;
pub mod server;

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::errors::HandshakeError;
use crate::extensions::Extension;
use crate::headers::{parse_connection, parse_upgrade};
use crate::http11::Headers;

/// Magic value appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// What both sides agreed on during the handshake.
#[derive(Clone, Default)]
pub struct HandshakeResult {
    /// Negotiated extensions, in the order they apply.
    pub extensions: Vec<Arc<dyn Extension>>,
    /// Negotiated subprotocol.
    pub subprotocol: Option<String>,
    /// Origin sent by the client, once validated by the server.
    pub origin: Option<String>,
}

impl std::fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeResult")
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("subprotocol", &self.subprotocol)
            .field("origin", &self.origin)
            .finish()
    }
}

/// A random `Sec-WebSocket-Key`.
#[must_use]
pub fn generate_key() -> String {
    let mut key_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut key_bytes);
    BASE64.encode(key_bytes)
}

/// The `Sec-WebSocket-Accept` value matching `key`.
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// Checks the `Connection` and `Upgrade` headers of either head.
///
/// Every `Connection` header is considered; `Upgrade` must name exactly
/// the `websocket` protocol.
pub(crate) fn check_upgrade(headers: &Headers) -> Result<(), HandshakeError> {
    let mut connection = Vec::new();
    for value in headers.get_all("Connection") {
        connection.extend(parse_connection(value)?);
    }
    if !connection.iter().any(|v| v.eq_ignore_ascii_case("upgrade")) {
        return Err(HandshakeError::InvalidUpgrade {
            name: "Connection",
            value: connection.join(", "),
        });
    }

    let mut upgrade = Vec::new();
    for value in headers.get_all("Upgrade") {
        upgrade.extend(parse_upgrade(value)?);
    }
    if !(upgrade.len() == 1 && upgrade[0].eq_ignore_ascii_case("websocket")) {
        return Err(HandshakeError::InvalidUpgrade {
            name: "Upgrade",
            value: upgrade.join(", "),
        });
    }
    Ok(())
}

/// Reads a header that must appear at most once.
pub(crate) fn single_header<'a>(
    headers: &'a Headers,
    name: &str,
) -> Result<Option<&'a str>, HandshakeError> {
    headers
        .get_single(name)
        .map_err(|_| HandshakeError::multiple(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_decode_to_sixteen_bytes() {
        let key = generate_key();
        assert_eq!(BASE64.decode(key).unwrap().len(), 16);
    }

    #[test]
    fn connection_headers_are_unioned() {
        let headers: Headers = [
            ("Connection", "keep-alive"),
            ("connection", "Upgrade"),
            ("Upgrade", "WebSocket"),
        ]
        .into_iter()
        .collect();
        assert!(check_upgrade(&headers).is_ok());
    }

    #[test]
    fn upgrade_must_be_websocket_only() {
        let headers: Headers = [("Connection", "Upgrade"), ("Upgrade", "websocket, h2c")]
            .into_iter()
            .collect();
        let err = check_upgrade(&headers).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::InvalidUpgrade { name: "Upgrade", .. }
        ));
    }

    #[test]
    fn missing_connection_header_is_an_upgrade_error() {
        let headers: Headers = [("Upgrade", "websocket")].into_iter().collect();
        let err = check_upgrade(&headers).unwrap_err();
        assert_eq!(err.http_status(), http::StatusCode::UPGRADE_REQUIRED);
    }
}
