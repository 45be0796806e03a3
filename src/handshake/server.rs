//! Server half of the opening handshake.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Version;

use super::{HandshakeResult, check_upgrade, compute_accept_key, single_header};
use crate::errors::{HandshakeError, StreamError};
use crate::extensions::{Extension, ExtensionHeader, ServerExtensionFactory};
use crate::headers::{build_extension, parse_extension, parse_subprotocol};
use crate::http11::{Headers, RawRequestMessage};

/// Picks a subprotocol given the client's offers and the server's list.
pub type SubprotocolSelector = Arc<dyn Fn(&[String], &[String]) -> Option<String> + Send + Sync>;

/// Server-side negotiation settings.
#[derive(Clone)]
pub struct ServerHandshake {
    /// Accepted `Origin` values; `None` in the list admits requests without
    /// an `Origin` header. `None` disables the check.
    pub origins: Option<Vec<Option<String>>>,
    /// Supported extensions. `None` means extensions are not configured at all,
    /// and any extension request fails the handshake.
    pub extensions: Option<Vec<Arc<dyn ServerExtensionFactory>>>,
    /// Supported subprotocols, by decreasing preference.
    pub subprotocols: Vec<String>,
    /// Replaces the default subprotocol selection.
    pub select_subprotocol: Option<SubprotocolSelector>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self {
            origins: None,
            extensions: Some(Vec::new()),
            subprotocols: Vec::new(),
            select_subprotocol: None,
        }
    }
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("origins", &self.origins)
            .field(
                "extensions",
                &self
                    .extensions
                    .as_ref()
                    .map(|list| list.iter().map(|e| e.name().to_owned()).collect::<Vec<_>>()),
            )
            .field("subprotocols", &self.subprotocols)
            .field("select_subprotocol", &self.select_subprotocol.is_some())
            .finish()
    }
}

/// A validated upgrade request.
#[derive(Debug)]
pub struct Accepted {
    /// Headers for the `101 Switching Protocols` response.
    pub headers: Headers,
    /// What was negotiated.
    pub result: HandshakeResult,
}

impl ServerHandshake {
    /// Validates an upgrade request and negotiates extensions and subprotocol.
    ///
    /// # Errors
    /// A [`HandshakeError`] whose [`http_status`](HandshakeError::http_status)
    /// is the status to reject the request with.
    pub fn accept(&self, request: &RawRequestMessage) -> Result<Accepted, HandshakeError> {
        if request.method != "GET" {
            return Err(HandshakeError::InvalidMessage(
                "request",
                StreamError::Payload(format!("unsupported HTTP method {}", request.method)),
            ));
        }
        if request.version != Version::HTTP_11 {
            return Err(HandshakeError::InvalidMessage(
                "request",
                StreamError::Payload(format!("unsupported HTTP version {:?}", request.version)),
            ));
        }
        let headers = &request.headers;
        check_upgrade(headers)?;

        let key = match single_header(headers, "Sec-WebSocket-Key")? {
            None => return Err(HandshakeError::missing("Sec-WebSocket-Key")),
            Some(key) => key,
        };
        if !BASE64.decode(key).is_ok_and(|raw| raw.len() == 16) {
            return Err(HandshakeError::InvalidHeader {
                name: "Sec-WebSocket-Key".to_owned(),
                value: Some(key.to_owned()),
            });
        }

        match single_header(headers, "Sec-WebSocket-Version")? {
            None => return Err(HandshakeError::missing("Sec-WebSocket-Version")),
            Some("13") => {}
            Some(version) => {
                return Err(HandshakeError::InvalidHeader {
                    name: "Sec-WebSocket-Version".to_owned(),
                    value: Some(version.to_owned()),
                });
            }
        }

        let origin = self.process_origin(headers)?;
        let (extension_header, extensions) = self.process_extensions(headers)?;
        let subprotocol = self.process_subprotocol(headers)?;

        let mut response = Headers::new();
        response.insert("Upgrade", "websocket");
        response.insert("Connection", "Upgrade");
        response.insert("Sec-WebSocket-Accept", compute_accept_key(key));
        if let Some(value) = extension_header {
            response.insert("Sec-WebSocket-Extensions", value);
        }
        if let Some(value) = &subprotocol {
            response.insert("Sec-WebSocket-Protocol", value.as_str());
        }

        Ok(Accepted {
            headers: response,
            result: HandshakeResult {
                extensions,
                subprotocol,
                origin,
            },
        })
    }

    fn process_origin(&self, headers: &Headers) -> Result<Option<String>, HandshakeError> {
        let origin = single_header(headers, "Origin")?.map(str::to_owned);
        if let Some(origins) = &self.origins
            && !origins.contains(&origin)
        {
            return Err(HandshakeError::InvalidOrigin(origin));
        }
        Ok(origin)
    }

    /// Each offer is tried on its own; an offer no factory accepts is declined.
    fn process_extensions(
        &self,
        headers: &Headers,
    ) -> Result<(Option<String>, Vec<Arc<dyn Extension>>), HandshakeError> {
        let values: Vec<&str> = headers.get_all("Sec-WebSocket-Extensions").collect();
        let mut accepted: Vec<Arc<dyn Extension>> = Vec::new();
        if values.is_empty() {
            return Ok((None, accepted));
        }
        let Some(factories) = &self.extensions else {
            return Err(HandshakeError::Negotiation(
                "no extensions supported".to_owned(),
            ));
        };

        let mut response: Vec<ExtensionHeader> = Vec::new();
        for value in values {
            for (name, params) in parse_extension(value)? {
                for factory in factories.iter().filter(|f| f.name() == name) {
                    match factory.process_request_params(&params, &accepted) {
                        Ok((response_params, extension)) => {
                            response.push((name.clone(), response_params));
                            accepted.push(extension);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(extension = %name, error = %e, "declined extension offer");
                        }
                    }
                }
            }
        }

        let header = (!response.is_empty()).then(|| build_extension(&response));
        Ok((header, accepted))
    }

    fn process_subprotocol(&self, headers: &Headers) -> Result<Option<String>, HandshakeError> {
        let mut offered = Vec::new();
        for value in headers.get_all("Sec-WebSocket-Protocol") {
            offered.extend(parse_subprotocol(value)?);
        }
        if offered.is_empty() || self.subprotocols.is_empty() {
            return Ok(None);
        }
        Ok(match &self.select_subprotocol {
            Some(select) => select(&offered, &self.subprotocols),
            None => select_subprotocol(&offered, &self.subprotocols),
        })
    }
}

/// Default subprotocol choice: among the protocols both sides support, the one
/// with the lowest combined position in the two lists. Ties go to the client's
/// earlier offer.
#[must_use]
pub fn select_subprotocol(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .enumerate()
        .filter_map(|(client_rank, p)| {
            server
                .iter()
                .position(|s| s == p)
                .map(|server_rank| (client_rank + server_rank, p))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, p)| p.clone())
}
