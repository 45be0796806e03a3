//! Client half of the opening handshake.

use std::sync::Arc;

use http::Version;

use super::{HandshakeResult, check_upgrade, compute_accept_key, generate_key, single_header};
use crate::errors::{HandshakeError, StreamError};
use crate::extensions::{ClientExtensionFactory, Extension, ExtensionHeader};
use crate::headers::{build_extension, build_subprotocol, parse_extension, parse_subprotocol};
use crate::http11::{Headers, RawResponseMessage};

/// State kept between sending the upgrade request and reading the response.
pub struct ClientHandshake {
    key: String,
    extensions: Vec<Arc<dyn ClientExtensionFactory>>,
    subprotocols: Vec<String>,
}

impl ClientHandshake {
    /// Prepares a handshake with a fresh key.
    #[must_use]
    pub fn new(
        extensions: Vec<Arc<dyn ClientExtensionFactory>>,
        subprotocols: Vec<String>,
    ) -> Self {
        Self {
            key: generate_key(),
            extensions,
            subprotocols,
        }
    }

    /// The `Sec-WebSocket-Key` sent with the request.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Adds the upgrade headers to `headers`.
    pub fn write_request_headers(&self, headers: &mut Headers) {
        headers.insert("Upgrade", "websocket");
        headers.insert("Connection", "Upgrade");
        headers.insert("Sec-WebSocket-Key", self.key.as_str());
        headers.insert("Sec-WebSocket-Version", "13");
        if !self.extensions.is_empty() {
            let offers: Vec<ExtensionHeader> = self
                .extensions
                .iter()
                .map(|factory| (factory.name().to_owned(), factory.request_params()))
                .collect();
            headers.insert("Sec-WebSocket-Extensions", build_extension(&offers));
        }
        if !self.subprotocols.is_empty() {
            headers.insert("Sec-WebSocket-Protocol", build_subprotocol(&self.subprotocols));
        }
    }

    /// Validates the server's answer and returns what was negotiated.
    ///
    /// # Errors
    /// A [`HandshakeError`] describing the first problem found.
    pub fn process_response(
        &self,
        response: &RawResponseMessage,
    ) -> Result<HandshakeResult, HandshakeError> {
        if response.version != Version::HTTP_11 {
            return Err(HandshakeError::InvalidMessage(
                "response",
                StreamError::Payload(format!("unsupported HTTP version {:?}", response.version)),
            ));
        }
        if response.status != 101 {
            return Err(HandshakeError::InvalidStatus {
                status: response.status,
                headers: response.headers.clone(),
            });
        }
        let headers = &response.headers;
        check_upgrade(headers)?;

        match single_header(headers, "Sec-WebSocket-Accept")? {
            None => return Err(HandshakeError::missing("Sec-WebSocket-Accept")),
            Some(accept) if accept != compute_accept_key(&self.key) => {
                return Err(HandshakeError::header_value("Sec-WebSocket-Accept", accept));
            }
            Some(_) => {}
        }

        Ok(HandshakeResult {
            extensions: self.process_extensions(headers)?,
            subprotocol: self.process_subprotocol(headers)?,
            origin: None,
        })
    }

    /// Every extension the server accepted must match one this client offered.
    fn process_extensions(
        &self,
        headers: &Headers,
    ) -> Result<Vec<Arc<dyn Extension>>, HandshakeError> {
        let mut accepted: Vec<Arc<dyn Extension>> = Vec::new();
        let values: Vec<&str> = headers.get_all("Sec-WebSocket-Extensions").collect();
        if values.is_empty() {
            return Ok(accepted);
        }
        if self.extensions.is_empty() {
            return Err(HandshakeError::Negotiation(
                "no extensions supported".to_owned(),
            ));
        }
        for value in values {
            for (name, params) in parse_extension(value)? {
                let negotiated = self
                    .extensions
                    .iter()
                    .filter(|factory| factory.name() == name)
                    .find_map(|factory| factory.process_response_params(&params, &accepted).ok());
                match negotiated {
                    Some(extension) => accepted.push(extension),
                    None => {
                        return Err(HandshakeError::Negotiation(format!(
                            "Unsupported extension: name = {name}, params = {params:?}"
                        )));
                    }
                }
            }
        }
        Ok(accepted)
    }

    fn process_subprotocol(&self, headers: &Headers) -> Result<Option<String>, HandshakeError> {
        let mut values = Vec::new();
        for value in headers.get_all("Sec-WebSocket-Protocol") {
            values.extend(parse_subprotocol(value)?);
        }
        match values.as_slice() {
            [] => Ok(None),
            _ if self.subprotocols.is_empty() => Err(HandshakeError::Negotiation(
                "no subprotocols supported".to_owned(),
            )),
            [subprotocol] if self.subprotocols.contains(subprotocol) => {
                Ok(Some(subprotocol.clone()))
            }
            [subprotocol] => Err(HandshakeError::Negotiation(format!(
                "unsupported subprotocol: {subprotocol}"
            ))),
            many => Err(HandshakeError::Negotiation(format!(
                "multiple subprotocols: {}",
                many.join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WebsocketFrame;
    use crate::errors::WebsocketCodecError;
    use crate::extensions::ExtensionParameter;

    #[derive(Debug)]
    struct Noop;

    impl Extension for Noop {
        fn name(&self) -> &str {
            "x-noop"
        }

        fn decode(
            &self,
            frame: WebsocketFrame,
            _max_size: Option<usize>,
        ) -> Result<WebsocketFrame, WebsocketCodecError> {
            Ok(frame)
        }

        fn encode(&self, frame: WebsocketFrame) -> Result<WebsocketFrame, WebsocketCodecError> {
            Ok(frame)
        }
    }

    struct NoopFactory;

    impl ClientExtensionFactory for NoopFactory {
        fn name(&self) -> &str {
            "x-noop"
        }

        fn request_params(&self) -> Vec<ExtensionParameter> {
            vec![("level".to_owned(), Some("1".to_owned()))]
        }

        fn process_response_params(
            &self,
            params: &[ExtensionParameter],
            _accepted: &[Arc<dyn Extension>],
        ) -> Result<Arc<dyn Extension>, HandshakeError> {
            match params {
                [] => Ok(Arc::new(Noop)),
                [(name, _), ..] => Err(HandshakeError::InvalidParameterName(name.clone())),
            }
        }
    }

    fn response(handshake: &ClientHandshake, extra: &[(&str, &str)]) -> RawResponseMessage {
        let mut headers: Headers = [
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Accept", compute_accept_key(handshake.key()).as_str()),
        ]
        .into_iter()
        .collect();
        headers.extend(extra.iter().copied());
        RawResponseMessage {
            version: Version::HTTP_11,
            status: 101,
            reason: "Switching Protocols".to_owned(),
            headers,
        }
    }

    #[test]
    fn request_headers_offer_extensions_and_subprotocols() {
        let handshake = ClientHandshake::new(vec![Arc::new(NoopFactory)], vec!["chat".to_owned()]);
        let mut headers = Headers::new();
        handshake.write_request_headers(&mut headers);
        assert_eq!(headers.get("Sec-WebSocket-Version"), Some("13"));
        assert_eq!(headers.get("Sec-WebSocket-Key"), Some(handshake.key()));
        assert_eq!(headers.get("Sec-WebSocket-Extensions"), Some("x-noop; level=1"));
        assert_eq!(headers.get("Sec-WebSocket-Protocol"), Some("chat"));
    }

    #[test]
    fn valid_response_is_accepted() {
        let handshake = ClientHandshake::new(vec![Arc::new(NoopFactory)], vec!["chat".to_owned()]);
        let result = handshake
            .process_response(&response(
                &handshake,
                &[("Sec-WebSocket-Extensions", "x-noop"), ("Sec-WebSocket-Protocol", "chat")],
            ))
            .unwrap();
        assert_eq!(result.extensions.len(), 1);
        assert_eq!(result.subprotocol.as_deref(), Some("chat"));
    }

    #[test]
    fn wrong_accept_is_rejected() {
        let handshake = ClientHandshake::new(vec![], vec![]);
        let mut bad = response(&handshake, &[]);
        bad.headers = [
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            handshake.process_response(&bad),
            Err(HandshakeError::InvalidHeaderValue { .. })
        ));
    }

    #[test]
    fn non_101_status_is_rejected() {
        let handshake = ClientHandshake::new(vec![], vec![]);
        let mut refused = response(&handshake, &[]);
        refused.status = 403;
        assert!(matches!(
            handshake.process_response(&refused),
            Err(HandshakeError::InvalidStatus { status: 403, .. })
        ));
    }

    #[test]
    fn unoffered_extension_is_fatal() {
        let handshake = ClientHandshake::new(vec![Arc::new(NoopFactory)], vec![]);
        let err = handshake
            .process_response(&response(
                &handshake,
                &[("Sec-WebSocket-Extensions", "x-noop; level=9")],
            ))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Negotiation(_)));
    }

    #[test]
    fn unoffered_subprotocol_is_rejected() {
        let handshake = ClientHandshake::new(vec![], vec!["chat".to_owned()]);
        let err = handshake
            .process_response(&response(&handshake, &[("Sec-WebSocket-Protocol", "superchat")]))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Negotiation(_)));
    }
}
