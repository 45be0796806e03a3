//! Client-side connection setup: request building, connecting, handshaking.

use std::sync::Arc;

use crate::codec::EndpointType;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, HandshakeInfo};
use crate::errors::{ConnectionError, HandshakeError};
use crate::extensions::ClientExtensionFactory;
use crate::handshake::client::ClientHandshake;
use crate::headers::build_authorization_basic;
use crate::http11::{Headers, USER_AGENT};
use crate::stream::{Transport, WebSocketStream};

impl Connection {
    /// Create a new builder for the given `ws://` URI.
    ///
    /// The host parameter in the URI is required and must be a valid domain name or IP address. The
    /// port is optional and defaults to 80. The path is optional and defaults to "/".
    ///
    /// Do not accept user input directly for the URI to avoid injection attacks.
    #[must_use]
    pub fn builder(uri: http::Uri) -> ClientConnectionBuilder {
        ClientConnectionBuilder {
            uri,
            config: ConnectionConfig::default(),
            sub_protocols: None,
            query_params: None,
            auth_header: None,
            cookies: None,
            origin: None,
            user_agent: Some(USER_AGENT.to_owned()),
            extensions: Vec::new(),
            extra_headers: Headers::new(),
        }
    }
}

/// Connects to `uri` with default settings.
///
/// # Errors
/// Returns an error if the URI is invalid, the connection cannot be
/// established or the handshake fails.
pub async fn connect(uri: &str) -> Result<Connection, ConnectionError> {
    let uri = uri
        .parse::<http::Uri>()
        .map_err(|_| ConnectionError::InvalidUri("malformed URI"))?;
    Connection::builder(uri).connect().await
}

/// Builder for creating a WebSocket client connection with optional parameters.
pub struct ClientConnectionBuilder {
    uri: http::Uri,
    config: ConnectionConfig,
    query_params: Option<Vec<(String, String)>>,
    auth_header: Option<String>,
    cookies: Option<Vec<String>>,
    sub_protocols: Option<Vec<String>>,
    origin: Option<String>,
    user_agent: Option<String>,
    extensions: Vec<Arc<dyn ClientExtensionFactory>>,
    extra_headers: Headers,
}

/// Where to connect and what to ask for.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    resource: String,
    headers: Headers,
}

impl ClientConnectionBuilder {
    #[must_use]
    /// Add a sub-protocol to the WebSocket handshake request.
    /// The order of sub-protocols matters; the server will select the first one it supports.
    /// Do not use this method with untrusted input to avoid injection attacks.
    ///
    /// # Arguments
    /// * `protocol`: The sub-protocol to add.
    pub fn add_sub_protocol<S: Into<String>>(mut self, protocol: S) -> Self {
        self.sub_protocols
            .get_or_insert_with(Vec::new)
            .push(protocol.into());
        self
    }

    #[must_use]
    /// Add a single query parameter to be included in the WebSocket handshake request.
    ///
    /// Query parameters should not be URL-encoded; this method will handle encoding.
    /// Make sure that any parameters added are not from untrusted sources to avoid injection attacks.
    ///
    /// # Arguments
    /// * `key`: The query parameter key.
    /// * `value`: The query parameter value.
    pub fn add_query_param<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query_params
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    #[must_use]
    /// Set the Authorization header for the WebSocket handshake request.
    ///
    /// It is the caller's responsibility to ensure the value is properly formatted (e.g., "Bearer <token>").
    /// It takes precedence over credentials embedded in the URI.
    ///
    /// # Arguments
    /// * `value`: The value for the Authorization header.
    pub fn auth_header<S: AsRef<str>>(mut self, value: S) -> Self {
        self.auth_header = Some(value.as_ref().to_string());
        self
    }

    #[must_use]
    /// Add a single cookie to be included in the WebSocket handshake request.
    ///
    /// # Arguments
    /// * `cookie`: The cookie string to add.
    pub fn add_cookie<S: Into<String>>(mut self, cookie: S) -> Self {
        self.cookies
            .get_or_insert_with(Vec::new)
            .push(cookie.into());
        self
    }

    #[must_use]
    /// Set the Origin header for the WebSocket handshake request.
    ///
    /// # Arguments
    /// * `value`: The value for the Origin header.
    pub fn origin<S: AsRef<str>>(mut self, value: S) -> Self {
        self.origin = Some(value.as_ref().to_string());
        self
    }

    #[must_use]
    /// Offer an extension. Offers are sent, and matched, in the order they are added.
    pub fn add_extension(mut self, factory: Arc<dyn ClientExtensionFactory>) -> Self {
        self.extensions.push(factory);
        self
    }

    #[must_use]
    /// Add an arbitrary header to the handshake request.
    pub fn add_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.extra_headers.insert(name, value);
        self
    }

    #[must_use]
    /// Set the User-Agent header; `None` omits it.
    pub fn user_agent(mut self, value: Option<String>) -> Self {
        self.user_agent = value;
        self
    }

    #[must_use]
    /// Set limits and timeouts for the connection.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolves the URI and builds the request headers with all options applied.
    fn target(&self, handshake: &ClientHandshake) -> Result<Target, ConnectionError> {
        match self.uri.scheme_str() {
            Some("ws") => {}
            Some(s) => {
                return Err(ConnectionError::InvalidUri(match s {
                    "wss" => "secure WebSocket URIs are not supported",
                    "http" => "http scheme is not supported for WebSocket",
                    "https" => "https scheme is not supported for WebSocket",
                    _ => "unsupported URI scheme for WebSocket",
                }));
            }
            None => return Err(ConnectionError::InvalidUri("missing URI scheme")),
        }
        let authority = self
            .uri
            .authority()
            .ok_or(ConnectionError::InvalidUri("missing host"))?;
        let host = authority.host();
        if host.is_empty() {
            return Err(ConnectionError::InvalidUri("missing host"));
        }
        let port = authority.port_u16().unwrap_or(80);

        let mut resource = self
            .uri
            .path_and_query()
            .map_or("/", http::uri::PathAndQuery::as_str)
            .to_owned();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(params) = &self.query_params {
            let mut separator = if resource.contains('?') { '&' } else { '?' };
            for (k, v) in params {
                resource.push(separator);
                resource.push_str(&urlencoding::encode(k));
                resource.push('=');
                resource.push_str(&urlencoding::encode(v));
                separator = '&';
            }
        }

        let mut headers = Headers::new();
        if port == 80 {
            headers.insert("Host", host);
        } else {
            headers.insert("Host", format!("{host}:{port}"));
        }
        handshake.write_request_headers(&mut headers);
        if let Some(origin) = &self.origin {
            headers.insert("Origin", origin.as_str());
        }
        if let Some(auth) = &self.auth_header {
            headers.insert("Authorization", auth.as_str());
        } else if let Some((user_info, _)) = authority.as_str().rsplit_once('@') {
            let (username, password) = user_info.split_once(':').unwrap_or((user_info, ""));
            let username = urlencoding::decode(username)
                .map_err(|_| ConnectionError::InvalidUri("invalid user info"))?;
            let password = urlencoding::decode(password)
                .map_err(|_| ConnectionError::InvalidUri("invalid user info"))?;
            headers.insert("Authorization", build_authorization_basic(&username, &password));
        }
        if let Some(cookies) = &self.cookies {
            headers.insert("Cookie", cookies.join("; "));
        }
        headers.extend(
            self.extra_headers
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned())),
        );
        if let Some(user_agent) = &self.user_agent {
            headers.set_default("User-Agent", user_agent.as_str());
        }

        Ok(Target {
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port,
            resource,
            headers,
        })
    }

    /// Connect and return a WebSocket Connection using the configured options.
    ///
    /// # Errors
    /// Returns an error if the handshake fails or the connection cannot be established.
    pub async fn connect(self) -> Result<Connection, ConnectionError> {
        let handshake = self.client_handshake();
        let target = self.target(&handshake)?;
        tracing::debug!(host = %target.host, port = target.port, "connecting");
        let stream = tokio::net::TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(ConnectionError::ConnectFailed)?;
        let _ = stream.set_nodelay(true);
        self.open(stream, &handshake, target).await
    }

    /// Perform the handshake over an already connected stream.
    ///
    /// # Errors
    /// Returns an error if the URI is invalid or the handshake fails.
    pub async fn connect_with_stream<S>(self, stream: S) -> Result<Connection, ConnectionError>
    where
        S: WebSocketStream + Send + 'static,
    {
        let handshake = self.client_handshake();
        let target = self.target(&handshake)?;
        self.open(stream, &handshake, target).await
    }

    fn client_handshake(&self) -> ClientHandshake {
        ClientHandshake::new(
            self.extensions.clone(),
            self.sub_protocols.clone().unwrap_or_default(),
        )
    }

    async fn open<S>(
        self,
        stream: S,
        handshake: &ClientHandshake,
        target: Target,
    ) -> Result<Connection, ConnectionError>
    where
        S: WebSocketStream + Send + 'static,
    {
        let connection = Connection::new(Transport::new(stream), EndpointType::Client, self.config);
        let exchange = exchange(&connection, handshake, target);
        let result = match connection.config().open_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or_else(|_| Err(HandshakeError::Timeout.into())),
            None => exchange.await,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "opening handshake failed");
            connection.fail_connection(1006, "");
            connection.wait_closed().await;
            return Err(e);
        }
        Ok(connection)
    }
}

async fn exchange(
    connection: &Connection,
    handshake: &ClientHandshake,
    target: Target,
) -> Result<(), ConnectionError> {
    connection
        .writer()
        .write_request(&target.resource, &target.headers);
    connection.writer().drain().await?;
    let response = connection
        .reader()
        .read_http_response_head()
        .await
        .map_err(|e| HandshakeError::InvalidMessage("response", e))?;
    let result = handshake.process_response(&response)?;
    connection
        .connection_open(HandshakeInfo {
            path: target.resource,
            request_headers: target.headers,
            response_headers: response.headers,
            result,
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_for(builder: &ClientConnectionBuilder) -> Result<Target, ConnectionError> {
        builder.target(&ClientHandshake::new(vec![], vec![]))
    }

    #[test]
    fn host_header_omits_default_port() {
        let builder = Connection::builder("ws://example.com/chat".parse().unwrap());
        let target = target_for(&builder).unwrap();
        assert_eq!(target.headers.get("Host"), Some("example.com"));
        assert_eq!(target.port, 80);
        assert_eq!(target.resource, "/chat");

        let builder = Connection::builder("ws://example.com:8080".parse().unwrap());
        let target = target_for(&builder).unwrap();
        assert_eq!(target.headers.get("Host"), Some("example.com:8080"));
        assert_eq!(target.resource, "/");
    }

    #[test]
    fn query_params_are_encoded_and_appended() {
        let builder = Connection::builder("ws://example.com/feed?v=1".parse().unwrap())
            .add_query_param("token", "a b&c")
            .add_query_param("encoding", "json");
        let target = target_for(&builder).unwrap();
        assert_eq!(target.resource, "/feed?v=1&token=a%20b%26c&encoding=json");
    }

    #[test]
    fn user_info_becomes_basic_auth() {
        let builder = Connection::builder("ws://Aladdin:open%20sesame@example.com/".parse().unwrap());
        let target = target_for(&builder).unwrap();
        assert_eq!(
            target.headers.get("Authorization"),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
        assert_eq!(target.headers.get("Host"), Some("example.com"));

        let explicit = Connection::builder("ws://user:pass@example.com/".parse().unwrap())
            .auth_header("Bearer token");
        let target = target_for(&explicit).unwrap();
        assert_eq!(target.headers.get("Authorization"), Some("Bearer token"));
    }

    #[test]
    fn optional_headers() {
        let builder = Connection::builder("ws://example.com/".parse().unwrap())
            .origin("https://example.com")
            .add_cookie("a=1")
            .add_cookie("b=2")
            .add_header("X-Trace", "abc")
            .user_agent(None);
        let target = target_for(&builder).unwrap();
        assert_eq!(target.headers.get("Origin"), Some("https://example.com"));
        assert_eq!(target.headers.get("Cookie"), Some("a=1; b=2"));
        assert_eq!(target.headers.get("X-Trace"), Some("abc"));
        assert!(!target.headers.contains("User-Agent"));
    }

    #[test]
    fn only_plain_ws_is_supported() {
        for uri in ["wss://example.com/", "http://example.com/", "/relative"] {
            let builder = Connection::builder(uri.parse().unwrap());
            assert!(matches!(
                target_for(&builder),
                Err(ConnectionError::InvalidUri(_))
            ));
        }
    }
}
