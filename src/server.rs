//! WebSocket server: accepts TCP connections, runs the opening handshake and
//! hands each open connection to an application handler.
//!
//! Shutdown stops accepting, rejects handshakes still in flight with 503,
//! closes open connections with 1001 and waits for every handler.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::codec::EndpointType;
use crate::config::ConnectionConfig;
use crate::connection::server::handshake;
use crate::connection::{Connection, State};
use crate::errors::HandshakeError;
use crate::extensions::ServerExtensionFactory;
use crate::handshake::server::{ServerHandshake, SubprotocolSelector};
use crate::http11::{Headers, RawRequestMessage, USER_AGENT};
use crate::stream::Transport;

/// Hook run on each upgrade request before it is validated.
///
/// Returning [`HandshakeError::AbortHandshake`] answers with that response
/// instead; any other error rejects the request with its status.
pub type ProcessRequest =
    Arc<dyn Fn(&RawRequestMessage) -> Result<(), HandshakeError> + Send + Sync>;

/// Settings for accepted connections.
#[derive(Clone)]
pub struct ServerConfig {
    /// Limits and timeouts of each connection.
    pub connection: ConnectionConfig,
    /// Origin, extension and subprotocol negotiation.
    pub handshake: ServerHandshake,
    /// Request hook, see [`ProcessRequest`].
    pub process_request: Option<ProcessRequest>,
    /// Headers added to every `101` response.
    pub extra_headers: Headers,
    /// `Server` header value; `None` omits it.
    pub server_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            handshake: ServerHandshake::default(),
            process_request: None,
            extra_headers: Headers::new(),
            server_header: Some(USER_AGENT.to_owned()),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("connection", &self.connection)
            .field("handshake", &self.handshake)
            .field("process_request", &self.process_request.is_some())
            .field("extra_headers", &self.extra_headers)
            .field("server_header", &self.server_header)
            .finish()
    }
}

impl ServerConfig {
    /// Set the limits and timeouts applied to every accepted connection.
    #[must_use]
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Only admit these `Origin` values. `None` admits requests without one.
    #[must_use]
    pub fn with_origins(mut self, origins: Vec<Option<String>>) -> Self {
        self.handshake.origins = Some(origins);
        self
    }

    /// Offer an extension; the factory negotiates it per request.
    #[must_use]
    pub fn with_extension(mut self, factory: Arc<dyn ServerExtensionFactory>) -> Self {
        self.handshake
            .extensions
            .get_or_insert_with(Vec::new)
            .push(factory);
        self
    }

    /// Fail any handshake that requests extensions.
    #[must_use]
    pub fn without_extensions(mut self) -> Self {
        self.handshake.extensions = None;
        self
    }

    /// Set the supported subprotocols, in order of preference.
    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handshake.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the default subprotocol choice with `selector`.
    #[must_use]
    pub fn with_subprotocol_selector(mut self, selector: SubprotocolSelector) -> Self {
        self.handshake.select_subprotocol = Some(selector);
        self
    }

    /// Run `hook` on each upgrade request, see [`ProcessRequest`].
    #[must_use]
    pub fn with_process_request(mut self, hook: ProcessRequest) -> Self {
        self.process_request = Some(hook);
        self
    }

    /// Add a header to every `101` response.
    #[must_use]
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.extra_headers.insert(name, value);
        self
    }

    /// Set the `Server` header; `None` omits it.
    #[must_use]
    pub fn with_server_header(mut self, value: Option<String>) -> Self {
        self.server_header = value;
        self
    }
}

/// Unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ServerShared {
    config: ServerConfig,
    local_addr: SocketAddr,
    registry: Mutex<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    stop: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    close_started: AtomicBool,
    closed: CancellationToken,
}

impl ServerShared {
    fn is_serving(&self) -> bool {
        !self.stop.is_cancelled()
    }

    fn register(self: &Arc<Self>, connection: Connection) -> ConnectionGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry.lock().insert(id, connection);
        ConnectionGuard {
            id,
            shared: Arc::clone(self),
        }
    }

    async fn shutdown(self: Arc<Self>) {
        tracing::info!("server closing");
        self.stop.cancel();
        let accept = self.accept_task.lock().take();
        if let Some(accept) = accept {
            if let Err(e) = accept.await {
                tracing::error!(error = %e, "accept loop failed");
            }
        }

        let open: Vec<Connection> = self
            .registry
            .lock()
            .values()
            .filter(|connection| connection.state() == State::Open)
            .cloned()
            .collect();
        join_all(open.iter().map(|connection| connection.close(1001, ""))).await;

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("server closed");
        self.closed.cancel();
    }
}

/// Removes a connection from the registry when dropped.
struct ConnectionGuard {
    id: ConnectionId,
    shared: Arc<ServerShared>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.registry.lock().remove(&self.id);
    }
}

/// A running WebSocket server.
///
/// Dropping it stops accepting new connections; open ones run to completion.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("serving", &self.is_serving())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Binds `addr` and serves WebSocket connections with `handler`.
///
/// The handler receives each connection once its opening handshake succeeds.
/// When it returns, the connection is closed with 1000; when it panics, the
/// connection fails with 1011.
///
/// # Errors
/// Returns an error if the address cannot be bound.
pub async fn serve<H, Fut, A>(handler: H, addr: A, config: ServerConfig) -> std::io::Result<Server>
where
    H: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    A: ToSocketAddrs,
{
    let listener = TcpListener::bind(addr).await?;
    Server::from_listener(listener, handler, config)
}

impl Server {
    /// Serves connections accepted from an already bound listener.
    ///
    /// # Errors
    /// Returns an error if the listener's local address cannot be read.
    pub fn from_listener<H, Fut>(
        listener: TcpListener,
        handler: H,
        config: ServerConfig,
    ) -> std::io::Result<Self>
    where
        H: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(ServerShared {
            config,
            local_addr,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            accept_task: Mutex::new(None),
            close_started: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        tracing::info!(%local_addr, "server listening");
        let accept = tokio::spawn(accept_loop(shared.clone(), listener, Arc::new(handler)));
        *shared.accept_task.lock() = Some(accept);
        Ok(Self { shared })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Whether new connections are still accepted.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.shared.is_serving()
    }

    /// Number of connections currently tracked, including those still handshaking.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Shuts the server down and waits until it is closed.
    ///
    /// Calling it again only waits. Shutdown carries on if the returned
    /// future is dropped.
    pub async fn close(&self) {
        if !self.shared.close_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.shared.clone().shutdown());
        }
        self.wait_closed().await;
    }

    /// Resolves once a shutdown has completed.
    pub async fn wait_closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

async fn accept_loop<H, Fut>(shared: Arc<ServerShared>, listener: TcpListener, handler: Arc<H>)
where
    H: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            () = shared.stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let connection = Connection::new(
            Transport::new(stream),
            EndpointType::Server,
            shared.config.connection.clone(),
        );
        let guard = shared.register(connection.clone());
        let span = tracing::info_span!("conn", id = %guard.id, %peer);
        shared.tracker.spawn(
            handle_connection(shared.clone(), connection, guard, handler.clone())
                .instrument(span),
        );
    }
    tracing::debug!("stopped accepting connections");
}

async fn handle_connection<H, Fut>(
    shared: Arc<ServerShared>,
    connection: Connection,
    _guard: ConnectionGuard,
    handler: Arc<H>,
) where
    H: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = handshake(&connection, &shared.config, || shared.is_serving()).await {
        tracing::debug!(error = %e, "opening handshake failed");
        return;
    }
    tracing::info!(path = connection.path().unwrap_or("/"), "connection open");
    if !shared.is_serving() {
        if let Err(e) = connection.close(1001, "").await {
            tracing::debug!(error = %e, "closing handshake failed");
        }
        tracing::info!(code = connection.close_code(), "connection closed");
        return;
    }

    let session = connection.clone();
    let task = tokio::spawn(
        async move { handler(session).await }.instrument(tracing::Span::current()),
    );
    if let Err(e) = task.await {
        if e.is_panic() {
            tracing::error!("connection handler failed");
            connection.fail_connection(1011, "");
        }
    }
    if let Err(e) = connection.close(1000, "").await {
        tracing::debug!(error = %e, "closing handshake failed");
    }
    tracing::info!(code = connection.close_code(), "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_setters() {
        let config = ServerConfig::default()
            .with_connection_config(ConnectionConfig::default().with_max_queue(2))
            .with_subprotocols(["chat"])
            .without_extensions()
            .with_process_request(Arc::new(|_: &RawRequestMessage| Ok(())))
            .with_header("X-Served-By", "test")
            .with_server_header(None);
        assert_eq!(config.connection.max_queue, 2);
        assert_eq!(config.handshake.subprotocols, ["chat"]);
        assert!(config.handshake.extensions.is_none());
        assert!(config.process_request.is_some());
        assert_eq!(config.extra_headers.get("x-served-by"), Some("test"));
        assert_eq!(config.server_header, None);
        assert_eq!(
            ServerConfig::default().server_header.as_deref(),
            Some(USER_AGENT)
        );
    }
}
