//! Pluggable WebSocket extensions.
//!
//! The crate ships no extension of its own; these traits are the seam a
//! compression or other frame-transforming extension plugs into.

use std::fmt;
use std::sync::Arc;

use crate::codec::WebsocketFrame;
use crate::errors::{HandshakeError, WebsocketCodecError};

/// One `name[=value]` parameter of an extension offer.
pub type ExtensionParameter = (String, Option<String>);

/// An extension name and its parameters, as found in `Sec-WebSocket-Extensions`.
pub type ExtensionHeader = (String, Vec<ExtensionParameter>);

/// A negotiated extension, applied to every frame of a connection.
///
/// `encode` runs under the connection's write lock and `decode` on the
/// reading task only, so implementations keeping per-direction state can use
/// a lock per direction without contention.
pub trait Extension: Send + Sync + fmt::Debug {
    /// Registered extension name.
    fn name(&self) -> &str;

    /// Transforms an incoming frame.
    ///
    /// # Errors
    /// Any error fails the connection.
    fn decode(
        &self,
        frame: WebsocketFrame,
        max_size: Option<usize>,
    ) -> Result<WebsocketFrame, WebsocketCodecError>;

    /// Transforms an outgoing frame.
    ///
    /// # Errors
    /// Any error fails the connection.
    fn encode(&self, frame: WebsocketFrame) -> Result<WebsocketFrame, WebsocketCodecError>;
}

/// Client side of an extension negotiation.
pub trait ClientExtensionFactory: Send + Sync {
    /// Registered extension name.
    fn name(&self) -> &str;

    /// Parameters offered in the request.
    fn request_params(&self) -> Vec<ExtensionParameter>;

    /// Checks the parameters the server accepted and builds the extension.
    ///
    /// `accepted` holds the extensions already negotiated, in order.
    ///
    /// # Errors
    /// A [`HandshakeError`] when the parameters are unacceptable; the client
    /// then tries the next factory with the same name.
    fn process_response_params(
        &self,
        params: &[ExtensionParameter],
        accepted: &[Arc<dyn Extension>],
    ) -> Result<Arc<dyn Extension>, HandshakeError>;
}

/// Server side of an extension negotiation.
pub trait ServerExtensionFactory: Send + Sync {
    /// Registered extension name.
    fn name(&self) -> &str;

    /// Checks the parameters a client offered and returns the parameters to
    /// answer with, along with the extension.
    ///
    /// # Errors
    /// A [`HandshakeError`] declines this offer.
    fn process_request_params(
        &self,
        params: &[ExtensionParameter],
        accepted: &[Arc<dyn Extension>],
    ) -> Result<(Vec<ExtensionParameter>, Arc<dyn Extension>), HandshakeError>;
}
