//! Parsers and builders for the handshake header grammars (RFC 7230, RFC 6455).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::errors::HandshakeError;
use crate::extensions::{ExtensionHeader, ExtensionParameter};

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_tchar)
}

struct Cursor<'a> {
    name: &'static str,
    header: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(name: &'static str, header: &'a str) -> Self {
        Self {
            name,
            header,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.header.as_bytes().get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.header.len()
    }

    fn error(&self, error: &'static str) -> HandshakeError {
        HandshakeError::InvalidHeaderFormat {
            name: self.name.to_owned(),
            error,
            header: self.header.to_owned(),
            pos: self.pos,
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8, error: &'static str) -> Result<(), HandshakeError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(error))
        }
    }

    fn token(&mut self) -> Result<&'a str, HandshakeError> {
        let start = self.pos;
        while self.peek().is_some_and(is_tchar) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected token"));
        }
        Ok(&self.header[start..self.pos])
    }

    fn quoted_string(&mut self) -> Result<String, HandshakeError> {
        self.expect(b'"', "expected quoted string")?;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted string")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b) if b == b'\t' || b >= 0x20 => {
                            out.push(b);
                            self.pos += 1;
                        }
                        _ => return Err(self.error("invalid quoted pair")),
                    }
                }
                Some(b) if b == b'\t' || (b >= 0x20 && b != 0x7F) => {
                    out.push(b);
                    self.pos += 1;
                }
                Some(_) => return Err(self.error("invalid character in quoted string")),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// `#item` from RFC 7230 section 7: empty elements are tolerated.
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, HandshakeError>,
    ) -> Result<Vec<T>, HandshakeError> {
        self.skip_separators();
        let mut items = Vec::new();
        while !self.at_end() {
            items.push(item(self)?);
            self.skip_ows();
            if self.at_end() {
                break;
            }
            self.expect(b',', "expected comma")?;
            self.skip_separators();
        }
        Ok(items)
    }

    fn skip_separators(&mut self) {
        loop {
            self.skip_ows();
            if self.peek() == Some(b',') {
                self.pos += 1;
            } else {
                break;
            }
        }
    }
}

/// Parses a `Connection` header into its connection options.
///
/// # Errors
/// [`HandshakeError::InvalidHeaderFormat`] on a malformed value.
pub fn parse_connection(header: &str) -> Result<Vec<String>, HandshakeError> {
    Cursor::new("Connection", header).list(|c| c.token().map(str::to_owned))
}

/// Parses an `Upgrade` header into its protocols (`name[/version]`).
///
/// # Errors
/// [`HandshakeError::InvalidHeaderFormat`] on a malformed value.
pub fn parse_upgrade(header: &str) -> Result<Vec<String>, HandshakeError> {
    Cursor::new("Upgrade", header).list(|c| {
        let start = c.pos;
        c.token()?;
        if c.peek() == Some(b'/') {
            c.pos += 1;
            c.token()?;
        }
        Ok(c.header[start..c.pos].to_owned())
    })
}

/// Parses a `Sec-WebSocket-Extensions` header.
///
/// Quoted parameter values must unquote to a token.
///
/// # Errors
/// [`HandshakeError::InvalidHeaderFormat`] on a malformed value.
pub fn parse_extension(header: &str) -> Result<Vec<ExtensionHeader>, HandshakeError> {
    Cursor::new("Sec-WebSocket-Extensions", header).list(|c| {
        let name = c.token()?.to_owned();
        let mut params = Vec::new();
        loop {
            c.skip_ows();
            if c.peek() != Some(b';') {
                break;
            }
            c.pos += 1;
            c.skip_ows();
            params.push(extension_param(c)?);
        }
        Ok((name, params))
    })
}

fn extension_param(c: &mut Cursor<'_>) -> Result<ExtensionParameter, HandshakeError> {
    let name = c.token()?.to_owned();
    c.skip_ows();
    if c.peek() != Some(b'=') {
        return Ok((name, None));
    }
    c.pos += 1;
    c.skip_ows();
    let value = if c.peek() == Some(b'"') {
        let start = c.pos;
        let value = c.quoted_string()?;
        if !is_token(&value) {
            c.pos = start;
            return Err(c.error("invalid quoted header content"));
        }
        value
    } else {
        c.token()?.to_owned()
    };
    Ok((name, Some(value)))
}

/// Builds a `Sec-WebSocket-Extensions` header value.
#[must_use]
pub fn build_extension(extensions: &[ExtensionHeader]) -> String {
    extensions
        .iter()
        .map(|(name, params)| {
            let mut item = name.clone();
            for (key, value) in params {
                item.push_str("; ");
                item.push_str(key);
                match value {
                    Some(v) if is_token(v) => {
                        item.push('=');
                        item.push_str(v);
                    }
                    Some(v) => {
                        item.push_str("=\"");
                        item.push_str(&v.replace('\\', "\\\\").replace('"', "\\\""));
                        item.push('"');
                    }
                    None => {}
                }
            }
            item
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses a `Sec-WebSocket-Protocol` header.
///
/// # Errors
/// [`HandshakeError::InvalidHeaderFormat`] on a malformed value.
pub fn parse_subprotocol(header: &str) -> Result<Vec<String>, HandshakeError> {
    Cursor::new("Sec-WebSocket-Protocol", header).list(|c| c.token().map(str::to_owned))
}

/// Builds a `Sec-WebSocket-Protocol` header value.
#[must_use]
pub fn build_subprotocol<S: AsRef<str>>(subprotocols: &[S]) -> String {
    subprotocols
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds an `Authorization` header value for HTTP Basic Auth.
#[must_use]
pub fn build_authorization_basic(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
}
