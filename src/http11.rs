//! The minimal slice of HTTP/1.1 needed for the upgrade exchange.
//!
//! Header names and values are kept as text decoded byte-for-byte (latin-1),
//! so nothing a peer sends is ever rejected for not being UTF-8.

use std::fmt;

use http::{StatusCode, Version};

/// Maximum number of headers accepted in a request or response head.
pub const MAX_HEADERS: usize = 128;

/// Maximum length of a request line, status line or header line.
pub const MAX_LINE: usize = 8190;

/// Default `User-Agent` and `Server` header value.
pub const USER_AGENT: &str = concat!("allagan-wsproto/", env!("CARGO_PKG_VERSION"));

/// An ordered, case-insensitive, multi-value header map.
///
/// Keys may repeat; lookups preserve declaration order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

/// Returned by [`Headers::get_single`] when a header appears several times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipleValues;

impl Headers {
    /// An empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any earlier value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Appends a header unless one with the same name is already present.
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.insert(name, value);
        }
    }

    /// First value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name`, in declaration order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The single value for `name`.
    ///
    /// # Errors
    /// Returns [`MultipleValues`] when the header appears more than once.
    pub fn get_single(&self, name: &str) -> Result<Option<&str>, MultipleValues> {
        let mut values = self
            .entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str());
        let first = values.next();
        if values.next().is_some() {
            return Err(MultipleValues);
        }
        Ok(first)
    }

    /// Whether at least one header named `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over `(name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Number of header lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut String> {
        self.entries.last_mut().map(|(_, value)| value)
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        headers.extend(iter);
        headers
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Headers {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequestMessage {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target.
    pub path: String,
    /// Protocol version.
    pub version: Version,
    /// Request headers.
    pub headers: Headers,
}

/// A parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponseMessage {
    /// Protocol version.
    pub version: Version,
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Response headers.
    pub headers: Headers,
}

/// Decodes bytes one-to-one into chars so that any header byte survives.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

pub(crate) fn parse_version(raw: &str) -> Option<Version> {
    match raw {
        "HTTP/1.1" => Some(Version::HTTP_11),
        "HTTP/1.0" => Some(Version::HTTP_10),
        _ => None,
    }
}

/// Formats a request head ready to be written on the wire.
pub(crate) fn serialize_request(path: &str, headers: &Headers) -> Vec<u8> {
    let mut out = format!("GET {path} HTTP/1.1\r\n").into_bytes();
    serialize_headers(&mut out, headers);
    out
}

/// Formats a response head, plus body if any, ready to be written on the wire.
pub(crate) fn serialize_response(status: StatusCode, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    serialize_headers(&mut out, headers);
    out.extend_from_slice(body);
    out
}

fn serialize_headers(out: &mut Vec<u8>, headers: &Headers) {
    for (name, value) in headers.iter() {
        out.extend(name.chars().map(latin1_byte));
        out.extend_from_slice(b": ");
        out.extend(value.chars().map(latin1_byte));
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "Characters above U+00FF are replaced first"
)]
fn latin1_byte(c: char) -> u8 {
    if u32::from(c) <= 0xFF { c as u8 } else { b'?' }
}

/// Current time formatted for the `Date` header.
pub(crate) fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_case_insensitive_and_ordered() {
        let headers: Headers = [
            ("Connection", "keep-alive"),
            ("Host", "example.com"),
            ("connection", "Upgrade"),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            headers.get_all("CONNECTION").collect::<Vec<_>>(),
            ["keep-alive", "Upgrade"]
        );
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.get_single("connection"), Err(MultipleValues));
        assert_eq!(headers.get_single("Origin"), Ok(None));
    }

    #[test]
    fn values_outlive_the_name_they_were_looked_up_by() {
        let headers: Headers = [("Sec-WebSocket-Protocol", "chat")].into_iter().collect();
        let value = {
            let name = String::from("sec-websocket-protocol");
            headers.get(&name)
        };
        let single = {
            let name = String::from("SEC-WEBSOCKET-PROTOCOL");
            headers.get_single(&name)
        };
        assert_eq!(value, Some("chat"));
        assert_eq!(single, Ok(Some("chat")));
    }

    #[test]
    fn serialized_response_has_status_line_and_body() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", "3");
        let raw = serialize_response(StatusCode::FORBIDDEN, &headers, b"no\n");
        assert_eq!(
            raw,
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 3\r\n\r\nno\n".to_vec()
        );
    }

    #[test]
    fn latin1_survives_round_trip() {
        let raw = [b'a', 0xE9, 0xFF];
        let text = latin1(&raw);
        let mut headers = Headers::new();
        headers.insert("X-Raw", text);
        let wire = serialize_request("/", &headers);
        assert!(wire.windows(3).any(|w| w == raw));
    }

    #[test]
    fn date_looks_like_imf_fixdate() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), 29);
    }
}
