//! Per-connection tuning knobs.

use std::time::Duration;

/// Limits and timeouts shared by client and server connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest accepted message, in bytes. `None` disables the limit.
    pub max_size: Option<usize>,
    /// Number of complete messages buffered before reading pauses.
    pub max_queue: usize,
    /// Bound on each step of the closing handshake.
    pub close_timeout: Duration,
    /// Bound on the opening handshake. `None` waits forever.
    pub open_timeout: Option<Duration>,
    /// Interval between keepalive pings. `None` disables keepalive.
    pub ping_interval: Option<Duration>,
    /// How long a keepalive ping may wait for its pong.
    pub ping_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_size: Some(1 << 20),
            max_queue: 32,
            close_timeout: Duration::from_secs(10),
            open_timeout: Some(Duration::from_secs(10)),
            ping_interval: Some(Duration::from_secs(20)),
            ping_timeout: Some(Duration::from_secs(20)),
        }
    }
}

impl ConnectionConfig {
    /// Set the largest accepted message; `None` removes the limit.
    #[must_use]
    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set how many complete messages are buffered. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue.max(1);
        self
    }

    /// Set the bound on each step of the closing handshake.
    #[must_use]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Set the bound on the opening handshake.
    #[must_use]
    pub fn with_open_timeout(mut self, open_timeout: Option<Duration>) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Set the keepalive interval; `None` disables keepalive.
    #[must_use]
    pub fn with_ping_interval(mut self, ping_interval: Option<Duration>) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Set how long a keepalive ping waits for its pong.
    #[must_use]
    pub fn with_ping_timeout(mut self, ping_timeout: Option<Duration>) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ConnectionConfig::default()
            .with_max_size(None)
            .with_max_queue(0)
            .with_ping_interval(None);
        assert_eq!(config.max_size, None);
        assert_eq!(config.max_queue, 1);
        assert_eq!(config.ping_interval, None);
        assert_eq!(config.close_timeout, Duration::from_secs(10));
    }

    #[test]
    fn every_setter_lands_in_its_field() {
        let config = ConnectionConfig::default()
            .with_max_size(Some(64))
            .with_max_queue(4)
            .with_close_timeout(Duration::from_secs(1))
            .with_open_timeout(None)
            .with_ping_interval(Some(Duration::from_secs(2)))
            .with_ping_timeout(None);
        assert_eq!(
            config,
            ConnectionConfig {
                max_size: Some(64),
                max_queue: 4,
                close_timeout: Duration::from_secs(1),
                open_timeout: None,
                ping_interval: Some(Duration::from_secs(2)),
                ping_timeout: None,
            }
        );
    }
}
