//! Session configuration

use std::time::Duration;

use kite_proto::MAX_FRAME_SIZE;

/// Configuration for a flock session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flock signaling endpoint (e.g. "wss://flock.example.com/signal")
    pub endpoint: String,

    /// Appliance to connect to. When unset the session starts in discovery
    /// and asks the caller for a name.
    pub appliance: Option<String>,

    /// Timeout for each application-open request (defaults to 30 seconds)
    pub app_open_timeout: Duration,

    /// First datagram connect retry interval; doubles after each send
    /// (defaults to 100 ms)
    pub connect_retry_base: Duration,

    /// Total ConnectSocket sends for a datagram endpoint before giving up
    /// (defaults to 7)
    pub connect_retry_sends: u8,

    /// Maximum transport message size, frame header included
    /// (defaults to 32768 bytes)
    pub max_frame_size: usize,

    /// Outstanding buffered bytes above which a streamed send pauses until
    /// the channel signals buffered-low (defaults to 4096)
    pub low_buffer_watermark: usize,

    /// Bytes sent in one synchronous burst before a streamed send yields to
    /// the host (defaults to 8192)
    pub burst_yield_bytes: usize,
}

impl SessionConfig {
    /// Create a configuration with the protocol defaults.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            appliance: None,
            app_open_timeout: Duration::from_secs(30),
            connect_retry_base: Duration::from_millis(100),
            connect_retry_sends: 7,
            max_frame_size: MAX_FRAME_SIZE,
            low_buffer_watermark: 4096,
            burst_yield_bytes: 8192,
        }
    }

    /// Set the appliance name, skipping discovery.
    pub fn with_appliance(mut self, name: impl Into<String>) -> Self {
        self.appliance = Some(name.into());
        self
    }

    /// Set the per-request application-open timeout.
    pub fn with_app_open_timeout(mut self, timeout: Duration) -> Self {
        self.app_open_timeout = timeout;
        self
    }

    /// Set the datagram connect retry cadence.
    pub fn with_connect_retry(mut self, base: Duration, sends: u8) -> Self {
        self.connect_retry_base = base;
        self.connect_retry_sends = sends;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SessionConfig::new("wss://flock.test");
        assert_eq!(config.endpoint, "wss://flock.test");
        assert_eq!(config.appliance, None);
        assert_eq!(config.app_open_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_retry_base, Duration::from_millis(100));
        assert_eq!(config.connect_retry_sends, 7);
        assert_eq!(config.max_frame_size, 32 * 1024);
        assert_eq!(config.low_buffer_watermark, 4096);
        assert_eq!(config.burst_yield_bytes, 8192);
    }

    #[test]
    fn builders_chain() {
        let config = SessionConfig::new("wss://flock.test")
            .with_appliance("garage")
            .with_app_open_timeout(Duration::from_secs(5))
            .with_connect_retry(Duration::from_millis(50), 3);
        assert_eq!(config.appliance.as_deref(), Some("garage"));
        assert_eq!(config.app_open_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_retry_base, Duration::from_millis(50));
        assert_eq!(config.connect_retry_sends, 3);
    }
}
