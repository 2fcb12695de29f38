use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Transport configuration.
///
/// Plain values with documented defaults. Every field may be omitted when the
/// configuration is loaded from JSON.
///
/// # Default Configuration
///
/// - `listen_host`: "0.0.0.0"
/// - `listen_port`: 0 (the OS picks an ephemeral port)
/// - `keepalive_enabled`: true
/// - `keepalive_time_ms`: 30000
/// - `keepalive_interval_ms`: 1000
/// - `max_retries`: 10
/// - `retry_delay_ms`: 1000
/// - `frame_buffer_size`: 10 KiB
/// - `connect_timeout_ms`: 5000
/// - `handshake_timeout_ms`: 5000
///
/// # Example
///
/// ```rust
/// use duplex_common::TransportConfig;
///
/// let config = TransportConfig::default()
///     .with_max_retries(3)
///     .with_retry_delay_ms(250);
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address the listener binds to
    pub listen_host: String,
    /// Port to listen on; 0 lets the OS choose
    pub listen_port: u16,
    /// Whether TCP keepalive is enabled on every socket
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe
    pub keepalive_time_ms: u64,
    /// Interval between keepalive probes
    pub keepalive_interval_ms: u64,
    /// Reconnect attempts made by a client-side connection before giving up
    pub max_retries: u32,
    /// Sleep between two reconnect attempts
    pub retry_delay_ms: u64,
    /// Read and write buffer size of each connection, in bytes
    pub frame_buffer_size: usize,
    /// Timeout for establishing one TCP connection
    pub connect_timeout_ms: u64,
    /// Timeout for the identity exchange on a fresh socket
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0,
            keepalive_enabled: true,
            keepalive_time_ms: 30000,
            keepalive_interval_ms: 1000,
            max_retries: 10,
            retry_delay_ms: 1000,
            frame_buffer_size: 10 * 1024,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    /// Loads a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the transport cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.parse::<std::net::IpAddr>().is_err() {
            return Err(TransportError::Configuration(format!(
                "listen_host '{}' is not an IP address",
                self.listen_host
            )));
        }
        if self.frame_buffer_size == 0 {
            return Err(TransportError::Configuration(
                "frame_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(TransportError::Configuration(
                "connect and handshake timeouts must be greater than zero".to_string(),
            ));
        }
        if self.keepalive_enabled && self.keepalive_time_ms == 0 {
            return Err(TransportError::Configuration(
                "keepalive_time_ms must be greater than zero when keepalive is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_keepalive(mut self, enabled: bool, time_ms: u64, interval_ms: u64) -> Self {
        self.keepalive_enabled = enabled;
        self.keepalive_time_ms = time_ms;
        self.keepalive_interval_ms = interval_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_frame_buffer_size(mut self, size: usize) -> Self {
        self.frame_buffer_size = size;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive(&self) -> KeepAlive {
        KeepAlive {
            enabled: self.keepalive_enabled,
            time: Duration::from_millis(self.keepalive_time_ms),
            interval: Duration::from_millis(self.keepalive_interval_ms),
        }
    }
}

/// OS-level keepalive parameters of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub enabled: bool,
    pub time: Duration,
    pub interval: Duration,
}
