//! Hub configuration: defaults and validation.
//!
//! The binary layers `BB_HUB_*` environment variables and CLI flags over
//! these defaults.

use std::time::Duration;

use crate::server::HubError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port the hub listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 5100;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 45;

/// Hub configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Interface to bind to
    pub host: String,
    /// Port to bind to; 0 picks any free port
    pub port: u16,
    /// Outbound messages buffered per client before new ones are dropped
    pub queue_capacity: usize,
    /// Interval between WebSocket pings sent to each client
    pub heartbeat_interval: Duration,
    /// A client silent for this long is disconnected
    pub idle_timeout: Duration,
    /// Log every frame (except heartbeats) at info level
    pub log_all_messages: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            log_all_messages: false,
        }
    }
}

impl HubConfig {
    /// Loopback on an ephemeral port, for embedding in tests.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.queue_capacity == 0 {
            return Err(HubError::Config("queue_capacity must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(HubError::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.idle_timeout <= self.heartbeat_interval {
            return Err(HubError::Config(
                "idle_timeout must be longer than heartbeat_interval".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.port, 5100);
        assert_eq!(config.bind_addr(), "127.0.0.1:5100");
        assert_eq!(config.queue_capacity, 256);
        assert!(!config.log_all_messages);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ephemeral_port() {
        assert_eq!(HubConfig::ephemeral().port, 0);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        };
        assert!(matches!(config.validate(), Err(HubError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_short_idle_timeout() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
