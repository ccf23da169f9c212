//! Session tunables.

use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::retry::RetryPolicy;

/// Timeouts and retry parameters for a client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each outbound request.
    pub request_timeout: Duration,
    /// Deadline for each per-address connect attempt.
    pub connect_timeout: Duration,
    /// How many times to retry after losing an established connection.
    pub reconnect_attempts: u32,
    /// Pause between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Retry policy for DNS resolution during dialing.
    pub dns_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
            dns_retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Override the request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the reconnect loop bounds.
    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    /// Override the per-address connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            request_timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            dns_retry: self.dns_retry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_guidance() {
        let config = SessionConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect_attempts, 10);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn builders_override_fields() {
        let config = SessionConfig::default()
            .with_request_timeout(Duration::from_secs(5))
            .with_reconnect(3, Duration::from_millis(100))
            .with_connect_timeout(Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }
}
