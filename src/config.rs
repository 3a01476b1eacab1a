//! Session configuration and builder

use crate::error::{IscsiError, ScsiResult};
use crate::url::TargetUrl;
use std::time::Duration;

/// Login attempts before `connect` gives up
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 20;
/// Attempts for a read that keeps hitting the transient signature
pub const DEFAULT_READ_ATTEMPTS: u32 = 10;

/// Settings shared by a session and everything bound to it
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initiator name (IQN/EUI/NAA)
    pub initiator_name: String,
    pub target: TargetUrl,
    pub connect_attempts: u32,
    /// First backoff delay between login attempts
    pub retry_delay: Duration,
    /// Cap on any single backoff delay
    pub max_retry_delay: Duration,
    pub read_attempts: u32,
    /// Socket read/write timeout
    pub io_timeout: Duration,
    /// Upper bound on one readiness wait in the event pump
    pub pump_poll_timeout: Duration,
    /// Sleep when the transport has no pending events
    pub pump_idle_delay: Duration,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Delay before login attempt `attempt + 1`: exponential backoff from
    /// `retry_delay` plus jitter, capped at `max_retry_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = self
            .retry_delay
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
        let jitter_ms = (self.retry_delay.as_millis() / 2) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        exp.saturating_add(jitter).min(self.max_retry_delay)
    }
}

/// Builder for [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    initiator_name: Option<String>,
    target_url: Option<String>,
    connect_attempts: u32,
    retry_delay: Duration,
    max_retry_delay: Duration,
    read_attempts: u32,
    io_timeout: Duration,
    pump_poll_timeout: Duration,
    pump_idle_delay: Duration,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfigBuilder {
    fn new() -> Self {
        Self {
            initiator_name: None,
            target_url: None,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(500),
            read_attempts: DEFAULT_READ_ATTEMPTS,
            io_timeout: Duration::from_secs(10),
            pump_poll_timeout: Duration::from_millis(1000),
            pump_idle_delay: Duration::from_millis(10),
        }
    }

    /// Set the initiator name
    ///
    /// Example: iqn.2024-10.libiscsi:go
    pub fn initiator_name(mut self, name: &str) -> Self {
        self.initiator_name = Some(name.to_string());
        self
    }

    /// Set the target URL
    ///
    /// Example: iscsi://127.0.0.1:3260/iqn.2025-12.local:storage.disk1/0
    pub fn target_url(mut self, url: &str) -> Self {
        self.target_url = Some(url.to_string());
        self
    }

    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn pump_poll_timeout(mut self, timeout: Duration) -> Self {
        self.pump_poll_timeout = timeout;
        self
    }

    pub fn pump_idle_delay(mut self, delay: Duration) -> Self {
        self.pump_idle_delay = delay;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> ScsiResult<SessionConfig> {
        let initiator_name = self
            .initiator_name
            .ok_or_else(|| IscsiError::Config("initiator_name is required".to_string()))?;

        if !["iqn.", "eui.", "naa."].iter().any(|p| initiator_name.starts_with(p)) {
            return Err(IscsiError::Config(
                "initiator_name must be in IQN format (e.g., iqn.2024-10.libiscsi:go)".to_string(),
            ));
        }

        let target_url = self
            .target_url
            .ok_or_else(|| IscsiError::Config("target_url is required".to_string()))?;
        let target = TargetUrl::parse(&target_url)?;

        if self.connect_attempts == 0 {
            return Err(IscsiError::Config("connect_attempts must be at least 1".to_string()));
        }
        if self.read_attempts == 0 {
            return Err(IscsiError::Config("read_attempts must be at least 1".to_string()));
        }
        if self.io_timeout.is_zero() {
            // A zero socket timeout is rejected by std::net
            return Err(IscsiError::Config("io_timeout must be non-zero".to_string()));
        }

        Ok(SessionConfig {
            initiator_name,
            target,
            connect_attempts: self.connect_attempts,
            retry_delay: self.retry_delay,
            max_retry_delay: self.max_retry_delay,
            read_attempts: self.read_attempts,
            io_timeout: self.io_timeout,
            pump_poll_timeout: self.pump_poll_timeout,
            pump_idle_delay: self.pump_idle_delay,
        })
    }
}
