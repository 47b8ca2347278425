//! Session configuration

use canopy_core::{CrcPolicy, EngineConfig, ResyncPolicy};
use std::time::Duration;

/// Configuration for an instrument session.
///
/// The heartbeat keeps the BLE link from idling out: the instrument drops
/// connections that stay silent, so the session periodically re-requests a
/// cheap node.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Advertised-name filter applied on top of the service UUID match
    pub device_name_filter: Option<String>,
    /// How long to scan before giving up (terminal)
    pub scan_timeout: Duration,
    /// Node re-requested by the heartbeat
    pub heartbeat_path: String,
    /// Delay between heartbeat requests
    pub heartbeat_interval: Duration,
    /// Checksum mismatch severity
    pub crc_policy: CrcPolicy,
    /// Unknown op-code handling
    pub resync_policy: ResyncPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name_filter: None,
            scan_timeout: Duration::from_secs(10),
            heartbeat_path: "PCB_VERSION".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            crc_policy: CrcPolicy::default(),
            resync_policy: ResyncPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub(crate) fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            crc_policy: self.crc_policy,
            resync_policy: self.resync_policy,
        }
    }
}

/// Builder for [`Session`](crate::Session)
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only connect to instruments whose advertised name contains `filter`
    pub fn device_name_filter(mut self, filter: &str) -> Self {
        self.config.device_name_filter = Some(filter.to_string());
        self
    }

    /// Override the scan timeout
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.config.scan_timeout = timeout;
        self
    }

    /// Node path the heartbeat re-requests
    pub fn heartbeat_path(mut self, path: &str) -> Self {
        self.config.heartbeat_path = path.to_string();
        self
    }

    /// Delay between heartbeat requests
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Treat a tree checksum mismatch as fatal
    pub fn strict_checksum(mut self) -> Self {
        self.config.crc_policy = CrcPolicy::Abort;
        self
    }

    /// Skip single bytes to resynchronize after an unknown op-code
    pub fn skip_byte_resync(mut self) -> Self {
        self.config.resync_policy = ResyncPolicy::SkipByte;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Scan for an instrument over BLE, connect and start the session.
    pub async fn connect(self) -> crate::Result<crate::Session> {
        crate::Session::connect_ble(self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_instrument_expectations() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_path, "PCB_VERSION");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.scan_timeout, Duration::from_secs(10));
        assert_eq!(config.crc_policy, CrcPolicy::Warn);
        assert_eq!(config.resync_policy, ResyncPolicy::Stall);
    }

    #[test]
    fn builder_overrides_flow_through() {
        let builder = SessionBuilder::new()
            .device_name_filter("Mooshimeter")
            .heartbeat_path("ADMIN:DIAG")
            .heartbeat_interval(Duration::from_secs(5))
            .strict_checksum()
            .skip_byte_resync();
        let config = builder.config();
        assert_eq!(config.device_name_filter.as_deref(), Some("Mooshimeter"));
        assert_eq!(config.heartbeat_path, "ADMIN:DIAG");
        assert_eq!(config.crc_policy, CrcPolicy::Abort);
        assert_eq!(config.resync_policy, ResyncPolicy::SkipByte);
    }
}
