//! Client tuning knobs.

use std::time::Duration;

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the link is declared dead
    pub max_reconnect_attempts: u32,
    /// Default confirmation timeout for correlated requests
    pub operation_timeout: Duration,
    /// Timeout for interactive property edits (drag end, resize end, form fields)
    pub interactive_timeout: Duration,
    /// Retry ceiling per operation
    pub max_retries: u32,
    /// Period of the `verify_version` drift check
    pub version_check_interval: Duration,
    /// How long an echo marker outlives its confirmation
    pub echo_grace: Duration,
    /// Minimum spacing between two `request_sync` sends while one is outstanding
    pub sync_request_cooldown: Duration,
    /// Buffered events before slow consumers start losing them
    pub event_capacity: usize,
    /// Ask for a snapshot on open when the local collection is empty
    pub request_sync_on_connect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            operation_timeout: Duration::from_millis(3000),
            interactive_timeout: Duration::from_millis(1000),
            max_retries: 3,
            version_check_interval: Duration::from_secs(30),
            echo_grace: Duration::from_millis(100),
            sync_request_cooldown: Duration::from_secs(5),
            event_capacity: 256,
            request_sync_on_connect: true,
        }
    }
}
