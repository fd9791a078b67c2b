use crate::transport::{BrowserIdentity, JidFilter};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Tunables for the connection lifecycle. One instance per process, shared by
/// every session supervised by the same [`crate::ConnectionManager`].
#[derive(Clone)]
pub struct WbotConfig {
    pub browser: BrowserIdentity,
    /// Skip version resolution entirely when set.
    pub version_override: Option<(u32, u32, u32)>,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Drop inbound events from matching JIDs at the transport.
    pub ignore_jid: Option<JidFilter>,
    /// Opaque host-owned retry cache handed to every transport.
    pub message_retry_cache: Option<Arc<dyn Any + Send + Sync>>,

    /// How long an unscanned QR code stays valid before the session is
    /// treated as transiently disconnected.
    pub qr_timeout: Duration,

    /// Sliding window for mid-session key-integrity errors.
    pub key_error_window: Duration,
    /// Errors within the window before escalating from retry to full reset.
    pub key_error_threshold: u32,
    /// Fixed reconnect delay after a credential wipe.
    pub key_reset_delay: Duration,

    /// Linear backoff base for stream-level faults (base x attempt number).
    pub stream_fault_base: Duration,
    pub stream_fault_cap: Duration,

    /// Escalating delays for the first rate-limited closes.
    pub rate_limit_delays: [Duration; 5],
    /// Rate-limited closes tolerated before a full credential reset.
    pub rate_limit_max: u32,

    /// Lower bound for any scheduled reconnect wait.
    pub reconnect_floor: Duration,
    /// Minimum spacing between two attempts for the same session.
    pub min_attempt_interval: Duration,
    /// Exponential backoff exponent cap (2^n seconds plateau).
    pub max_backoff_exponent: u32,
}

impl Default for WbotConfig {
    fn default() -> Self {
        Self {
            browser: BrowserIdentity::default(),
            version_override: None,
            connect_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(25),
            ignore_jid: None,
            message_retry_cache: None,
            qr_timeout: Duration::from_secs(120),
            key_error_window: Duration::from_secs(120),
            key_error_threshold: 3,
            key_reset_delay: Duration::from_secs(10),
            stream_fault_base: Duration::from_secs(5),
            stream_fault_cap: Duration::from_secs(30),
            rate_limit_delays: [
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            rate_limit_max: 5,
            reconnect_floor: Duration::from_secs(5),
            min_attempt_interval: Duration::from_secs(10),
            max_backoff_exponent: 6,
        }
    }
}
