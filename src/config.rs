use std::time::Duration;

/// Session-wide tunables.
///
/// Replaces the mutable process-wide singletons (timeout, debug sink, extra
/// delay) that a naive port would carry over: every value a session needs is
/// passed in once at construction instead.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket dial + handshake timeout, for both the main and voice gateways.
    pub ws_timeout: Duration,
    /// How long `Join` waits for the paired `VoiceServerUpdate`/`VoiceStateUpdate` events.
    pub wait_duration: Duration,
    /// Delay between `Join` retries when the paired events don't arrive in time.
    pub retry_delay: Duration,
    /// Maximum number of `Join` retries before giving up.
    pub max_retry: u32,
    /// Clock-skew compensation added to `X-RateLimit-Reset`-derived deadlines.
    pub extra_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ws_timeout: Duration::from_secs(25),
            wait_duration: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            max_retry: 3,
            extra_delay: Duration::from_millis(250),
        }
    }
}
