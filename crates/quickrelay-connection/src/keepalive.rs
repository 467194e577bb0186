use std::time::Duration;

/// Keepalive timing for one physical connection
///
/// The writer sends an empty data frame after `interval` without any outgoing
/// frame; the reader gives up on the peer after `timeout` without any incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl KeepaliveConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// A timeout shorter than the interval would drop healthy idle peers
    pub fn is_valid(&self) -> bool {
        !self.interval.is_zero() && self.timeout > self.interval
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}
