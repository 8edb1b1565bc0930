//! Client connection configuration.

use std::time::Duration;

/// Configuration for one controller connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Covers TCP connect plus the wait for initial state.
    pub connect_timeout: Duration,
    /// Reconnect automatically after a lost connection.
    pub auto_reconnect: bool,
    /// First reconnect delay; doubles up to [`ClientConfig::reconnect_max`].
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Matrix dimensions assumed for protocols whose wire format does
    /// not report them (SW-P-08).
    pub inputs: u32,
    pub outputs: u32,
    pub levels: u32,
    /// GV Native change-flag poll cadence.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9990,
            connect_timeout: Duration::from_secs(5),
            auto_reconnect: true,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            inputs: 12,
            outputs: 12,
            levels: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Exponential backoff, doubling from the initial delay to the cap.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        current
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 1);
    }
}
