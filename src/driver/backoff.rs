//! Reconnect delay policy.

use std::time::Duration;

/// Exponential backoff between reconnect attempts.
///
/// Pure bookkeeping; owns no timers and touches no sockets.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Return the delay to use now and double it for next time, capped at
    /// the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the base delay. Called when the target endpoint changes or a
    /// connection attempt fully succeeds.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(300));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn matches_closed_form() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(300));
        for k in 0..16u32 {
            let expected = (10u64 << k).min(300);
            assert_eq!(backoff.next_delay().as_secs(), expected, "delay {k}");
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(300));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }
}
