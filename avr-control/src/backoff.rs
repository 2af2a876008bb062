//! Reconnect backoff
//!
//! Starts at the floor, doubles after every failed or dropped connection,
//! never exceeds the ceiling, and returns to the floor once a connection
//! succeeds.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait before the next attempt.
    #[cfg(test)]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failure: return the delay to use now and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Record a successful connection.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubles_until_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(2));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_ceiling_below_floor_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn prop_delay_doubles_or_caps(floor_ms in 1u64..5_000, ceiling_ms in 1u64..120_000, steps in 1usize..40) {
            let floor = Duration::from_millis(floor_ms);
            let ceiling = Duration::from_millis(ceiling_ms).max(floor);
            let mut backoff = Backoff::new(floor, ceiling);

            let mut previous = backoff.next_delay();
            prop_assert_eq!(previous, floor);
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay <= ceiling);
                prop_assert_eq!(delay, (previous * 2).min(ceiling));
                previous = delay;
            }

            backoff.reset();
            prop_assert_eq!(backoff.current(), floor);
        }
    }
}
