use std::time::Duration;

/// Maximum number of reconnection attempts before the bus gives up.
pub(crate) const MAX_RETRIES: i32 = 20;

/// Upper bound, in seconds, of the delay between reconnection attempts.
pub(crate) const MAX_BACKOFF_SECONDS: u64 = 30;

/// Fibonacci backoff used between reconnection attempts.
pub(crate) struct FibonacciBackoff {
    previous: u64,
    current: u64,
    max: u64,
}

impl FibonacciBackoff {
    pub(crate) fn new(max: u64) -> Self {
        FibonacciBackoff {
            previous: 0,
            current: 1,
            max,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = self.previous + self.current;
        self.previous = self.current;
        self.current = next;

        Duration::from_secs(next.min(self.max))
    }
}
