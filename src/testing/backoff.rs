//! Caller-side retry pacing: exponential delay with jitter, capped.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_micros(50), Duration::from_millis(10))
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt: `base * 2^attempts`, capped, with up to
    /// half of it taken off at random
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempts.min(20);
        self.attempts = self.attempts.saturating_add(1);

        let full = self.base.saturating_mul(1u32 << exp).min(self.cap);
        let jitter = full.mul_f64(fastrand::f64() * 0.5);
        full.saturating_sub(jitter)
    }

    /// Sleep for `next_delay()`
    pub fn wait(&mut self) {
        std::thread::sleep(self.next_delay());
    }
}
