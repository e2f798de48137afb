//! Reconnect pacing for the stream connections.
//!
//! delay(n) = min(cap, base · 2ⁿ) ± jitter. Reset after a session reaches
//! the Streaming state so a flapping link starts again from `base`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 0.1)
    }
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let spread = delay.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(base_ms: u64, cap_ms: u64) -> ReconnectBackoff {
        ReconnectBackoff::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            0.0,
        )
    }

    #[test]
    fn doubles_until_cap() {
        let mut b = flat(100, 500);
        let delays: Vec<u128> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn reset_starts_over() {
        let mut b = flat(100, 10_000);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_band() {
        let mut b = ReconnectBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        let secs = b.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {secs}");
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut b = flat(1_000, 30_000);
        for _ in 0..200 {
            assert!(b.next_delay() <= Duration::from_secs(30));
        }
    }
}
