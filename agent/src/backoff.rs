use rand::Rng;
use std::time::Duration;

/// Exponential backoff with multiplicative growth and symmetric jitter.
///
/// `next()` grows the delay by `multiplier` per attempt up to `max`, then
/// scales the result by `1 + U[-jitter, +jitter]`. `reset()` starts the
/// sequence over; callers reset on the first success after any failure.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Backoff {
            initial,
            max,
            multiplier,
            jitter,
            attempts: 0,
        }
    }

    /// Backoff used while discovery is unreachable: 2s doubling to 2min.
    pub fn discovery() -> Self {
        Backoff::new(Duration::from_secs(2), Duration::from_secs(120), 2.0, 0.1)
    }

    /// Backoff used between registration attempts: 1s doubling to 5min.
    pub fn reconnect() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(300), 2.0, 0.1)
    }

    pub fn next(&mut self) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(self.attempts as i32);
        let capped = base.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };

        self.attempts = self.attempts.saturating_add(1);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(initial: f64, max: f64, multiplier: f64, jitter: f64, n: i32) -> (f64, f64) {
        let base = (initial * multiplier.powi(n)).min(max);
        (base * (1.0 - jitter), base * (1.0 + jitter))
    }

    #[test]
    fn stays_within_jitter_envelope_up_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.1);

        for n in 0..12 {
            let (lo, hi) = bounds(1.0, 60.0, 2.0, 0.1, n);
            let d = b.next().as_secs_f64();
            assert!(d >= lo && d <= hi, "attempt {}: {} not in [{}, {}]", n, d, lo, hi);
        }
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(120), 2.0, 0.1);

        for _ in 0..6 {
            b.next();
        }
        b.reset();

        let d = b.next().as_secs_f64();
        assert!(d >= 2.0 * 0.9 && d <= 2.0 * 1.1, "post-reset sample {} out of range", d);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0, 0.0);

        let samples: Vec<u64> = (0..5).map(|_| b.next().as_secs()).collect();
        assert_eq!(samples, vec![1, 2, 4, 8, 8]);
    }
}
