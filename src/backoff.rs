use std::time::Duration;

/// Retry delays for feed resubscription and store writes.
///
/// Delays start at `initial` and grow by `factor` (2 unless overridden)
/// until they reach `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            max,
            factor: 2.0,
            attempts: 0,
        }
    }

    /// Growth factor per attempt. Values below 1 are treated as 1.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Delay before the next attempt: `initial * factor^n` for the n-th call
    /// since the last reset, never more than `max`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.factor.powi(exp);
        self.attempts = self.attempts.saturating_add(1);
        if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max
        }
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(b.attempts(), 5);
    }

    #[test]
    fn custom_factor() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(20))
            .with_factor(3.0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(3));
        assert_eq!(b.next_delay(), Duration::from_secs(9));
        assert_eq!(b.next_delay(), Duration::from_secs(20));
    }

    #[test]
    fn long_runs_stay_at_max() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..2_000 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(50));
    }
}
