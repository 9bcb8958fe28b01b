//! Admission control for the online dispatcher.
//!
//! Both budgets are leaky buckets refilled continuously at `limit / 60s`, with a
//! capacity of one minute's worth. They are owned by the dispatcher's
//! coordinating loop and never shared between tasks.

use std::time::Duration;

use tokio::time::Instant;

/// One continuously replenished budget.
#[derive(Debug, Clone)]
pub struct RateBudget {
    capacity: f64,
    available: f64,
    updated: Instant,
}

/// Shortfalls below this many units are treated as rounding noise.
const EPSILON: f64 = 1e-9;

impl RateBudget {
    /// A full budget allowing `per_minute` units per minute.
    pub fn per_minute(per_minute: u64, now: Instant) -> Self {
        let capacity = per_minute as f64;
        Self {
            capacity,
            available: capacity,
            updated: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.available = (self.available + elapsed * self.capacity / 60.0).min(self.capacity);
        self.updated = now;
    }

    /// Amounts above capacity are clamped so they can eventually be admitted.
    fn clamp(&self, amount: f64) -> f64 {
        amount.min(self.capacity)
    }

    /// Time until `amount` units are available; zero if they are now.
    pub fn time_until(&mut self, amount: u64, now: Instant) -> Duration {
        self.refill(now);
        let missing = self.clamp(amount as f64) - self.available;
        if missing <= EPSILON || self.capacity <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing * 60.0 / self.capacity)
        }
    }

    pub fn consume(&mut self, amount: u64, now: Instant) {
        self.refill(now);
        self.available -= self.clamp(amount as f64);
    }
}

/// Requests-per-minute and tokens-per-minute budgets. `None` means unlimited.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    requests: Option<RateBudget>,
    tokens: Option<RateBudget>,
}

impl RateLimiter {
    pub fn new(
        max_requests_per_minute: Option<u64>,
        max_tokens_per_minute: Option<u64>,
        now: Instant,
    ) -> Self {
        Self {
            requests: max_requests_per_minute
                .filter(|limit| *limit > 0)
                .map(|limit| RateBudget::per_minute(limit, now)),
            tokens: max_tokens_per_minute
                .filter(|limit| *limit > 0)
                .map(|limit| RateBudget::per_minute(limit, now)),
        }
    }

    pub fn unlimited(now: Instant) -> Self {
        Self::new(None, None, now)
    }

    /// Time until one request estimated at `tokens` tokens fits both budgets.
    pub fn time_until_admit(&mut self, tokens: u64, now: Instant) -> Duration {
        let requests = self
            .requests
            .as_mut()
            .map_or(Duration::ZERO, |b| b.time_until(1, now));
        let tokens = self
            .tokens
            .as_mut()
            .map_or(Duration::ZERO, |b| b.time_until(tokens, now));
        requests.max(tokens)
    }

    /// Charge one admitted request.
    pub fn consume(&mut self, tokens: u64, now: Instant) {
        if let Some(budget) = self.requests.as_mut() {
            budget.consume(1, now);
        }
        if let Some(budget) = self.tokens.as_mut() {
            budget.consume(tokens, now);
        }
    }
}

/// Global pause after a rate-limit signal.
///
/// After a rate limit observed at `t`, nothing is admitted before `t + window`.
#[derive(Debug, Clone)]
pub struct Cooldown {
    window: Duration,
    last_rate_limit: Option<Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_rate_limit: None,
        }
    }

    /// Record a rate-limit signal observed at `at`.
    pub fn trigger(&mut self, at: Instant) {
        self.last_rate_limit = Some(match self.last_rate_limit {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }

    /// Remaining pause at `now`: `window - (now - t)`, or zero once elapsed.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_rate_limit {
            Some(at) => self
                .window
                .saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    pub fn last_rate_limit(&self) -> Option<Instant> {
        self.last_rate_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_waits_for_remainder_of_window() {
        let mut cooldown = Cooldown::new(Duration::from_secs(15));
        assert_eq!(cooldown.remaining(Instant::now()), Duration::ZERO);

        cooldown.trigger(Instant::now());
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(cooldown.remaining(Instant::now()), Duration::from_secs(11));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cooldown.remaining(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_keeps_latest_trigger() {
        let mut cooldown = Cooldown::new(Duration::from_secs(10));
        let start = Instant::now();
        cooldown.trigger(start + Duration::from_secs(3));
        cooldown.trigger(start);

        assert_eq!(cooldown.last_rate_limit(), Some(start + Duration::from_secs(3)));
        assert_eq!(cooldown.remaining(start + Duration::from_secs(5)), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_budget_replenishes_continuously() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(Some(60), None, now);

        for _ in 0..60 {
            assert_eq!(limiter.time_until_admit(0, now), Duration::ZERO);
            limiter.consume(0, now);
        }

        // one request per second comes back
        let wait = limiter.time_until_admit(0, now);
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-6);
        let later = now + Duration::from_millis(500);
        let wait = limiter.time_until_admit(0, later);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_token_estimate_is_clamped() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(None, Some(1_000), now);

        assert_eq!(limiter.time_until_admit(5_000, now), Duration::ZERO);
        limiter.consume(5_000, now);
        let wait = limiter.time_until_admit(5_000, now);
        assert!((wait.as_secs_f64() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_unlimited_never_waits() {
        let now = Instant::now();
        let mut limiter = RateLimiter::unlimited(now);
        limiter.consume(1_000_000, now);
        assert_eq!(limiter.time_until_admit(1_000_000, now), Duration::ZERO);
    }
}
