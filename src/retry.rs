use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};
use rand::Rng;

use crate::error::TransportErrorKind;
use crate::util::parse_retry_after;

/// Snapshot of a failed attempt handed to [`RetryStrategy`].
///
/// `status`/`headers` are present when a response was obtained; a pure
/// network failure carries only the classified transport error kind.
#[derive(Clone, Debug)]
pub struct RetryContext<'a> {
    /// 1-based attempt counter. Auth-refresh replays do not advance it.
    pub attempt: u32,
    pub method: &'a Method,
    pub uri: &'a str,
    pub status: Option<StatusCode>,
    pub headers: Option<&'a HeaderMap>,
    pub transport_error_kind: Option<TransportErrorKind>,
}

/// Pluggable policy deciding whether a failed attempt is retried and how long
/// to wait before the next one.
pub trait RetryStrategy: Send + Sync {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool;
    fn next_delay(&self, ctx: &RetryContext<'_>) -> Duration;
}

/// Network failures and 5xx/429 statuses are worth retrying; anything else
/// the server meant.
fn default_retryable(ctx: &RetryContext<'_>) -> bool {
    match ctx.status {
        None => true,
        Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn should_retry(&self, _ctx: &RetryContext<'_>) -> bool {
        false
    }

    fn next_delay(&self, _ctx: &RetryContext<'_>) -> Duration {
        Duration::ZERO
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FixedDelay {
    max_attempts: u32,
    delay: Duration,
}

impl FixedDelay {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        ctx.attempt < self.max_attempts && default_retryable(ctx)
    }

    fn next_delay(&self, _ctx: &RetryContext<'_>) -> Duration {
        self.delay
    }
}

/// Capped exponential backoff without jitter. Deterministic, which makes it
/// the strategy of choice for tests and sequenced batch traffic.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay.max(Duration::from_millis(1));
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        ctx.attempt < self.max_attempts && default_retryable(ctx)
    }

    fn next_delay(&self, ctx: &RetryContext<'_>) -> Duration {
        capped_exponential(self.base_delay, self.max_delay, ctx.attempt)
    }
}

/// Half-jittered exponential backoff, the default strategy.
///
/// The delay for attempt `n` is `min(base * 2^(n-1), max)` sampled uniformly
/// from the upper half of that window, so concurrent failures spread out
/// without collapsing the floor below half the exponential target. When the
/// response carries a `Retry-After` header the server's value wins, clamped
/// to the configured maximum.
#[derive(Clone, Copy, Debug)]
pub struct JitteredBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    honor_retry_after: bool,
}

impl JitteredBackoff {
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            honor_retry_after: true,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay.max(Duration::from_millis(1));
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryStrategy for JitteredBackoff {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        ctx.attempt < self.max_attempts && default_retryable(ctx)
    }

    fn next_delay(&self, ctx: &RetryContext<'_>) -> Duration {
        if self.honor_retry_after
            && let Some(headers) = ctx.headers
            && let Some(server_delay) = parse_retry_after(headers, SystemTime::now())
        {
            return server_delay.min(self.max_delay);
        }

        let exponential = capped_exponential(self.base_delay, self.max_delay, ctx.attempt);
        half_jitter(exponential)
    }
}

fn capped_exponential(base_delay: Duration, max_delay: Duration, attempt: u32) -> Duration {
    let capped_exponent = attempt.saturating_sub(1).min(31);
    let multiplier = 1_u128 << capped_exponent;
    let base_ms = base_delay.as_millis().max(1);
    let max_ms = max_delay.as_millis().max(base_ms);
    let delay_ms = base_ms
        .saturating_mul(multiplier)
        .min(max_ms)
        .min(u64::MAX as u128) as u64;
    Duration::from_millis(delay_ms)
}

/// Uniform sample from `[exp/2, exp]`.
fn half_jitter(exponential: Duration) -> Duration {
    let exp_ms = exponential.as_millis().min(u64::MAX as u128) as u64;
    if exp_ms <= 1 {
        return exponential;
    }
    let mut rng = rand::rng();
    let sampled_ms = rng.random_range(exp_ms / 2..=exp_ms);
    Duration::from_millis(sampled_ms)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderMap, Method, StatusCode};

    use super::{
        ExponentialBackoff, FixedDelay, JitteredBackoff, NoRetry, RetryContext, RetryStrategy,
    };

    fn ctx(attempt: u32, status: Option<StatusCode>) -> RetryContext<'static> {
        RetryContext {
            attempt,
            method: &Method::GET,
            uri: "https://api.example.com/v1/items",
            status,
            headers: None,
            transport_error_kind: None,
        }
    }

    #[test]
    fn no_retry_never_retries() {
        assert!(!NoRetry.should_retry(&ctx(1, Some(StatusCode::INTERNAL_SERVER_ERROR))));
        assert!(!NoRetry.should_retry(&ctx(1, None)));
    }

    #[test]
    fn fixed_delay_respects_attempt_bound() {
        let strategy = FixedDelay::new(3, Duration::from_millis(10));
        assert!(strategy.should_retry(&ctx(1, Some(StatusCode::INTERNAL_SERVER_ERROR))));
        assert!(strategy.should_retry(&ctx(2, None)));
        assert!(!strategy.should_retry(&ctx(3, Some(StatusCode::INTERNAL_SERVER_ERROR))));
    }

    #[test]
    fn client_errors_are_not_retryable_except_429() {
        let strategy = JitteredBackoff::standard();
        assert!(!strategy.should_retry(&ctx(1, Some(StatusCode::NOT_FOUND))));
        assert!(!strategy.should_retry(&ctx(1, Some(StatusCode::BAD_REQUEST))));
        assert!(strategy.should_retry(&ctx(1, Some(StatusCode::TOO_MANY_REQUESTS))));
        assert!(strategy.should_retry(&ctx(1, Some(StatusCode::BAD_GATEWAY))));
        assert!(strategy.should_retry(&ctx(1, None)));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let strategy = ExponentialBackoff::new(5)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(250));
        assert_eq!(
            strategy.next_delay(&ctx(1, None)),
            Duration::from_millis(100)
        );
        assert_eq!(
            strategy.next_delay(&ctx(2, None)),
            Duration::from_millis(200)
        );
        assert_eq!(
            strategy.next_delay(&ctx(3, None)),
            Duration::from_millis(250)
        );
        assert_eq!(
            strategy.next_delay(&ctx(4, None)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn exponential_backoff_is_monotonic_up_to_the_cap() {
        let strategy = ExponentialBackoff::new(8)
            .base_delay(Duration::from_millis(50))
            .max_delay(Duration::from_secs(10));
        let mut previous = Duration::ZERO;
        for attempt in 1..=8 {
            let delay = strategy.next_delay(&ctx(attempt, None));
            assert!(delay > previous, "attempt {attempt} did not grow");
            previous = delay;
        }
    }

    #[test]
    fn half_jitter_stays_in_the_upper_window() {
        let strategy = JitteredBackoff::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(4));

        for _ in 0..256 {
            // attempt 3 -> exponential window of 400ms
            let delay = strategy.next_delay(&ctx(3, None));
            assert!(delay >= Duration::from_millis(200), "below half window");
            assert!(delay <= Duration::from_millis(400), "above full window");
        }
    }

    #[test]
    fn jittered_backoff_never_exceeds_max_delay() {
        let strategy = JitteredBackoff::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(120));

        for _ in 0..256 {
            assert!(strategy.next_delay(&ctx(5, None)) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn retry_after_seconds_overrides_computed_delay() {
        let strategy = JitteredBackoff::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(30));
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "7".parse().expect("header value"));
        let ctx = RetryContext {
            attempt: 1,
            method: &Method::GET,
            uri: "https://api.example.com/v1/items",
            status: Some(StatusCode::TOO_MANY_REQUESTS),
            headers: Some(&headers),
            transport_error_kind: None,
        };

        assert_eq!(strategy.next_delay(&ctx), Duration::from_secs(7));
    }

    #[test]
    fn retry_after_is_clamped_to_max_delay() {
        let strategy = JitteredBackoff::standard().max_delay(Duration::from_secs(2));
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "600".parse().expect("header value"));
        let ctx = RetryContext {
            attempt: 1,
            method: &Method::GET,
            uri: "https://api.example.com/v1/items",
            status: Some(StatusCode::SERVICE_UNAVAILABLE),
            headers: Some(&headers),
            transport_error_kind: None,
        };

        assert_eq!(strategy.next_delay(&ctx), Duration::from_secs(2));
    }
}
