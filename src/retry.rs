use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Bounded retry for rate-limited (429) calls.
///
/// The wait before retry `n` (0-based) is the larger of the provider's
/// `Retry-After` hint and `base_delay * 2^n`. Only the backoff term is capped
/// at `max_delay`; a hint longer than `max_delay` ends the retries instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// `None` once the retry budget is spent, or when the provider asks for a
    /// longer wait than `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let retry_after = retry_after.unwrap_or(Duration::ZERO);
        if retry_after > self.max_delay {
            return None;
        }
        let backoff = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        Some(retry_after.max(backoff))
    }
}

/// Seconds from a `Retry-After` header; HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_doubles_until_budget_is_spent() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, None), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(1, None), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(2, None), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(3, None), None);
    }

    #[test]
    fn retry_after_wins_when_longer() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_secs(1))),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(10).with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.delay_for(9, None), Some(Duration::from_secs(3)));
        assert_eq!(
            policy.delay_for(9, Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn long_retry_after_is_never_shortened() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(120))), None);
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(30))),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn zero_retries_never_waits() {
        assert_eq!(RetryPolicy::new(0).delay_for(0, None), None);
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
