//! Rate-limit coordination
//!
//! Throttling is not an error: the coordinator turns the server's hint into a
//! resume instant on the context, and every later call through that context
//! waits for it.

use crate::context::ExecutionContext;
use crate::transport::{DirectResponse, Headers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

const RESET_HEADERS: [&str; 2] = ["x-ratelimit-reset", "ratelimit-reset"];
const REMAINING_HEADERS: [&str; 2] = ["x-ratelimit-remaining", "ratelimit-remaining"];

/// Rate-limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Statuses that signal throttling
    pub throttle_statuses: BTreeSet<u16>,
    /// Wait applied when a throttled response carries no hint
    #[serde(with = "crate::types::duration_ms")]
    pub fallback_backoff: Duration,
    /// Upper bound on any single wait
    #[serde(with = "crate::types::duration_ms")]
    pub max_wait: Duration,
    /// Times a throttled request is re-sent after waiting
    pub max_retries: usize,
    /// Honor `Remaining: 0` plus a reset hint on non-throttled responses
    pub respect_remaining: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            throttle_statuses: [429, 503].into_iter().collect(),
            fallback_backoff: Duration::from_secs(1),
            max_wait: Duration::from_secs(60),
            max_retries: 1,
            respect_remaining: true,
        }
    }
}

impl RateLimitConfig {
    /// With fallback backoff
    #[inline]
    #[must_use]
    pub fn with_fallback_backoff(mut self, backoff: Duration) -> Self {
        self.fallback_backoff = backoff;
        self
    }

    /// With wait cap
    #[inline]
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// With retry count for throttled requests
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// With throttling statuses
    #[inline]
    #[must_use]
    pub fn with_throttle_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.throttle_statuses = statuses.into_iter().collect();
        self
    }
}

/// Applies a [`RateLimitConfig`] to a context
#[derive(Debug, Clone, Default)]
pub struct RateLimitCoordinator {
    config: RateLimitConfig,
}

impl RateLimitCoordinator {
    /// Create coordinator
    #[inline]
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check if `status` signals throttling
    #[inline]
    #[must_use]
    pub fn is_throttled(&self, status: u16) -> bool {
        self.config.throttle_statuses.contains(&status)
    }

    /// Record a resume instant if the response asks for one
    ///
    /// # Returns
    /// The wait that was recorded, if any
    pub fn observe(&self, response: &DirectResponse, context: &mut ExecutionContext) -> Option<Duration> {
        let now = Utc::now();
        let hint = if self.is_throttled(response.status) {
            Some(wait_hint(&response.headers, now).unwrap_or(self.config.fallback_backoff))
        } else if self.config.respect_remaining && quota_exhausted(&response.headers) {
            reset_hint(&response.headers, now)
        } else {
            None
        };
        let wait = hint?.min(self.config.max_wait);
        tracing::debug!(
            status = response.status,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "throttled"
        );
        context.record_resume_at(Instant::now() + wait);
        Some(wait)
    }

    /// Block until the context's resume instant has passed
    pub async fn wait(&self, context: &mut ExecutionContext) {
        if let Some(at) = context.rate_limit_resume_at() {
            if Instant::now() < at {
                tracing::debug!("waiting for rate-limit window");
                tokio::time::sleep_until(at).await;
            }
            context.clear_resume_at();
        }
    }
}

/// `Retry-After`, then the reset headers
fn wait_hint(headers: &Headers, now: DateTime<Utc>) -> Option<Duration> {
    retry_after(headers, now).or_else(|| reset_hint(headers, now))
}

fn retry_after(headers: &Headers, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
}

/// Epoch seconds when larger than now, delta seconds otherwise
fn reset_hint(headers: &Headers, now: DateTime<Utc>) -> Option<Duration> {
    let value = RESET_HEADERS
        .iter()
        .find_map(|name| headers.get(name))?
        .trim()
        .parse::<u64>()
        .ok()?;
    let now_epoch = u64::try_from(now.timestamp()).unwrap_or(0);
    if value > now_epoch {
        Some(Duration::from_secs(value - now_epoch))
    } else {
        Some(Duration::from_secs(value))
    }
}

fn quota_exhausted(headers: &Headers) -> bool {
    REMAINING_HEADERS
        .iter()
        .find_map(|name| headers.get(name))
        .is_some_and(|v| v.trim() == "0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionMode;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(ExecutionMode::Direct, "https://app.test")
    }

    #[test]
    fn retry_after_seconds_and_date() {
        let now = Utc::now();
        let headers: Headers = [("Retry-After", "7")].into_iter().collect();
        assert_eq!(wait_hint(&headers, now), Some(Duration::from_secs(7)));

        let later = (now + chrono::Duration::seconds(30)).to_rfc2822();
        let headers: Headers = [("Retry-After", later)].into_iter().collect();
        let wait = wait_hint(&headers, now).unwrap();
        assert!(wait <= Duration::from_secs(30) && wait >= Duration::from_secs(29));
    }

    #[test]
    fn reset_epoch_and_delta() {
        let now = Utc::now();
        let epoch = now.timestamp() + 12;
        let headers: Headers = [("X-RateLimit-Reset", epoch.to_string())].into_iter().collect();
        assert_eq!(wait_hint(&headers, now), Some(Duration::from_secs(12)));

        let headers: Headers = [("RateLimit-Reset", "5")].into_iter().collect();
        assert_eq!(wait_hint(&headers, now), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_response_records_capped_resume() {
        let coordinator = RateLimitCoordinator::new(
            RateLimitConfig::default().with_max_wait(Duration::from_secs(10)),
        );
        let mut context = ctx();
        let resp = DirectResponse::new(429, "https://app.test").with_header("Retry-After", "120");
        assert_eq!(coordinator.observe(&resp, &mut context), Some(Duration::from_secs(10)));
        assert_eq!(
            context.rate_limit_resume_at(),
            Some(Instant::now() + Duration::from_secs(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_backoff_without_hint() {
        let coordinator = RateLimitCoordinator::new(
            RateLimitConfig::default().with_fallback_backoff(Duration::from_millis(500)),
        );
        let mut context = ctx();
        let resp = DirectResponse::new(503, "https://app.test");
        assert_eq!(coordinator.observe(&resp, &mut context), Some(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_on_success_records_resume() {
        let coordinator = RateLimitCoordinator::default();
        let mut context = ctx();
        let resp = DirectResponse::new(200, "https://app.test")
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", "3");
        assert_eq!(coordinator.observe(&resp, &mut context), Some(Duration::from_secs(3)));

        let mut fresh = ctx();
        let ok = DirectResponse::new(200, "https://app.test").with_header("X-RateLimit-Remaining", "4");
        assert_eq!(coordinator.observe(&ok, &mut fresh), None);
        assert!(fresh.rate_limit_resume_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_resume() {
        let coordinator = RateLimitCoordinator::default();
        let mut context = ctx();
        let start = Instant::now();
        context.record_resume_at(start + Duration::from_secs(4));
        coordinator.wait(&mut context).await;
        assert!(Instant::now() >= start + Duration::from_secs(4));
        assert!(context.rate_limit_resume_at().is_none());
    }
}
