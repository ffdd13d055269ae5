//! Built-in behavior presets

use super::Behavior;
use crate::error::StepError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn rng_from(seed: Option<u64>) -> Mutex<StdRng> {
    Mutex::new(match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    })
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Fixed delay, fail-soft
#[derive(Debug, Clone)]
pub struct DefaultBehavior {
    delay: Duration,
    max_consecutive_failures: usize,
}

impl DefaultBehavior {
    /// One second between steps, stop after five failures in a row
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_consecutive_failures: 5,
        }
    }

    /// With step delay
    #[inline]
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// With consecutive failure limit
    #[inline]
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, max: usize) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

impl Default for DefaultBehavior {
    fn default() -> Self {
        Self::new()
    }
}

impl Behavior for DefaultBehavior {
    fn name(&self) -> &str {
        "default"
    }

    fn should_continue(&self, _step: usize, consecutive_failures: usize) -> bool {
        consecutive_failures < self.max_consecutive_failures
    }

    fn step_delay(&self, _step: usize) -> Duration {
        self.delay
    }
}

/// Deterministic, fast, optionally fail-fast
#[derive(Debug, Clone)]
pub struct MachineBehavior {
    delay: Duration,
    fail_fast: bool,
    max_consecutive_failures: usize,
}

impl MachineBehavior {
    /// Zero delay, fail-soft, stop after three failures in a row
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_fast: false,
            max_consecutive_failures: 3,
        }
    }

    /// With step delay
    #[inline]
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Abort on the first step error
    #[inline]
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// With consecutive failure limit
    #[inline]
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, max: usize) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

impl Default for MachineBehavior {
    fn default() -> Self {
        Self::new()
    }
}

impl Behavior for MachineBehavior {
    fn name(&self) -> &str {
        "machine"
    }

    fn should_continue(&self, _step: usize, consecutive_failures: usize) -> bool {
        consecutive_failures < self.max_consecutive_failures
    }

    fn step_delay(&self, _step: usize) -> Duration {
        self.delay
    }

    fn on_error(&self, error: &StepError, step: usize) -> bool {
        if self.fail_fast {
            tracing::warn!(step, error = %error, "fail-fast abort");
        }
        !self.fail_fast
    }
}

/// Base delay with bounded jitter
#[derive(Debug)]
pub struct HumanBehavior {
    base_delay: Duration,
    variance: Duration,
    max_consecutive_failures: usize,
    rng: Mutex<StdRng>,
}

impl HumanBehavior {
    /// 2s ± 1s, stop after three failures in a row
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            variance: Duration::from_secs(1),
            max_consecutive_failures: 3,
            rng: rng_from(seed),
        }
    }

    /// With base delay and jitter bound
    #[inline]
    #[must_use]
    pub fn with_delay(mut self, base_delay: Duration, variance: Duration) -> Self {
        self.base_delay = base_delay;
        self.variance = variance;
        self
    }

    /// With consecutive failure limit
    #[inline]
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, max: usize) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

impl Behavior for HumanBehavior {
    fn name(&self) -> &str {
        "human"
    }

    fn should_continue(&self, _step: usize, consecutive_failures: usize) -> bool {
        consecutive_failures < self.max_consecutive_failures
    }

    fn step_delay(&self, _step: usize) -> Duration {
        let base = millis(self.base_delay);
        let variance = millis(self.variance);
        let lo = base.saturating_sub(variance);
        let hi = base.saturating_add(variance);
        Duration::from_millis(self.rng.lock().random_range(lo..=hi))
    }
}

/// Slow, irregular, capped request count
#[derive(Debug)]
pub struct StealthBehavior {
    min_delay: Duration,
    max_delay: Duration,
    long_pause: Duration,
    long_pause_probability: f64,
    max_requests_per_run: usize,
    max_consecutive_failures: usize,
    rng: Mutex<StdRng>,
}

impl StealthBehavior {
    /// 5 to 15s delays, 10% chance of an extra 30s pause, 50 steps per run
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
            long_pause: Duration::from_secs(30),
            long_pause_probability: 0.1,
            max_requests_per_run: 50,
            max_consecutive_failures: 2,
            rng: rng_from(seed),
        }
    }

    /// With delay range; bounds are swapped if given in reverse
    #[inline]
    #[must_use]
    pub fn with_delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min.min(max);
        self.max_delay = min.max(max);
        self
    }

    /// With long pause length and probability
    #[inline]
    #[must_use]
    pub fn with_long_pause(mut self, pause: Duration, probability: f64) -> Self {
        self.long_pause = pause;
        self.long_pause_probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self
    }

    /// With per-run step cap
    #[inline]
    #[must_use]
    pub fn with_max_requests_per_run(mut self, max: usize) -> Self {
        self.max_requests_per_run = max;
        self
    }

    /// With consecutive failure limit
    #[inline]
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, max: usize) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

impl Behavior for StealthBehavior {
    fn name(&self) -> &str {
        "stealth"
    }

    fn should_continue(&self, step: usize, consecutive_failures: usize) -> bool {
        if step > self.max_requests_per_run {
            tracing::info!(step, cap = self.max_requests_per_run, "request cap reached");
            return false;
        }
        consecutive_failures < self.max_consecutive_failures
    }

    fn step_delay(&self, _step: usize) -> Duration {
        let mut rng = self.rng.lock();
        let base = rng.random_range(millis(self.min_delay)..=millis(self.max_delay));
        let pause = if rng.random_bool(self.long_pause_probability) {
            millis(self.long_pause)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(pause))
    }
}
