//! Behavior Controller
//!
//! Timing, continuation and error policy for a run. The executor drives the
//! hooks in this order:
//!
//! ```text
//! pre_run
//! for each payload:
//!     should_continue -> pre_step -> call -> step_delay -> verify -> post_step -> [on_error]
//! post_run
//! ```
//!
//! One behavior value may be shared by concurrent replications, so hooks take
//! `&self`; anything per-run lives in the [`ExecutionContext`].

mod presets;

pub use presets::{DefaultBehavior, HumanBehavior, MachineBehavior, StealthBehavior};

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::types::StepResult;
use std::time::Duration;

/// Run policy
///
/// Every hook has a no-op default, so a custom behavior only overrides what
/// it needs.
#[async_trait::async_trait]
pub trait Behavior: Send + Sync {
    /// Name for logs and reports
    fn name(&self) -> &str {
        "custom"
    }

    /// Setup hook before the first step
    async fn pre_run(&self, _context: &mut ExecutionContext) {}

    /// Hook before each call
    async fn pre_step(&self, _context: &mut ExecutionContext, _step: usize) {}

    /// Hook after each recorded step
    async fn post_step(&self, _context: &mut ExecutionContext, _step: usize, _result: &StepResult) {}

    /// Teardown hook; runs on every exit path after setup succeeded
    async fn post_run(&self, _context: &mut ExecutionContext, _results: &[StepResult]) {}

    /// Checked before every step; `false` ends the run without error
    fn should_continue(&self, _step: usize, _consecutive_failures: usize) -> bool {
        true
    }

    /// Pause after the call, before verification
    fn step_delay(&self, _step: usize) -> Duration {
        Duration::ZERO
    }

    /// `true` moves on to the next payload, `false` aborts the run
    fn on_error(&self, _error: &StepError, _step: usize) -> bool {
        true
    }
}

/// Behavior with every hook left at its default
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl Behavior for NoDelay {
    fn name(&self) -> &str {
        "no-delay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_permissive() {
        let behavior = NoDelay;
        let mut ctx = ExecutionContext::new(crate::types::ExecutionMode::Direct, "https://app.test");
        behavior.pre_run(&mut ctx).await;
        assert!(behavior.should_continue(100, 100));
        assert_eq!(behavior.step_delay(1), Duration::ZERO);
        assert!(behavior.on_error(&StepError::procedure("boom"), 1));
        assert_eq!(behavior.name(), "no-delay");
    }
}
