//! Run lifecycle state machine
//!
//! ```text
//! INIT → PRE_RUN → { CHECK_CONTINUE → PRE_STEP → CALL → DELAY → VERIFY → POST_STEP → [ON_ERROR] }*
//!      → POST_RUN → DONE | ABORTED
//! ```

use serde::{Deserialize, Serialize};

/// Phase of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    /// Transport not yet constructed
    Init,
    /// `pre_run` hook, authentication for interactive runs
    PreRun,
    /// `should_continue` is consulted before each step
    CheckContinue,
    /// `pre_step` hook
    PreStep,
    /// The step itself
    Call,
    /// Inter-step delay chosen by the behavior
    Delay,
    /// Outcome check against the step's response
    Verify,
    /// `post_step` hook
    PostStep,
    /// `on_error` hook after a failed step
    OnError,
    /// `post_run` hook, always entered once the run has started
    PostRun,
    /// Run finished normally or was halted
    Done,
    /// Run gave up, or never got a transport
    Aborted,
}

impl RunPhase {
    /// Terminal phases accept no further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Illegal lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal run transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// Phase the run was in
    pub from: RunPhase,
    /// Phase it tried to enter
    pub to: RunPhase,
}

/// Phases reachable from `from`
#[must_use]
pub fn allowed_transitions(from: RunPhase) -> &'static [RunPhase] {
    match from {
        RunPhase::Init => &[RunPhase::PreRun, RunPhase::Aborted],
        RunPhase::PreRun => &[RunPhase::CheckContinue, RunPhase::PostRun],
        RunPhase::CheckContinue => &[RunPhase::PreStep, RunPhase::PostRun],
        RunPhase::PreStep => &[RunPhase::Call],
        RunPhase::Call => &[RunPhase::Delay],
        RunPhase::Delay => &[RunPhase::Verify, RunPhase::PostStep],
        RunPhase::Verify => &[RunPhase::PostStep],
        RunPhase::PostStep => &[RunPhase::CheckContinue, RunPhase::OnError, RunPhase::PostRun],
        RunPhase::OnError => &[RunPhase::CheckContinue, RunPhase::PostRun],
        RunPhase::PostRun => &[RunPhase::Done, RunPhase::Aborted],
        RunPhase::Done | RunPhase::Aborted => &[],
    }
}

/// Validates a phase transition
pub fn validate_transition(from: RunPhase, to: RunPhase) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Tracks the current phase of one run
#[derive(Debug, Clone)]
pub struct RunLifecycle {
    phase: RunPhase,
    transitions: usize,
}

impl RunLifecycle {
    /// Start in `INIT`
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            transitions: 0,
        }
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Number of transitions taken so far
    #[inline]
    #[must_use]
    pub fn transitions(&self) -> usize {
        self.transitions
    }

    /// Move to `to`, rejecting transitions the diagram does not allow
    pub fn advance(&mut self, to: RunPhase) -> Result<(), IllegalTransition> {
        validate_transition(self.phase, to)?;
        tracing::trace!(from = ?self.phase, to = ?to, "run phase");
        self.phase = to;
        self.transitions += 1;
        Ok(())
    }
}

impl Default for RunLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
