//! Verdict engine
//!
//! Compares observed step outcomes against the procedure's expectation.
//!
//! - `WHOLE_RUN`: any successful step means the probe got through. The run
//!   passes when that matches the whole-run expectation.
//! - `PER_STEP`: every step must match its own declared expectation.

use crate::types::{ExpectedPolicy, StepResult};
use serde::{Deserialize, Serialize};

/// PASS/FAIL outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Actual outcome matched expectation
    Pass,
    /// Actual outcome contradicted expectation
    Fail,
}

impl Verdict {
    /// Build from a boolean
    #[inline]
    #[must_use]
    pub fn from_bool(pass: bool) -> Self {
        if pass {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    /// Check for PASS
    #[inline]
    #[must_use]
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }

    /// `0` for PASS, `1` for FAIL
    #[inline]
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail => f.write_str("FAIL"),
        }
    }
}

/// Compute the verdict for a closed step list
#[must_use]
pub fn evaluate(policy: ExpectedPolicy, expected: bool, results: &[StepResult]) -> Verdict {
    match policy {
        ExpectedPolicy::WholeRun => {
            let any_success = results.iter().any(|r| r.actual);
            Verdict::from_bool(any_success == expected)
        }
        ExpectedPolicy::PerStep => {
            Verdict::from_bool(results.iter().all(StepResult::matches_expectation))
        }
    }
}
