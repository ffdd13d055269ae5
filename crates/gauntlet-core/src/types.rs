//! Core types for Gauntlet
//!
//! Defines the fundamental value types shared by the executor and the
//! orchestration layer:
//! - Execution mode and expected-outcome policy
//! - Payloads and per-step results
//! - Run summaries

use crate::lifecycle::RunPhase;
use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use ulid::Ulid;

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport a procedure is driven through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Browser-like session
    Interactive,
    /// HTTP-like request session
    Direct,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => f.write_str("INTERACTIVE"),
            Self::Direct => f.write_str("DIRECT"),
        }
    }
}

/// How step outcomes are compared against expectations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedPolicy {
    /// One expectation for the whole run; any successful step counts
    #[default]
    WholeRun,
    /// Every step carries its own expectation
    PerStep,
}

/// One unit of input produced by a procedure's payload stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Payload value handed to the step method
    pub value: serde_json::Value,
    /// Declared expectation for this step (PER_STEP policy)
    pub expected: Option<bool>,
}

impl Payload {
    /// Create payload without a step expectation
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            expected: None,
        }
    }

    /// With declared step expectation
    #[inline]
    #[must_use]
    pub fn expecting(mut self, expected: bool) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Payload as string, if it is one
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Transport state captured when a step result is recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    /// URL the transport was on (or last requested)
    pub url: Option<String>,
    /// Last response status (direct mode)
    pub status: Option<u16>,
    /// Target version reported by the application under test
    pub target_version: Option<String>,
}

/// Result of one step attempt; immutable once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-based step number within the run
    pub step: usize,
    /// Payload the step was driven with
    pub payload: Payload,
    /// Expectation this step is judged against
    pub expected: bool,
    /// Observed outcome
    pub actual: bool,
    /// Transport state at record time
    pub snapshot: TransportSnapshot,
    /// Record time
    pub timestamp: DateTime<Utc>,
    /// Step error, if the call or verification failed
    pub error: Option<String>,
}

impl StepResult {
    /// Whether the observed outcome matches the step expectation
    #[inline]
    #[must_use]
    pub fn matches_expectation(&self) -> bool {
        self.actual == self.expected
    }
}

/// Why a run stopped iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Payload stream exhausted
    Completed,
    /// `should_continue` returned false
    Halted,
    /// `on_error` returned false
    Aborted,
    /// Transport construction or authentication failed
    SetupFailed,
}

/// Outcome of one run; verdict is computed once when the step list closes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: RunId,
    /// Procedure identifier
    pub procedure_id: String,
    /// Transport mode the run used
    pub mode: ExecutionMode,
    /// Expected-outcome policy
    pub expected_policy: ExpectedPolicy,
    /// Whole-run expectation
    pub expected: bool,
    /// Ordered step results
    pub step_results: Vec<StepResult>,
    /// PASS/FAIL
    pub verdict: Verdict,
    /// Run ended early because of an error
    pub aborted: bool,
    /// Why iteration stopped
    pub stop_reason: StopReason,
    /// Lifecycle phase the run ended in
    pub final_phase: RunPhase,
    /// Setup failure message, if any
    pub setup_error: Option<String>,
    /// Replication index when run under orchestration
    pub replication: Option<usize>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Wall time of the run
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl RunSummary {
    /// Verdict is PASS
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict.is_pass()
    }

    /// Process exit code for this run
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// Number of steps whose actual outcome was true
    #[must_use]
    pub fn successful_steps(&self) -> usize {
        self.step_results.iter().filter(|r| r.actual).count()
    }

    /// Distinct target versions observed during the run
    #[must_use]
    pub fn target_versions(&self) -> Vec<String> {
        self.step_results
            .iter()
            .filter_map(|r| r.snapshot.target_version.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Serialize `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
