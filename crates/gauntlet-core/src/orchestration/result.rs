//! Orchestration results
//!
//! Workers append through a [`ResultCollector`]; the final
//! [`OrchestrationResult`] is built only after every worker has joined.

use super::assignment::Assignment;
use super::Strategy;
use crate::types::{duration_ms, RunSummary};
use crate::verdict::Verdict;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Pass/fail counts for one dimension value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionStats {
    /// Replications attributed to this value
    pub total: usize,
    /// Replications that passed
    pub succeeded: usize,
    /// Replications that failed or crashed
    pub failed: usize,
}

impl DimensionStats {
    fn record(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// `dimension -> value -> stats`
pub type Breakdown = BTreeMap<String, BTreeMap<String, DimensionStats>>;

/// Outcome of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch index
    pub index: usize,
    /// First replication index in the batch
    pub first_replication: usize,
    /// Replications in the batch
    pub size: usize,
    /// Attempts made, retries included
    pub attempts: usize,
    /// Failure rate of the final attempt
    pub failure_rate: f64,
    /// Still failing after the last allowed retry
    pub failed: bool,
}

/// Aggregated job outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    /// Strategy the job ran under
    pub strategy: Strategy,
    /// Recorded run summaries; always `per_replication.len()`
    pub total: usize,
    /// Summaries with a PASS verdict
    pub succeeded: usize,
    /// Summaries with a FAIL verdict
    pub failed: usize,
    /// Wall time of the job
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Summaries ordered by replication index
    pub per_replication: Vec<RunSummary>,
    /// Worker failures
    pub errors: Vec<String>,
    /// Distributed breakdown by proxy, location and credential
    pub breakdown_by_dimension: Option<Breakdown>,
    /// Batch reports (BATCH only)
    pub batches: Vec<BatchReport>,
    /// Job was stopped before every replication started
    pub stopped: bool,
}

impl OrchestrationResult {
    /// Fraction of recorded summaries that passed
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    /// Aggregate verdict
    ///
    /// PASS only if no worker failed, no batch failed permanently and every
    /// recorded run passed.
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        Verdict::from_bool(
            self.errors.is_empty()
                && self.batches.iter().all(|b| !b.failed)
                && self.per_replication.iter().all(RunSummary::passed),
        )
    }

    /// Aggregate verdict is PASS
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict().is_pass()
    }

    /// Process exit code
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.verdict().exit_code()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "Strategy:     {:?}", self.strategy);
        let _ = writeln!(out, "Replications: {}", self.total);
        let _ = writeln!(out, "Succeeded:    {}", self.succeeded);
        let _ = writeln!(out, "Failed:       {}", self.failed);
        let _ = writeln!(out, "Errors:       {}", self.errors.len());
        let _ = writeln!(out, "Success rate: {:.1}%", self.success_rate() * 100.0);
        let _ = writeln!(out, "Duration:     {}ms", self.duration.as_millis());
        if self.stopped {
            let _ = writeln!(out, "Stopped early");
        }
        for batch in &self.batches {
            let _ = writeln!(
                out,
                "  batch {} [{}..{}): attempts={} failure_rate={:.2}{}",
                batch.index,
                batch.first_replication,
                batch.first_replication + batch.size,
                batch.attempts,
                batch.failure_rate,
                if batch.failed { " FAILED" } else { "" }
            );
        }
        if let Some(breakdown) = &self.breakdown_by_dimension {
            for (dimension, values) in breakdown {
                for (value, stats) in values {
                    let _ = writeln!(
                        out,
                        "  {dimension}={value}: {}/{} passed",
                        stats.succeeded, stats.total
                    );
                }
            }
        }
        for error in &self.errors {
            let _ = writeln!(out, "  error: {error}");
        }
        let _ = write!(out, "Verdict:      {}", self.verdict());
        out
    }
}

#[derive(Debug, Default)]
struct Collected {
    summaries: Vec<RunSummary>,
    errors: Vec<String>,
    crashed: Vec<usize>,
}

/// Single synchronization point for concurrent workers
#[derive(Debug, Default)]
pub struct ResultCollector {
    inner: Mutex<Collected>,
}

impl ResultCollector {
    /// Create empty collector
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed run
    pub fn record(&self, summary: RunSummary) {
        self.inner.lock().summaries.push(summary);
    }

    /// Record a worker failure for `replication`
    pub fn record_failure(&self, replication: usize, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(replication, error = %message, "replication worker failed");
        let mut inner = self.inner.lock();
        inner.errors.push(format!("replication {replication}: {message}"));
        inner.crashed.push(replication);
    }

    /// Recorded summaries so far
    #[must_use]
    pub fn completed(&self) -> usize {
        self.inner.lock().summaries.len()
    }

    /// Failed replications so far: FAIL summaries plus worker failures
    #[must_use]
    pub fn failures(&self) -> usize {
        let inner = self.inner.lock();
        inner.summaries.iter().filter(|s| !s.passed()).count() + inner.crashed.len()
    }

    /// Check for worker failures or runs that never got past setup
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        let inner = self.inner.lock();
        !inner.crashed.is_empty() || inner.summaries.iter().any(|s| s.setup_error.is_some())
    }

    /// Move everything from `other` into `self`
    pub fn absorb(&self, other: &ResultCollector) {
        let other = std::mem::take(&mut *other.inner.lock());
        let mut inner = self.inner.lock();
        inner.summaries.extend(other.summaries);
        inner.errors.extend(other.errors);
        inner.crashed.extend(other.crashed);
    }

    /// Finalize once all workers have joined; leaves the collector empty
    #[must_use]
    pub fn finish(
        &self,
        strategy: Strategy,
        duration: Duration,
        assignments: Option<&[Arc<Assignment>]>,
        batches: Vec<BatchReport>,
        stopped: bool,
    ) -> OrchestrationResult {
        let Collected {
            mut summaries,
            errors,
            crashed,
        } = std::mem::take(&mut *self.inner.lock());
        summaries.sort_by_key(|s| s.replication);

        let breakdown = assignments.map(|table| breakdown(table, &summaries, &crashed));
        let succeeded = summaries.iter().filter(|s| s.passed()).count();
        OrchestrationResult {
            strategy,
            total: summaries.len(),
            succeeded,
            failed: summaries.len() - succeeded,
            duration,
            per_replication: summaries,
            errors,
            breakdown_by_dimension: breakdown,
            batches,
            stopped,
        }
    }
}

fn breakdown(table: &[Arc<Assignment>], summaries: &[RunSummary], crashed: &[usize]) -> Breakdown {
    let mut out = Breakdown::new();
    let outcomes = summaries
        .iter()
        .filter_map(|s| s.replication.map(|r| (r, s.passed())))
        .chain(crashed.iter().map(|r| (*r, false)));

    for (replication, passed) in outcomes {
        let Some(assignment) = table.get(replication) else {
            continue;
        };
        let mut bump = |dimension: &str, value: &str| {
            out.entry(dimension.to_string())
                .or_default()
                .entry(value.to_string())
                .or_default()
                .record(passed);
        };
        if let Some(proxy) = &assignment.proxy {
            bump("proxy", &proxy.name);
        }
        if let Some(location) = assignment.location() {
            bump("location", location);
        }
        if let Some(credential) = &assignment.credential {
            bump("credential", &credential.name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RunPhase;
    use crate::orchestration::assignment::{assign, CredentialSet, NetworkProxy, RotationPolicy};
    use crate::types::{ExecutionMode, ExpectedPolicy, RunId, StopReason};
    use chrono::Utc;

    fn summary(replication: usize, verdict: Verdict) -> RunSummary {
        RunSummary {
            run_id: RunId::new(),
            procedure_id: "p".into(),
            mode: ExecutionMode::Direct,
            expected_policy: ExpectedPolicy::WholeRun,
            expected: true,
            step_results: Vec::new(),
            verdict,
            aborted: false,
            stop_reason: StopReason::Completed,
            final_phase: RunPhase::Done,
            setup_error: None,
            replication: Some(replication),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn totals_match_recorded_summaries() {
        let collector = ResultCollector::new();
        collector.record(summary(2, Verdict::Pass));
        collector.record(summary(0, Verdict::Fail));
        collector.record_failure(1, "panicked");
        assert_eq!(collector.failures(), 2);
        assert!(collector.has_fatal());

        let result = collector.finish(Strategy::Parallel, Duration::ZERO, None, Vec::new(), false);
        assert_eq!(result.total, result.per_replication.len());
        assert_eq!(result.total, 2);
        assert_eq!(result.per_replication[0].replication, Some(0));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.verdict(), Verdict::Fail);
        assert!((result.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn breakdown_counts_every_dimension() {
        let table = assign(
            &[
                NetworkProxy::new("a", "http://a").with_location("eu"),
                NetworkProxy::new("b", "http://b").with_location("us"),
            ],
            &[CredentialSet::new("alice")],
            RotationPolicy::RoundRobin,
            3,
        );
        let collector = ResultCollector::new();
        collector.record(summary(0, Verdict::Pass));
        collector.record(summary(1, Verdict::Fail));
        collector.record_failure(2, "boom");

        let result = collector.finish(Strategy::Distributed, Duration::ZERO, Some(&table), Vec::new(), false);
        let breakdown = result.breakdown_by_dimension.unwrap();
        assert_eq!(breakdown["proxy"]["a"], DimensionStats { total: 2, succeeded: 1, failed: 1 });
        assert_eq!(breakdown["location"]["us"].failed, 1);
        assert_eq!(breakdown["credential"]["alice"].total, 3);
    }

    #[test]
    fn absorb_merges_attempt_results() {
        let main = ResultCollector::new();
        let attempt = ResultCollector::new();
        attempt.record(summary(4, Verdict::Pass));
        main.absorb(&attempt);
        assert_eq!(main.completed(), 1);
        assert_eq!(attempt.completed(), 0);
    }

    #[test]
    fn text_report_mentions_verdict() {
        let collector = ResultCollector::new();
        collector.record(summary(0, Verdict::Pass));
        let result = collector.finish(Strategy::Sequential, Duration::ZERO, None, Vec::new(), false);
        assert!(result.generate_text().ends_with("PASS"));
        assert_eq!(result.exit_code(), 0);
    }
}
