//! Batch strategy
//!
//! Replications are cut into fixed-size batches. Batches run in waves of
//! `max_concurrent_batches`; inside a batch the replications share a pool of
//! `concurrency_limit` workers. A batch whose failure rate exceeds the
//! threshold, or that had a crashed worker or a setup failure, is re-run as
//! a whole up to `max_batch_retries` more times. Only the final attempt's
//! results are kept.

use super::{BatchReport, OrchestrationJob, Orchestrator, ResultCollector};
use std::ops::Range;
use std::sync::Arc;

/// Final attempt of one batch
struct BatchOutcome {
    report: BatchReport,
    results: Arc<ResultCollector>,
    stopped: bool,
}

impl Orchestrator {
    /// Returns `(stopped, reports)`
    pub(super) async fn batched(
        &self,
        job: &Arc<OrchestrationJob>,
        sink: &Arc<ResultCollector>,
    ) -> (bool, Vec<BatchReport>) {
        let config = &job.batch;
        let ranges = partition(job.replication_count, config.batch_size);
        let mut reports = Vec::with_capacity(ranges.len());

        for (wave, chunk) in ranges.chunks(config.max_concurrent_batches).enumerate() {
            if self.stop.is_stopped() {
                return (true, reports);
            }
            if wave > 0 && !config.batch_delay.is_zero() {
                tokio::time::sleep(config.batch_delay).await;
            }

            let first_index = wave * config.max_concurrent_batches;
            let runs = chunk
                .iter()
                .enumerate()
                .map(|(offset, range)| self.run_batch(job, first_index + offset, range.clone()));
            let mut stopped = false;
            for outcome in futures::future::join_all(runs).await {
                sink.absorb(&outcome.results);
                stopped |= outcome.stopped;
                reports.push(outcome.report);
            }
            if stopped {
                return (true, reports);
            }
        }
        (false, reports)
    }

    async fn run_batch(
        &self,
        job: &Arc<OrchestrationJob>,
        index: usize,
        range: Range<usize>,
    ) -> BatchOutcome {
        let config = &job.batch;
        let size = range.len();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let results = Arc::new(ResultCollector::new());
            let stopped = self.pool(job, range.clone(), None, &results).await;

            let failure_rate = failure_rate(results.failures(), size);
            let failing = failure_rate > config.failure_threshold || results.has_fatal();
            let exhausted = attempts > config.max_batch_retries;

            if !failing || exhausted || stopped || self.stop.is_stopped() {
                if failing {
                    tracing::error!(batch = index, attempts, failure_rate, "batch failed");
                } else {
                    tracing::info!(batch = index, attempts, failure_rate, "batch completed");
                }
                return BatchOutcome {
                    report: BatchReport {
                        index,
                        first_replication: range.start,
                        size,
                        attempts,
                        failure_rate,
                        failed: failing,
                    },
                    results,
                    stopped,
                };
            }
            tracing::warn!(batch = index, attempt = attempts, failure_rate, "retrying batch");
        }
    }
}

/// Consecutive ranges of at most `size` covering `0..count`
fn partition(count: usize, size: usize) -> Vec<Range<usize>> {
    (0..count)
        .step_by(size.max(1))
        .map(|start| start..(start + size).min(count))
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn failure_rate(failures: usize, size: usize) -> f64 {
    if size == 0 {
        0.0
    } else {
        failures as f64 / size as f64
    }
}
