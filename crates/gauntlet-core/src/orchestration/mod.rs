//! Orchestration Layer
//!
//! Replicates the single-run executor under one of four strategies:
//!
//! | Strategy | Scheduling |
//! |---|---|
//! | `Sequential` | one replication at a time on the calling task |
//! | `Parallel` | worker pool bounded by `concurrency_limit`, optional ramp-up |
//! | `Distributed` | `Parallel` plus a read-only proxy/credential assignment per replication |
//! | `Batch` | fixed-size batches, whole-batch retry above a failure threshold |
//!
//! Every replication gets its own [`ExecutionContext`]. A worker that panics
//! is recorded in `errors` and its siblings keep running. The stop flag is
//! checked between replications and between batches; a run already in
//! flight is never preempted.

mod assignment;
mod batch;
mod job;
mod result;

pub use assignment::{assign, Assignment, CredentialSet, NetworkProxy, RotationPolicy};
pub use job::{BatchConfig, OrchestrationJob, Strategy};
pub use result::{BatchReport, Breakdown, DimensionStats, OrchestrationResult, ResultCollector};

use crate::context::ExecutionContext;
use crate::error::OrchestrationError;
use crate::executor::Executor;
use crate::types::RunSummary;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Cooperative job-level stop flag
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Create unset flag
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the job to stop starting replications
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if stop was requested
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs orchestration jobs
pub struct Orchestrator {
    executor: Arc<Executor>,
    stop: StopHandle,
}

impl Orchestrator {
    /// Create orchestrator over an executor
    #[must_use]
    pub fn new(executor: Executor) -> Self {
        Self {
            executor: Arc::new(executor),
            stop: StopHandle::new(),
        }
    }

    /// With externally owned stop flag
    #[inline]
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Handle that stops jobs run by this orchestrator
    #[inline]
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Validate and run a job
    ///
    /// # Errors
    /// Returns `OrchestrationError` if the job is rejected before any
    /// replication starts. Failures after that are recorded in the result.
    pub async fn orchestrate(
        &self,
        job: OrchestrationJob,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        job.validate()?;
        let span = tracing::info_span!(
            "orchestrate",
            procedure = %job.procedure.id(),
            strategy = ?job.strategy,
            replications = job.replication_count,
        );
        Ok(self.execute(Arc::new(job)).instrument(span).await)
    }

    async fn execute(&self, job: Arc<OrchestrationJob>) -> OrchestrationResult {
        let clock = tokio::time::Instant::now();
        let collector = Arc::new(ResultCollector::new());
        tracing::info!(concurrency = job.concurrency_limit, "job started");

        let mut assignments = None;
        let mut batches = Vec::new();
        let stopped = match job.strategy {
            Strategy::Sequential => self.sequential(&job, &collector).await,
            Strategy::Parallel => {
                self.pool(&job, 0..job.replication_count, None, &collector)
                    .await
            }
            Strategy::Distributed => {
                let table = assign(
                    &job.proxies,
                    &job.credentials,
                    job.rotation,
                    job.replication_count,
                );
                let stopped = self
                    .pool(&job, 0..job.replication_count, Some(table.as_slice()), &collector)
                    .await;
                assignments = Some(table);
                stopped
            }
            Strategy::Batch => {
                let (stopped, reports) = self.batched(&job, &collector).await;
                batches = reports;
                stopped
            }
        };
        if stopped {
            tracing::warn!(completed = collector.completed(), "job stopped early");
        }

        let result = collector.finish(
            job.strategy,
            clock.elapsed(),
            assignments.as_deref(),
            batches,
            stopped,
        );
        tracing::info!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            errors = result.errors.len(),
            verdict = %result.verdict(),
            "job finished"
        );
        result
    }

    /// One replication at a time; returns `true` if stopped early
    async fn sequential(&self, job: &Arc<OrchestrationJob>, sink: &ResultCollector) -> bool {
        for index in 0..job.replication_count {
            if self.stop.is_stopped() {
                return true;
            }
            let run = replicate(Arc::clone(&self.executor), Arc::clone(job), index, None);
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(summary) => sink.record(summary),
                Err(panic) => sink.record_failure(index, panic_message(panic.as_ref())),
            }
        }
        false
    }

    /// Bounded worker pool over `indices`; returns `true` if stopped early
    async fn pool(
        &self,
        job: &Arc<OrchestrationJob>,
        indices: std::ops::Range<usize>,
        assignments: Option<&[Arc<Assignment>]>,
        sink: &Arc<ResultCollector>,
    ) -> bool {
        let permits = Arc::new(Semaphore::new(job.concurrency_limit));
        let mut workers = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut stopped = false;

        for (started, index) in indices.enumerate() {
            if self.stop.is_stopped() {
                stopped = true;
                break;
            }
            if started > 0 && started < job.concurrency_limit && !job.ramp_up.is_zero() {
                tokio::time::sleep(job.ramp_up).await;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            let executor = Arc::clone(&self.executor);
            let shared_job = Arc::clone(job);
            let assignment = assignments.and_then(|table| table.get(index).cloned());
            let worker_sink = Arc::clone(sink);
            let handle = workers.spawn(async move {
                let summary = replicate(executor, shared_job, index, assignment).await;
                worker_sink.record(summary);
                drop(permit);
            });
            spawned.insert(handle.id(), index);

            while let Some(joined) = workers.try_join_next_with_id() {
                reap(joined, &spawned, sink);
            }
        }

        while let Some(joined) = workers.join_next_with_id().await {
            reap(joined, &spawned, sink);
        }
        stopped
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executor", &self.executor)
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}

/// Run one replication in its own context
async fn replicate(
    executor: Arc<Executor>,
    job: Arc<OrchestrationJob>,
    index: usize,
    assignment: Option<Arc<Assignment>>,
) -> RunSummary {
    let mut context =
        ExecutionContext::new(job.procedure.mode(), job.target.clone()).with_replication(index);
    if let Some(assignment) = assignment {
        if let Some(credential) = &assignment.credential {
            context.add_auth_headers(credential.headers.iter());
            context.add_auth_cookies(credential.cookies.clone());
        }
        context = context.with_assignment(assignment);
    }
    executor
        .run(&job.procedure, &job.target, job.behavior.as_ref(), Some(context))
        .await
}

fn reap(
    joined: Result<(tokio::task::Id, ()), tokio::task::JoinError>,
    spawned: &HashMap<tokio::task::Id, usize>,
    sink: &ResultCollector,
) {
    if let Err(err) = joined {
        let index = spawned.get(&err.id()).copied().unwrap_or(usize::MAX);
        let message = if err.is_panic() {
            panic_message(err.into_panic().as_ref())
        } else {
            err.to_string()
        };
        sink.record_failure(index, message);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::NoDelay;
    use crate::procedure::Procedure;

    struct Never;

    impl crate::procedure::TestProcedure for Never {
        fn id(&self) -> &str {
            "never"
        }

        fn payloads(&self) -> Vec<crate::types::Payload> {
            Vec::new()
        }
    }

    #[async_trait::async_trait]
    impl crate::procedure::DirectProcedure for Never {
        async fn execute_step_direct(
            &self,
            _client: &mut crate::coordinators::DirectClient<'_>,
            _payload: &crate::types::Payload,
        ) -> Result<crate::transport::DirectResponse, crate::error::StepError> {
            Err(crate::error::StepError::procedure("unreachable"))
        }

        async fn verify_result_direct(
            &self,
            _response: &crate::transport::DirectResponse,
            _context: &ExecutionContext,
        ) -> Result<bool, crate::error::StepError> {
            Ok(false)
        }
    }

    fn job(strategy: Strategy) -> OrchestrationJob {
        OrchestrationJob::new(Procedure::direct(Never), "https://app.test", 4)
            .with_strategy(strategy)
            .with_behavior(Arc::new(NoDelay))
    }

    #[test]
    fn validation_rejects_unrunnable_jobs() {
        assert_eq!(
            OrchestrationJob { replication_count: 0, ..job(Strategy::Parallel) }.validate(),
            Err(OrchestrationError::NoReplications)
        );
        assert_eq!(
            job(Strategy::Parallel).with_concurrency(0).validate(),
            Err(OrchestrationError::ZeroConcurrency)
        );
        assert_eq!(
            job(Strategy::Distributed).validate(),
            Err(OrchestrationError::EmptyPools)
        );
        assert_eq!(
            job(Strategy::Batch)
                .with_batch(BatchConfig::default().with_batch_size(0))
                .validate(),
            Err(OrchestrationError::ZeroBatchSize)
        );
        assert!(matches!(
            job(Strategy::Batch)
                .with_batch(BatchConfig::default().with_failure_threshold(1.5))
                .validate(),
            Err(OrchestrationError::InvalidThreshold(_))
        ));
        assert!(job(Strategy::Sequential).validate().is_ok());
    }

    #[test]
    fn stop_handle_is_shared() {
        let a = StopHandle::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked: boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked: bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked");
    }
}
