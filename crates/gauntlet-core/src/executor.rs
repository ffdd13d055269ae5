//! Single-run executor
//!
//! Drives one procedure's payload stream through the behavior lifecycle and
//! produces a [`RunSummary`].
//!
//! # Invariants
//!
//! - Only the transport matching the procedure's mode is constructed.
//! - Step and protocol failures never escape a run; they are recorded on the
//!   step and handed to `Behavior::on_error`.
//! - The session is closed on every exit path once it was constructed.
//! - The verdict is computed once, after the step list is closed.

use crate::behavior::Behavior;
use crate::context::ExecutionContext;
use crate::coordinators::{CsrfCoordinator, DirectClient, RateLimitCoordinator};
use crate::error::{AuthError, SetupError, StepError, TransportError};
use crate::lifecycle::{RunLifecycle, RunPhase};
use crate::procedure::{DirectProcedure, InteractiveProcedure, Procedure};
use crate::transport::{
    self, DirectResponse, DirectSession, InteractiveSession, ResponseMeta, TransportFactory,
};
use crate::types::{ExpectedPolicy, Payload, RunId, RunSummary, StepResult, StopReason, TransportSnapshot};
use crate::verdict;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Default header carrying the application version
pub const DEFAULT_VERSION_HEADER: &str = "X-Target-Version";

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Header read into each step's snapshot
    pub version_header: String,
    /// Upper bound on one call; exceeded calls become step errors
    pub step_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            version_header: DEFAULT_VERSION_HEADER.to_string(),
            step_timeout: None,
        }
    }
}

impl ExecutorConfig {
    /// Create default config
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With version header
    #[inline]
    #[must_use]
    pub fn with_version_header(mut self, header: impl Into<String>) -> Self {
        self.version_header = header.into();
        self
    }

    /// With per-call timeout
    #[inline]
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// Single-run executor
pub struct Executor {
    factory: Arc<dyn TransportFactory>,
    config: ExecutorConfig,
}

impl Executor {
    /// Create executor over a transport factory
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            config: ExecutorConfig::default(),
        }
    }

    /// With config
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a procedure once
    ///
    /// A pre-seeded `context` keeps its own target; otherwise a fresh context
    /// is created for `target` in the procedure's mode.
    pub async fn run(
        &self,
        procedure: &Procedure,
        target: &str,
        behavior: &dyn Behavior,
        context: Option<ExecutionContext>,
    ) -> RunSummary {
        let mut context = context.unwrap_or_else(|| ExecutionContext::new(procedure.mode(), target));
        self.run_in(procedure, behavior, &mut context).await
    }

    /// Run a procedure once inside a caller-owned context
    ///
    /// Use this to share auth and rate-limit state across cooperating runs.
    pub async fn run_in(
        &self,
        procedure: &Procedure,
        behavior: &dyn Behavior,
        context: &mut ExecutionContext,
    ) -> RunSummary {
        let span = tracing::info_span!(
            "run",
            procedure = %procedure.id(),
            mode = %procedure.mode(),
            replication = ?context.replication(),
        );
        self.execute(procedure, behavior, context).instrument(span).await
    }

    async fn execute(
        &self,
        procedure: &Procedure,
        behavior: &dyn Behavior,
        context: &mut ExecutionContext,
    ) -> RunSummary {
        let run = RunRecord::start(procedure, context.replication());

        if context.mode() != procedure.mode() {
            let err = SetupError::ModeMismatch {
                context: context.mode(),
                procedure: procedure.mode(),
            };
            return run.setup_failed(&err);
        }

        match procedure {
            Procedure::Interactive(p) => match self.interactive_driver(p, context).await {
                Ok(mut driver) => self.drive(&mut driver, procedure, behavior, context, run).await,
                Err(err) => run.setup_failed(&err),
            },
            Procedure::Direct(p) => match self.direct_driver(p, context).await {
                Ok(mut driver) => self.drive(&mut driver, procedure, behavior, context, run).await,
                Err(err) => run.setup_failed(&err),
            },
        }
    }

    async fn interactive_driver(
        &self,
        procedure: &Arc<dyn InteractiveProcedure>,
        context: &mut ExecutionContext,
    ) -> Result<InteractiveDriver, SetupError> {
        let mut session = self.factory.interactive(context).await?;
        if let Some(auth) = procedure.authentication() {
            if let Err(err) = authenticate_interactive(auth.as_ref(), session.as_mut(), context).await {
                close_quietly(session.close().await);
                return Err(err.into());
            }
        }
        Ok(InteractiveDriver {
            procedure: Arc::clone(procedure),
            session,
            version_header: self.config.version_header.clone(),
        })
    }

    async fn direct_driver(
        &self,
        procedure: &Arc<dyn DirectProcedure>,
        context: &mut ExecutionContext,
    ) -> Result<DirectDriver, SetupError> {
        let mut session = self.factory.direct(context).await?;
        if let Some(auth) = procedure.authentication() {
            let material = async { Ok::<_, AuthError>((auth.auth_headers().await?, auth.auth_cookies().await?)) };
            match material.await {
                Ok((headers, cookies)) => {
                    context.add_auth_headers(headers.iter());
                    context.add_auth_cookies(cookies);
                    tracing::debug!(mechanism = auth.name(), "direct auth material loaded");
                }
                Err(err) => {
                    close_quietly(session.close().await);
                    return Err(err.into());
                }
            }
        }
        Ok(DirectDriver {
            procedure: Arc::clone(procedure),
            session,
            csrf: procedure.csrf().map(CsrfCoordinator::new),
            rate_limit: procedure.rate_limit().map(RateLimitCoordinator::new),
            response: None,
            meta: None,
            version_header: self.config.version_header.clone(),
        })
    }

    async fn drive<D: StepDriver>(
        &self,
        driver: &mut D,
        procedure: &Procedure,
        behavior: &dyn Behavior,
        context: &mut ExecutionContext,
        mut run: RunRecord,
    ) -> RunSummary {
        let steps = AssertUnwindSafe(self.steps(driver, procedure, behavior, context, &mut run))
            .catch_unwind()
            .await;
        close_quietly(driver.close().await);
        match steps {
            Ok((results, stop)) => run.finish(results, stop),
            Err(panic) => {
                tracing::error!(run_id = %run.run_id, "run panicked, session closed");
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// `PRE_RUN` through `POST_RUN`; the caller owns closing the session
    async fn steps<D: StepDriver>(
        &self,
        driver: &mut D,
        procedure: &Procedure,
        behavior: &dyn Behavior,
        context: &mut ExecutionContext,
        run: &mut RunRecord,
    ) -> (Vec<StepResult>, StopReason) {
        let policy = procedure.expected_policy();
        let expected = procedure.expected();

        run.enter(RunPhase::PreRun);
        behavior.pre_run(context).await;

        let mut results: Vec<StepResult> = Vec::new();
        let mut consecutive_failures = 0usize;
        let mut stop = StopReason::Completed;

        for (index, payload) in procedure.payloads().into_iter().enumerate() {
            let step = index + 1;

            run.enter(RunPhase::CheckContinue);
            if !behavior.should_continue(step, consecutive_failures) {
                tracing::info!(step, consecutive_failures, "behavior halted run");
                stop = StopReason::Halted;
                break;
            }

            run.enter(RunPhase::PreStep);
            behavior.pre_step(context, step).await;

            run.enter(RunPhase::Call);
            let call = self.call(driver, &payload, context).await;

            run.enter(RunPhase::Delay);
            let delay = behavior.step_delay(step);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let outcome = match call {
                Ok(()) => {
                    run.enter(RunPhase::Verify);
                    driver.verify(context).await
                }
                Err(err) => Err(err),
            };

            let step_expected = match policy {
                ExpectedPolicy::WholeRun => expected,
                ExpectedPolicy::PerStep => payload.expected.unwrap_or(expected),
            };
            let (actual, error) = match &outcome {
                Ok(actual) => (*actual, None),
                Err(err) => (false, Some(err.to_string())),
            };
            let result = StepResult {
                step,
                payload,
                expected: step_expected,
                actual,
                snapshot: driver.snapshot(context),
                timestamp: Utc::now(),
                error,
            };
            tracing::debug!(step, actual, expected = step_expected, "step recorded");

            run.enter(RunPhase::PostStep);
            behavior.post_step(context, step, &result).await;
            results.push(result);

            match outcome {
                Ok(_) => consecutive_failures = 0,
                Err(err) => {
                    consecutive_failures += 1;
                    run.enter(RunPhase::OnError);
                    tracing::warn!(step, error = %err, "step failed");
                    if !behavior.on_error(&err, step) {
                        stop = StopReason::Aborted;
                        break;
                    }
                }
            }
        }

        run.enter(RunPhase::PostRun);
        behavior.post_run(context, &results).await;
        (results, stop)
    }

    async fn call<D: StepDriver>(
        &self,
        driver: &mut D,
        payload: &Payload,
        context: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        match self.config.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, driver.call(payload, context)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }
                .into()),
            },
            None => driver.call(payload, context).await,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("config", &self.config).finish()
    }
}

/// Hybrid cookies first, then the mechanism's own login
async fn authenticate_interactive(
    auth: &dyn crate::auth::Authentication,
    session: &mut dyn InteractiveSession,
    context: &mut ExecutionContext,
) -> Result<(), AuthError> {
    let cookies = auth.auth_cookies().await?;
    if !cookies.is_empty() {
        let target = context.target().to_string();
        session.navigate(transport::origin(&target)).await?;
        for (name, value) in &cookies {
            session.set_cookie(name, value, transport::host(&target)).await?;
        }
        context.add_auth_cookies(cookies);
    }
    let target = context.target().to_string();
    if auth.authenticate(session, &target).await? {
        tracing::debug!(mechanism = auth.name(), "interactive session authenticated");
        Ok(())
    } else {
        Err(AuthError::Rejected {
            mechanism: auth.name().to_string(),
        })
    }
}

fn close_quietly(result: Result<(), TransportError>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "session close failed");
    }
}

/// In-progress summary plus lifecycle
struct RunRecord {
    run_id: RunId,
    procedure_id: String,
    mode: crate::types::ExecutionMode,
    expected_policy: ExpectedPolicy,
    expected: bool,
    replication: Option<usize>,
    started_at: chrono::DateTime<Utc>,
    clock: tokio::time::Instant,
    lifecycle: RunLifecycle,
}

impl RunRecord {
    fn start(procedure: &Procedure, replication: Option<usize>) -> Self {
        let run_id = RunId::new();
        tracing::info!(run_id = %run_id, "run started");
        Self {
            run_id,
            procedure_id: procedure.id().to_string(),
            mode: procedure.mode(),
            expected_policy: procedure.expected_policy(),
            expected: procedure.expected(),
            replication,
            started_at: Utc::now(),
            clock: tokio::time::Instant::now(),
            lifecycle: RunLifecycle::new(),
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        if let Err(err) = self.lifecycle.advance(phase) {
            debug_assert!(false, "{err}");
            tracing::error!(error = %err, "run lifecycle violated");
        }
    }

    fn setup_failed(mut self, err: &SetupError) -> RunSummary {
        tracing::error!(error = %err, "run setup failed");
        self.enter(RunPhase::Aborted);
        let mut summary = self.summarize(Vec::new(), StopReason::SetupFailed);
        summary.verdict = verdict::Verdict::Fail;
        summary.aborted = true;
        summary.setup_error = Some(err.to_string());
        summary
    }

    fn finish(mut self, results: Vec<StepResult>, stop: StopReason) -> RunSummary {
        self.enter(match stop {
            StopReason::Completed => RunPhase::Done,
            _ => RunPhase::Aborted,
        });
        let summary = self.summarize(results, stop);
        tracing::info!(
            verdict = %summary.verdict,
            steps = summary.step_results.len(),
            successes = summary.successful_steps(),
            stop = ?stop,
            "run finished"
        );
        summary
    }

    fn summarize(self, step_results: Vec<StepResult>, stop_reason: StopReason) -> RunSummary {
        let verdict = verdict::evaluate(self.expected_policy, self.expected, &step_results);
        RunSummary {
            run_id: self.run_id,
            procedure_id: self.procedure_id,
            mode: self.mode,
            expected_policy: self.expected_policy,
            expected: self.expected,
            step_results,
            verdict,
            aborted: stop_reason == StopReason::Aborted,
            stop_reason,
            final_phase: self.lifecycle.phase(),
            setup_error: None,
            replication: self.replication,
            started_at: self.started_at,
            duration: self.clock.elapsed(),
        }
    }
}

/// One mode's step/verify pair bound to its session
#[async_trait::async_trait]
trait StepDriver: Send {
    async fn call(&mut self, payload: &Payload, context: &mut ExecutionContext) -> Result<(), StepError>;

    async fn verify(&mut self, context: &ExecutionContext) -> Result<bool, StepError>;

    fn snapshot(&self, context: &ExecutionContext) -> TransportSnapshot;

    async fn close(&mut self) -> Result<(), TransportError>;
}

struct InteractiveDriver {
    procedure: Arc<dyn InteractiveProcedure>,
    session: Box<dyn InteractiveSession>,
    version_header: String,
}

#[async_trait::async_trait]
impl StepDriver for InteractiveDriver {
    async fn call(&mut self, payload: &Payload, context: &mut ExecutionContext) -> Result<(), StepError> {
        self.procedure
            .execute_step(self.session.as_mut(), payload, context)
            .await
    }

    async fn verify(&mut self, context: &ExecutionContext) -> Result<bool, StepError> {
        self.procedure.verify_result(self.session.as_mut(), context).await
    }

    fn snapshot(&self, _context: &ExecutionContext) -> TransportSnapshot {
        TransportSnapshot {
            url: self.session.current_url(),
            status: None,
            target_version: self.session.response_header(&self.version_header),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

struct DirectDriver {
    procedure: Arc<dyn DirectProcedure>,
    session: Box<dyn DirectSession>,
    csrf: Option<CsrfCoordinator>,
    rate_limit: Option<RateLimitCoordinator>,
    response: Option<DirectResponse>,
    /// Metadata of the last response sent during the current step
    meta: Option<ResponseMeta>,
    version_header: String,
}

#[async_trait::async_trait]
impl StepDriver for DirectDriver {
    async fn call(&mut self, payload: &Payload, context: &mut ExecutionContext) -> Result<(), StepError> {
        self.response = None;
        self.meta = None;
        let mut client = DirectClient::new(self.session.as_mut(), context)
            .with_csrf(self.csrf.as_ref())
            .with_rate_limit(self.rate_limit.as_ref());
        let outcome = self.procedure.execute_step_direct(&mut client, payload).await;
        if client.requests_sent() > 0 {
            self.meta = client.context().last_response().cloned();
        }
        self.response = Some(outcome?);
        Ok(())
    }

    async fn verify(&mut self, context: &ExecutionContext) -> Result<bool, StepError> {
        match &self.response {
            Some(response) => self.procedure.verify_result_direct(response, context).await,
            None => Err(StepError::Verification("no response to verify".to_string())),
        }
    }

    fn snapshot(&self, _context: &ExecutionContext) -> TransportSnapshot {
        let Some(meta) = &self.meta else {
            return TransportSnapshot::default();
        };
        TransportSnapshot {
            url: Some(meta.url.clone()),
            status: Some(meta.status),
            target_version: meta.headers.get(&self.version_header).map(str::to_string),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::NoDelay;
    use crate::procedure::TestProcedure;
    use crate::transport::DirectRequest;
    use crate::types::ExecutionMode;
    use crate::verdict::Verdict;
    use parking_lot::Mutex;

    struct EchoSession;

    #[async_trait::async_trait]
    impl DirectSession for EchoSession {
        async fn send(
            &mut self,
            request: &DirectRequest,
        ) -> Result<DirectResponse, TransportError> {
            let status = if request.url.contains("ok") { 200 } else { 404 };
            Ok(DirectResponse::new(status, request.url.clone()).with_header(DEFAULT_VERSION_HEADER, "3.1"))
        }
    }

    #[derive(Default)]
    struct EchoFactory {
        interactive_calls: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl TransportFactory for EchoFactory {
        async fn interactive(
            &self,
            _context: &ExecutionContext,
        ) -> Result<Box<dyn InteractiveSession>, TransportError> {
            *self.interactive_calls.lock() += 1;
            Err(TransportError::Construction("no browser".into()))
        }

        async fn direct(
            &self,
            _context: &ExecutionContext,
        ) -> Result<Box<dyn DirectSession>, TransportError> {
            Ok(Box::new(EchoSession))
        }
    }

    struct Paths {
        paths: Vec<&'static str>,
        expected: bool,
    }

    impl TestProcedure for Paths {
        fn id(&self) -> &str {
            "paths"
        }

        fn expected(&self) -> bool {
            self.expected
        }

        fn payloads(&self) -> Vec<Payload> {
            self.paths.iter().map(|p| Payload::new(*p)).collect()
        }
    }

    #[async_trait::async_trait]
    impl DirectProcedure for Paths {
        async fn execute_step_direct(
            &self,
            client: &mut DirectClient<'_>,
            payload: &Payload,
        ) -> Result<DirectResponse, StepError> {
            let path = payload.as_str().unwrap_or_default();
            if path == "!missing" {
                return Err(StepError::procedure("element missing"));
            }
            client.send(DirectRequest::get(path)).await
        }

        async fn verify_result_direct(
            &self,
            response: &DirectResponse,
            _context: &ExecutionContext,
        ) -> Result<bool, StepError> {
            Ok(response.is_success())
        }
    }

    #[tokio::test]
    async fn direct_run_records_snapshots_and_versions() {
        let factory = Arc::new(EchoFactory::default());
        let executor = Executor::new(factory.clone());
        let procedure = Procedure::direct(Paths {
            paths: vec!["/missing", "/ok"],
            expected: true,
        });

        let summary = executor.run(&procedure, "https://app.test", &NoDelay, None).await;
        assert_eq!(summary.verdict, Verdict::Pass);
        assert_eq!(summary.step_results.len(), 2);
        assert_eq!(summary.step_results[0].snapshot.status, Some(404));
        assert_eq!(
            summary.step_results[1].snapshot.url.as_deref(),
            Some("https://app.test/ok")
        );
        assert_eq!(summary.target_versions(), vec!["3.1".to_string()]);
        assert_eq!(summary.final_phase, RunPhase::Done);
        assert_eq!(*factory.interactive_calls.lock(), 0);
    }

    #[tokio::test]
    async fn step_failing_before_send_has_empty_snapshot() {
        let executor = Executor::new(Arc::new(EchoFactory::default()));
        let procedure = Procedure::direct(Paths {
            paths: vec!["/ok", "!missing"],
            expected: true,
        });

        let summary = executor.run(&procedure, "https://app.test", &NoDelay, None).await;
        assert_eq!(summary.step_results.len(), 2);
        assert_eq!(summary.step_results[0].snapshot.status, Some(200));
        let failed = &summary.step_results[1];
        assert_eq!(failed.error.as_deref(), Some("step failed: element missing"));
        assert_eq!(failed.snapshot, TransportSnapshot::default());
        let versioned = summary
            .step_results
            .iter()
            .filter(|r| r.snapshot.target_version.is_some())
            .count();
        assert_eq!(versioned, 1);
    }

    #[tokio::test]
    async fn mode_mismatch_is_setup_failure() {
        let executor = Executor::new(Arc::new(EchoFactory::default()));
        let procedure = Procedure::direct(Paths {
            paths: vec!["/ok"],
            expected: true,
        });
        let seeded = ExecutionContext::new(ExecutionMode::Interactive, "https://app.test");

        let summary = executor
            .run(&procedure, "https://app.test", &NoDelay, Some(seeded))
            .await;
        assert_eq!(summary.stop_reason, StopReason::SetupFailed);
        assert!(summary.aborted);
        assert_eq!(summary.verdict, Verdict::Fail);
        assert!(summary.step_results.is_empty());
    }
}
