//! Functional tests for the single-run executor and its coordinators.
//!
//! Guarantees exercised here:
//! - Transport dispatch: a run only ever constructs the session its mode
//!   calls for.
//! - Verdicts: WHOLE_RUN and PER_STEP expectations map to PASS/FAIL and to
//!   the process exit code.
//! - CSRF: a rejected state-changing request is refreshed and retried at
//!   most once.
//! - Rate limiting: once a resume time is recorded, nothing is sent through
//!   the same context before it.
//! - Setup failures end the run immediately with an aborted summary.
//! - Hooks fire in lifecycle order, `post_run` included when the behavior
//!   halts the run.
//! - A constructed session is closed exactly once, whether the run
//!   completes, aborts or fails authentication.

use gauntlet_core::{
    Authentication, BearerTokenAuth, Behavior, CsrfConfig, DirectResponse, ExecutionContext,
    ExecutionMode, Executor, ExpectedPolicy, InteractiveProcedure, InteractiveSession,
    MachineBehavior, NoDelay, Payload, Procedure, RateLimitConfig, RunPhase, StaticAuth,
    StepError, StepResult, StopReason, TestProcedure, Verdict,
};
use gauntlet_test_utils::{with_csrf_cookie, RecordingFactory, ScriptedProcedure};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "https://app.test";

fn executor(factory: &Arc<RecordingFactory>) -> Executor {
    Executor::new(Arc::clone(factory) as Arc<dyn gauntlet_core::TransportFactory>)
}

/// A DIRECT run never asks for a browser, an INTERACTIVE run never asks for
/// an HTTP client.
#[tokio::test]
async fn each_mode_builds_only_its_own_transport() {
    let factory = Arc::new(RecordingFactory::new());
    let executor = executor(&factory);

    let direct = Procedure::direct(ScriptedProcedure::passing(2));
    let summary = executor.run(&direct, TARGET, &NoDelay, None).await;
    assert_eq!(summary.mode, ExecutionMode::Direct);
    assert_eq!(factory.direct_built(), 1);
    assert_eq!(factory.interactive_built(), 0);
    assert_eq!(factory.requests.len(), 2);

    let interactive = Procedure::interactive(ScriptedProcedure::passing(2));
    let summary = executor.run(&interactive, TARGET, &NoDelay, None).await;
    assert_eq!(summary.mode, ExecutionMode::Interactive);
    assert_eq!(factory.direct_built(), 1);
    assert_eq!(factory.interactive_built(), 1);
    assert_eq!(
        *factory.navigations.lock(),
        vec![format!("{TARGET}/step/1"), format!("{TARGET}/step/2")]
    );
    assert_eq!(summary.target_versions(), vec!["web-1".to_string()]);
}

/// Three payloads, expected=false, nothing gets through: PASS, exit code 0.
#[tokio::test]
async fn blocked_payloads_pass_when_blocking_was_expected() {
    let factory = Arc::new(RecordingFactory::new());
    let procedure = Procedure::direct(ScriptedProcedure::failing(3).with_expected(false));

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    assert_eq!(summary.step_results.len(), 3);
    assert_eq!(summary.successful_steps(), 0);
    assert_eq!(summary.verdict, Verdict::Pass);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.final_phase, RunPhase::Done);
}

/// Same procedure, one step gets through: FAIL, exit code 1.
#[tokio::test]
async fn single_success_fails_a_blocking_expectation() {
    let factory = Arc::new(RecordingFactory::new());
    let procedure = Procedure::direct(
        ScriptedProcedure::new(3, |_, step| step == 2).with_expected(false),
    );

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    assert_eq!(summary.successful_steps(), 1);
    assert_eq!(summary.verdict, Verdict::Fail);
    assert_eq!(summary.exit_code(), 1);
}

/// PER_STEP compares each step with its own expectation.
#[tokio::test]
async fn per_step_policy_checks_every_step() {
    let factory = Arc::new(RecordingFactory::new());
    let procedure = ScriptedProcedure::new(3, |_, step| step != 3)
        .with_policy(ExpectedPolicy::PerStep)
        .with_expected(true);
    assert_eq!(procedure.expected_policy(), ExpectedPolicy::PerStep);

    let summary = executor(&factory)
        .run(&Procedure::direct(procedure), TARGET, &NoDelay, None)
        .await;
    assert!(summary.step_results.iter().all(|r| r.expected));
    assert_eq!(summary.verdict, Verdict::Fail);

    let all_pass = ScriptedProcedure::passing(3).with_policy(ExpectedPolicy::PerStep);
    let summary = executor(&factory)
        .run(&Procedure::direct(all_pass), TARGET, &NoDelay, None)
        .await;
    assert_eq!(summary.verdict, Verdict::Pass);
}

/// A CSRF rejection triggers exactly one refresh and one retry; a second
/// rejection surfaces as a step error instead of another retry.
#[tokio::test]
async fn csrf_rejection_is_retried_once() {
    let factory = Arc::new(RecordingFactory::new().with_script([
        with_csrf_cookie(403, "stale"),
        with_csrf_cookie(200, "fresh"),
        DirectResponse::new(403, ""),
    ]));
    let procedure = Procedure::direct(
        ScriptedProcedure::passing(1).with_csrf(CsrfConfig::default()),
    );

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    let requests = factory.requests.snapshot();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].request.method.as_str(), "POST");
    assert_eq!(requests[1].request.method.as_str(), "GET");
    assert_eq!(requests[1].request.url, TARGET);
    assert_eq!(requests[2].request.headers.get("x-csrf-token"), Some("fresh"));

    let step = &summary.step_results[0];
    assert!(!step.actual);
    assert!(step.error.as_deref().is_some_and(|e| e.contains("403")));
    assert_eq!(summary.verdict, Verdict::Fail);
}

/// A recovered CSRF rejection leaves the step successful.
#[tokio::test]
async fn csrf_refresh_recovers_the_step() {
    let factory = Arc::new(RecordingFactory::new().with_script([
        DirectResponse::new(419, ""),
        with_csrf_cookie(200, "fresh"),
    ]));
    let procedure = Procedure::direct(
        ScriptedProcedure::passing(1).with_csrf(CsrfConfig::default().with_failure_statuses([419])),
    );

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    assert_eq!(factory.requests.len(), 3);
    assert!(summary.step_results[0].error.is_none());
    assert_eq!(summary.verdict, Verdict::Pass);
}

/// After a 429 with `Retry-After: 2`, the next request starts no earlier
/// than two seconds later.
#[tokio::test(start_paused = true)]
async fn throttled_context_waits_for_resume_time() {
    let factory = Arc::new(RecordingFactory::new().with_script([
        DirectResponse::new(429, "").with_header("Retry-After", "2"),
    ]));
    let procedure = Procedure::direct(ScriptedProcedure::passing(2).with_rate_limit(Some(
        RateLimitConfig::default().with_max_retries(0),
    )));

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    let requests = factory.requests.snapshot();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].at.duration_since(requests[0].at) >= Duration::from_secs(2));
    assert_eq!(summary.step_results[0].snapshot.status, Some(429));
    assert_eq!(summary.step_results[1].snapshot.status, Some(200));
}

/// With a retry budget the throttled request itself is re-sent after the
/// wait.
#[tokio::test(start_paused = true)]
async fn throttled_request_is_resent_after_waiting() {
    let factory = Arc::new(RecordingFactory::new().with_script([
        DirectResponse::new(503, "").with_header("Retry-After", "3"),
    ]));
    let procedure = Procedure::direct(ScriptedProcedure::passing(1));

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    let requests = factory.requests.snapshot();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].at.duration_since(requests[0].at) >= Duration::from_secs(3));
    assert_eq!(summary.step_results[0].snapshot.status, Some(200));
}

/// Transport construction failure aborts before any hook or step.
#[tokio::test]
async fn construction_failure_aborts_the_run() {
    let factory = Arc::new(RecordingFactory::new().failing());
    let procedure = Procedure::direct(ScriptedProcedure::passing(3));

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    assert!(summary.aborted);
    assert!(summary.step_results.is_empty());
    assert_eq!(summary.stop_reason, StopReason::SetupFailed);
    assert_eq!(summary.final_phase, RunPhase::Aborted);
    assert_eq!(summary.verdict, Verdict::Fail);
}

/// A context seeded for the wrong mode is rejected before any transport is
/// built.
#[tokio::test]
async fn mismatched_context_is_a_setup_failure() {
    let factory = Arc::new(RecordingFactory::new());
    let procedure = Procedure::direct(ScriptedProcedure::passing(1));
    let context = ExecutionContext::new(ExecutionMode::Interactive, TARGET);

    let summary = executor(&factory)
        .run(&procedure, TARGET, &NoDelay, Some(context))
        .await;
    assert!(summary.setup_error.is_some());
    assert_eq!(factory.direct_built(), 0);
    assert_eq!(factory.interactive_built(), 0);
}

/// Fail-fast aborts on the first step error.
#[tokio::test]
async fn fail_fast_behavior_aborts_on_first_error() {
    let factory = Arc::new(RecordingFactory::new().with_script([
        DirectResponse::new(403, ""),
        DirectResponse::new(403, ""),
        DirectResponse::new(403, ""),
    ]));
    let procedure = Procedure::direct(
        ScriptedProcedure::passing(3).with_csrf(CsrfConfig::default()),
    );
    let behavior = MachineBehavior::new().with_fail_fast(true);

    let summary = executor(&factory).run(&procedure, TARGET, &behavior, None).await;
    assert!(summary.aborted);
    assert_eq!(summary.stop_reason, StopReason::Aborted);
    assert_eq!(summary.step_results.len(), 1);
}

/// Interactive scripted procedure with an authentication mechanism
#[derive(Debug)]
struct WithAuth(ScriptedProcedure, Arc<dyn Authentication>);

impl TestProcedure for WithAuth {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn payloads(&self) -> Vec<Payload> {
        self.0.payloads()
    }

    fn authentication(&self) -> Option<Arc<dyn Authentication>> {
        Some(Arc::clone(&self.1))
    }
}

#[async_trait::async_trait]
impl InteractiveProcedure for WithAuth {
    async fn execute_step(
        &self,
        session: &mut dyn InteractiveSession,
        payload: &Payload,
        context: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        self.0.execute_step(session, payload, context).await
    }

    async fn verify_result(
        &self,
        session: &mut dyn InteractiveSession,
        context: &ExecutionContext,
    ) -> Result<bool, StepError> {
        self.0.verify_result(session, context).await
    }
}

/// Hybrid authentication sets cookies on the browser before the run.
#[tokio::test]
async fn interactive_auth_cookies_reach_the_session() {
    let factory = Arc::new(RecordingFactory::new());
    let auth = Arc::new(StaticAuth::new().with_cookie("session", "abc"));
    let procedure = Procedure::interactive(WithAuth(ScriptedProcedure::passing(1), auth));

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    assert_eq!(summary.verdict, Verdict::Pass);
    let cookies = factory.cookies.lock().clone();
    assert_eq!(
        cookies,
        vec![("session".to_string(), "abc".to_string(), Some("app.test".to_string()))]
    );
}

/// Records every hook call; halts before `halt_at` when set
#[derive(Debug, Default)]
struct HookLog {
    calls: Mutex<Vec<String>>,
    halt_at: Option<usize>,
}

impl HookLog {
    fn halting_at(step: usize) -> Self {
        Self {
            halt_at: Some(step),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn push(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait::async_trait]
impl Behavior for HookLog {
    async fn pre_run(&self, _context: &mut ExecutionContext) {
        self.push("pre_run");
    }

    async fn pre_step(&self, _context: &mut ExecutionContext, step: usize) {
        self.push(format!("pre_step {step}"));
    }

    async fn post_step(&self, _context: &mut ExecutionContext, step: usize, _result: &StepResult) {
        self.push(format!("post_step {step}"));
    }

    async fn post_run(&self, _context: &mut ExecutionContext, results: &[StepResult]) {
        self.push(format!("post_run {}", results.len()));
    }

    fn should_continue(&self, step: usize, _consecutive_failures: usize) -> bool {
        self.halt_at.map_or(true, |halt| step < halt)
    }
}

/// Hooks fire as pre_run, then pre_step/post_step per payload, then
/// post_run with the full step list.
#[tokio::test]
async fn hooks_fire_in_lifecycle_order() {
    let factory = Arc::new(RecordingFactory::new());
    let behavior = HookLog::default();
    let procedure = Procedure::direct(ScriptedProcedure::passing(2));

    let summary = executor(&factory).run(&procedure, TARGET, &behavior, None).await;
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(
        behavior.calls(),
        vec!["pre_run", "pre_step 1", "post_step 1", "pre_step 2", "post_step 2", "post_run 2"]
    );
}

/// `should_continue` returning false stops the run without marking it
/// aborted, and teardown still runs.
#[tokio::test]
async fn halting_behavior_stops_without_aborting() {
    let factory = Arc::new(RecordingFactory::new());
    let behavior = HookLog::halting_at(3);
    let procedure = Procedure::direct(ScriptedProcedure::passing(5));

    let summary = executor(&factory).run(&procedure, TARGET, &behavior, None).await;
    assert_eq!(summary.stop_reason, StopReason::Halted);
    assert!(!summary.aborted);
    assert_eq!(summary.step_results.len(), 2);
    assert_eq!(summary.final_phase, RunPhase::Aborted);
    assert_eq!(factory.requests.len(), 2);
    assert_eq!(behavior.calls().last().map(String::as_str), Some("post_run 2"));
    assert_eq!(factory.closed(), 1);
}

/// Completed runs close their session once, in either mode.
#[tokio::test]
async fn completed_runs_close_their_session() {
    let factory = Arc::new(RecordingFactory::new());
    let executor = executor(&factory);

    executor
        .run(&Procedure::direct(ScriptedProcedure::passing(2)), TARGET, &NoDelay, None)
        .await;
    assert_eq!(factory.closed(), 1);

    executor
        .run(&Procedure::interactive(ScriptedProcedure::passing(2)), TARGET, &NoDelay, None)
        .await;
    assert_eq!(factory.closed(), 2);
}

/// An `on_error` abort still closes the session.
#[tokio::test]
async fn aborted_run_closes_its_session() {
    let factory = Arc::new(RecordingFactory::new().with_fallback(DirectResponse::new(403, "")));
    let procedure = Procedure::direct(
        ScriptedProcedure::passing(3).with_csrf(CsrfConfig::default()),
    );
    let behavior = MachineBehavior::new().with_fail_fast(true);

    let summary = executor(&factory).run(&procedure, TARGET, &behavior, None).await;
    assert_eq!(summary.stop_reason, StopReason::Aborted);
    assert_eq!(factory.direct_built(), 1);
    assert_eq!(factory.closed(), 1);
}

/// A session whose authentication fails is closed before the setup
/// failure is reported.
#[tokio::test]
async fn failed_authentication_closes_the_session() {
    let factory = Arc::new(RecordingFactory::new());
    let auth = Arc::new(BearerTokenAuth::new("token"));
    let procedure = Procedure::interactive(WithAuth(ScriptedProcedure::passing(2), auth));

    let summary = executor(&factory).run(&procedure, TARGET, &NoDelay, None).await;
    assert_eq!(summary.stop_reason, StopReason::SetupFailed);
    assert!(summary.setup_error.is_some());
    assert!(summary.step_results.is_empty());
    assert_eq!(factory.interactive_built(), 1);
    assert_eq!(factory.closed(), 1);
    assert!(factory.navigations.lock().is_empty());
}
