//! Testing utilities for the Gauntlet workspace
//!
//! Shared transport doubles, scripted procedures and probes.

#![allow(missing_docs)]

use dashmap::DashMap;
use gauntlet_core::{
    DirectClient, DirectProcedure, DirectRequest, DirectResponse, DirectSession,
    ExecutionContext, InteractiveProcedure, InteractiveSession, Payload, StepError,
    TestProcedure, TransportError, TransportFactory,
};
use gauntlet_core::{CsrfConfig, ExpectedPolicy, RateLimitConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Request seen by a scripted session
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: DirectRequest,
    pub at: Instant,
    pub replication: Option<usize>,
}

/// Shared log of direct requests
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<RecordedRequest>>>);

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: RecordedRequest) {
        self.0.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<RecordedRequest> {
        self.0.lock().clone()
    }
}

/// Direct session that replays scripted responses, then a fallback
#[derive(Debug)]
pub struct ScriptedDirectSession {
    script: VecDeque<DirectResponse>,
    fallback: DirectResponse,
    log: RequestLog,
    replication: Option<usize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedDirectSession {
    pub fn new(script: impl IntoIterator<Item = DirectResponse>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: DirectResponse::new(200, ""),
            log: RequestLog::new(),
            replication: None,
            closes: Arc::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: DirectResponse) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_log(mut self, log: RequestLog) -> Self {
        self.log = log;
        self
    }

    /// Count `close` calls into a shared counter
    pub fn with_close_counter(mut self, closes: Arc<AtomicUsize>) -> Self {
        self.closes = closes;
        self
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DirectSession for ScriptedDirectSession {
    async fn send(&mut self, request: &DirectRequest) -> Result<DirectResponse, TransportError> {
        self.log.push(RecordedRequest {
            request: request.clone(),
            at: Instant::now(),
            replication: self.replication,
        });
        let mut response = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if response.url.is_empty() {
            response.url.clone_from(&request.url);
        }
        Ok(response)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Interactive session that records navigations and cookies
#[derive(Debug, Default)]
pub struct MockInteractiveSession {
    url: Option<String>,
    page: String,
    pub navigations: Arc<Mutex<Vec<String>>>,
    pub cookies: Arc<Mutex<Vec<(String, String, Option<String>)>>>,
    version: Option<String>,
    closed: bool,
    closes: Arc<AtomicUsize>,
}

impl MockInteractiveSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[async_trait::async_trait]
impl InteractiveSession for MockInteractiveSession {
    async fn navigate(&mut self, url: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.navigations.lock().push(url.to_string());
        self.url = Some(url.to_string());
        self.page = format!("<html><body>{url}</body></html>");
        Ok(())
    }

    fn current_url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        domain: Option<&str>,
    ) -> Result<(), TransportError> {
        self.cookies
            .lock()
            .push((name.to_string(), value.to_string(), domain.map(str::to_string)));
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.page.clone())
    }

    fn response_header(&self, name: &str) -> Option<String> {
        if name.eq_ignore_ascii_case(gauntlet_core::DEFAULT_VERSION_HEADER) {
            self.version.clone()
        } else {
            None
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that counts what it builds
#[derive(Debug, Default)]
pub struct RecordingFactory {
    script: Vec<DirectResponse>,
    fallback: Option<DirectResponse>,
    fail_construction: bool,
    interactive_built: AtomicUsize,
    direct_built: AtomicUsize,
    by_replication: DashMap<usize, usize>,
    closed: Arc<AtomicUsize>,
    pub requests: RequestLog,
    pub navigations: Arc<Mutex<Vec<String>>>,
    pub cookies: Arc<Mutex<Vec<(String, String, Option<String>)>>>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every direct session replays this script
    pub fn with_script(mut self, script: impl IntoIterator<Item = DirectResponse>) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    pub fn with_fallback(mut self, fallback: DirectResponse) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_construction = true;
        self
    }

    pub fn interactive_built(&self) -> usize {
        self.interactive_built.load(Ordering::SeqCst)
    }

    pub fn direct_built(&self) -> usize {
        self.direct_built.load(Ordering::SeqCst)
    }

    /// Sessions of either mode whose `close` has run
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions built for `replication`
    pub fn built_for(&self, replication: usize) -> usize {
        self.by_replication.get(&replication).map_or(0, |n| *n)
    }

    fn note(&self, context: &ExecutionContext) {
        if let Some(replication) = context.replication() {
            *self.by_replication.entry(replication).or_insert(0) += 1;
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for RecordingFactory {
    async fn interactive(
        &self,
        context: &ExecutionContext,
    ) -> Result<Box<dyn InteractiveSession>, TransportError> {
        self.interactive_built.fetch_add(1, Ordering::SeqCst);
        self.note(context);
        if self.fail_construction {
            return Err(TransportError::Construction("browser unavailable".into()));
        }
        Ok(Box::new(MockInteractiveSession {
            navigations: Arc::clone(&self.navigations),
            cookies: Arc::clone(&self.cookies),
            version: Some("web-1".into()),
            closes: Arc::clone(&self.closed),
            ..MockInteractiveSession::default()
        }))
    }

    async fn direct(&self, context: &ExecutionContext) -> Result<Box<dyn DirectSession>, TransportError> {
        self.direct_built.fetch_add(1, Ordering::SeqCst);
        self.note(context);
        if self.fail_construction {
            return Err(TransportError::Construction("client unavailable".into()));
        }
        let mut session = ScriptedDirectSession::new(self.script.clone())
            .with_log(self.requests.clone())
            .with_close_counter(Arc::clone(&self.closed));
        if let Some(fallback) = &self.fallback {
            session = session.with_fallback(fallback.clone());
        }
        session.replication = context.replication();
        Ok(Box::new(session))
    }
}

/// Tracks how many workers are inside a section at once
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            current: Arc::clone(&self.current),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ProbeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

type Outcome = Arc<dyn Fn(Option<usize>, usize) -> bool + Send + Sync>;

/// Procedure whose step outcomes come from `outcome(replication, step)`
///
/// Works in both modes. Direct steps POST to `/step`; interactive steps
/// navigate to `<target>/step/<step>`.
#[derive(Clone)]
pub struct ScriptedProcedure {
    id: String,
    steps: usize,
    expected: bool,
    policy: ExpectedPolicy,
    outcome: Outcome,
    panic_on: Option<usize>,
    latency: Duration,
    probe: Option<ConcurrencyProbe>,
    csrf: Option<CsrfConfig>,
    rate_limit: Option<RateLimitConfig>,
}

impl ScriptedProcedure {
    pub fn new(steps: usize, outcome: impl Fn(Option<usize>, usize) -> bool + Send + Sync + 'static) -> Self {
        Self {
            id: "scripted".into(),
            steps,
            expected: true,
            policy: ExpectedPolicy::WholeRun,
            outcome: Arc::new(outcome),
            panic_on: None,
            latency: Duration::ZERO,
            probe: None,
            csrf: None,
            rate_limit: Some(RateLimitConfig::default()),
        }
    }

    /// Every step succeeds
    pub fn passing(steps: usize) -> Self {
        Self::new(steps, |_, _| true)
    }

    /// Every step fails
    pub fn failing(steps: usize) -> Self {
        Self::new(steps, |_, _| false)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_expected(mut self, expected: bool) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_policy(mut self, policy: ExpectedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Panic inside the first step of `replication`
    pub fn panicking_on(mut self, replication: usize) -> Self {
        self.panic_on = Some(replication);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_csrf(mut self, csrf: CsrfConfig) -> Self {
        self.csrf = Some(csrf);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitConfig>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    async fn step(&self, replication: Option<usize>, step: usize) {
        if step == 1 && self.panic_on.is_some() && self.panic_on == replication {
            panic!("scripted panic in replication {}", replication.unwrap_or_default());
        }
        let _guard = self.probe.as_ref().map(ConcurrencyProbe::enter);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn outcome_for(&self, context: &ExecutionContext) -> bool {
        let step = context
            .value("step")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_default();
        (self.outcome)(context.replication(), usize::try_from(step).unwrap_or_default())
    }
}

impl std::fmt::Debug for ScriptedProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProcedure")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl TestProcedure for ScriptedProcedure {
    fn id(&self) -> &str {
        &self.id
    }

    fn expected_policy(&self) -> ExpectedPolicy {
        self.policy
    }

    fn expected(&self) -> bool {
        self.expected
    }

    fn payloads(&self) -> Vec<Payload> {
        (1..=self.steps).map(|i| Payload::new(i)).collect()
    }

    fn csrf(&self) -> Option<CsrfConfig> {
        self.csrf.clone()
    }

    fn rate_limit(&self) -> Option<RateLimitConfig> {
        self.rate_limit.clone()
    }
}

fn step_number(payload: &Payload) -> usize {
    payload
        .value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl DirectProcedure for ScriptedProcedure {
    async fn execute_step_direct(
        &self,
        client: &mut DirectClient<'_>,
        payload: &Payload,
    ) -> Result<DirectResponse, StepError> {
        let step = step_number(payload);
        client.context_mut().set_value("step", step);
        self.step(client.context().replication(), step).await;
        client
            .send(DirectRequest::post("/step").json(serde_json::json!({ "step": step })))
            .await
    }

    async fn verify_result_direct(
        &self,
        _response: &DirectResponse,
        context: &ExecutionContext,
    ) -> Result<bool, StepError> {
        Ok(self.outcome_for(context))
    }
}

#[async_trait::async_trait]
impl InteractiveProcedure for ScriptedProcedure {
    async fn execute_step(
        &self,
        session: &mut dyn InteractiveSession,
        payload: &Payload,
        context: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let step = step_number(payload);
        context.set_value("step", step);
        self.step(context.replication(), step).await;
        let url = format!("{}/step/{step}", context.target().trim_end_matches('/'));
        session.navigate(&url).await?;
        Ok(())
    }

    async fn verify_result(
        &self,
        session: &mut dyn InteractiveSession,
        context: &ExecutionContext,
    ) -> Result<bool, StepError> {
        session.page_source().await?;
        Ok(self.outcome_for(context))
    }
}

/// Response with a CSRF cookie attached
pub fn with_csrf_cookie(status: u16, token: &str) -> DirectResponse {
    DirectResponse::new(status, "").with_cookie("csrftoken", token)
}
