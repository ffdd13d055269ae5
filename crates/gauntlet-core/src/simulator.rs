//! Simulated transports and procedure
//!
//! Lets a job run end to end without a browser or HTTP stack. Every session
//! draws from its own RNG seeded by `(seed, replication)`, so a job with a
//! fixed seed produces the same per-replication outcomes regardless of
//! scheduling.

use crate::context::ExecutionContext;
use crate::coordinators::{CsrfConfig, DirectClient, RateLimitConfig};
use crate::error::{StepError, TransportError};
use crate::executor::DEFAULT_VERSION_HEADER;
use crate::procedure::{DirectProcedure, InteractiveProcedure, Procedure, TestProcedure};
use crate::transport::{
    DirectRequest, DirectResponse, DirectSession, InteractiveSession, TransportFactory,
};
use crate::types::{ExecutionMode, ExpectedPolicy, Payload};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CSRF_COOKIE: &str = "csrftoken";
const CSRF_HEADER: &str = "X-CSRFToken";

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Transport the simulated procedure uses
    pub mode: ExecutionMode,
    /// Payloads per run
    pub steps: usize,
    /// Chance that a step succeeds
    pub success_probability: f64,
    /// Whole-run expectation
    pub expected: bool,
    /// Expected-outcome policy
    pub expected_policy: ExpectedPolicy,
    /// Chance that a direct request is throttled
    pub throttle_probability: f64,
    /// Chance that a state-changing request is rejected for its CSRF token
    pub csrf_rejection_probability: f64,
    /// Chance that session construction fails
    pub construction_failure_probability: f64,
    /// Latency added to every call
    pub latency_ms: u64,
    /// Version reported by the simulated target
    pub target_version: Option<String>,
    /// RNG seed
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Direct,
            steps: 3,
            success_probability: 0.0,
            expected: false,
            expected_policy: ExpectedPolicy::WholeRun,
            throttle_probability: 0.0,
            csrf_rejection_probability: 0.0,
            construction_failure_probability: 0.0,
            latency_ms: 0,
            target_version: Some("sim-1.0".to_string()),
            seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Probability fields that must lie in `[0, 1]`
    #[must_use]
    pub fn probabilities(&self) -> [(&'static str, f64); 4] {
        [
            ("simulation.success_probability", self.success_probability),
            ("simulation.throttle_probability", self.throttle_probability),
            ("simulation.csrf_rejection_probability", self.csrf_rejection_probability),
            (
                "simulation.construction_failure_probability",
                self.construction_failure_probability,
            ),
        ]
    }

    fn rng_for(&self, context: &ExecutionContext) -> StdRng {
        let replication = context.replication().unwrap_or(0) as u64;
        StdRng::seed_from_u64(self.seed ^ replication.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    async fn latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
    }
}

fn chance(rng: &mut StdRng, probability: f64) -> bool {
    if probability.is_nan() {
        return false;
    }
    rng.random_bool(probability.clamp(0.0, 1.0))
}

/// Factory producing simulated sessions
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransportFactory {
    config: SimulationConfig,
}

impl SimulatedTransportFactory {
    /// Create factory
    #[inline]
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl TransportFactory for SimulatedTransportFactory {
    async fn interactive(
        &self,
        context: &ExecutionContext,
    ) -> Result<Box<dyn InteractiveSession>, TransportError> {
        let mut rng = self.config.rng_for(context);
        if chance(&mut rng, self.config.construction_failure_probability) {
            return Err(TransportError::Construction("simulated driver unavailable".to_string()));
        }
        Ok(Box::new(SimulatedInteractiveSession {
            config: self.config.clone(),
            rng,
            url: None,
            page: String::new(),
            closed: false,
        }))
    }

    async fn direct(&self, context: &ExecutionContext) -> Result<Box<dyn DirectSession>, TransportError> {
        let mut rng = self.config.rng_for(context);
        if chance(&mut rng, self.config.construction_failure_probability) {
            return Err(TransportError::Construction("simulated client unavailable".to_string()));
        }
        Ok(Box::new(SimulatedDirectSession {
            config: self.config.clone(),
            rng,
            token_generation: 1,
        }))
    }
}

/// Browser-like session over the simulated target
#[derive(Debug)]
pub struct SimulatedInteractiveSession {
    config: SimulationConfig,
    rng: StdRng,
    url: Option<String>,
    page: String,
    closed: bool,
}

#[async_trait::async_trait]
impl InteractiveSession for SimulatedInteractiveSession {
    async fn navigate(&mut self, url: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.config.latency().await;
        let welcome = chance(&mut self.rng, self.config.success_probability);
        self.page = if welcome {
            "<html><body>welcome</body></html>".to_string()
        } else {
            "<html><body>access denied</body></html>".to_string()
        };
        self.url = Some(url.to_string());
        Ok(())
    }

    fn current_url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn set_cookie(
        &mut self,
        _name: &str,
        _value: &str,
        _domain: Option<&str>,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.page.clone())
    }

    fn response_header(&self, name: &str) -> Option<String> {
        if name.eq_ignore_ascii_case(DEFAULT_VERSION_HEADER) {
            self.config.target_version.clone()
        } else {
            None
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

/// HTTP-like session over the simulated target
#[derive(Debug)]
pub struct SimulatedDirectSession {
    config: SimulationConfig,
    rng: StdRng,
    token_generation: u32,
}

impl SimulatedDirectSession {
    fn token(&self) -> String {
        format!("sim-token-{}", self.token_generation)
    }

    fn respond(&self, status: u16, url: &str) -> DirectResponse {
        let mut response = DirectResponse::new(status, url).with_cookie(CSRF_COOKIE, self.token());
        if let Some(version) = &self.config.target_version {
            response = response.with_header(DEFAULT_VERSION_HEADER, version.clone());
        }
        response
    }
}

#[async_trait::async_trait]
impl DirectSession for SimulatedDirectSession {
    async fn send(&mut self, request: &DirectRequest) -> Result<DirectResponse, TransportError> {
        self.config.latency().await;

        if chance(&mut self.rng, self.config.throttle_probability) {
            return Ok(self.respond(429, &request.url).with_header("Retry-After", "1"));
        }

        if request.method.is_state_changing() {
            let stale = request
                .headers
                .get(CSRF_HEADER)
                .is_some_and(|token| token != self.token());
            if stale || chance(&mut self.rng, self.config.csrf_rejection_probability) {
                self.token_generation += 1;
                return Ok(self.respond(403, &request.url));
            }
        }

        let success = chance(&mut self.rng, self.config.success_probability);
        let body = serde_json::json!({ "success": success }).to_string();
        Ok(self.respond(200, &request.url).with_body(body))
    }
}

/// Procedure that probes the simulated target
#[derive(Debug, Clone, Default)]
pub struct SimulatedProcedure {
    config: SimulationConfig,
}

impl SimulatedProcedure {
    /// Create procedure
    #[inline]
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Tag with the configured mode
    #[must_use]
    pub fn into_procedure(self) -> Procedure {
        match self.config.mode {
            ExecutionMode::Interactive => Procedure::interactive(self),
            ExecutionMode::Direct => Procedure::direct(self),
        }
    }
}

impl TestProcedure for SimulatedProcedure {
    fn id(&self) -> &str {
        "simulated-probe"
    }

    fn expected_policy(&self) -> ExpectedPolicy {
        self.config.expected_policy
    }

    fn expected(&self) -> bool {
        self.config.expected
    }

    fn payloads(&self) -> Vec<Payload> {
        (1..=self.config.steps)
            .map(|i| Payload::new(format!("probe-{i}")))
            .collect()
    }

    fn csrf(&self) -> Option<CsrfConfig> {
        Some(CsrfConfig::django())
    }

    fn rate_limit(&self) -> Option<RateLimitConfig> {
        Some(RateLimitConfig::default().with_max_wait(Duration::from_secs(5)))
    }
}

#[async_trait::async_trait]
impl InteractiveProcedure for SimulatedProcedure {
    async fn execute_step(
        &self,
        session: &mut dyn InteractiveSession,
        payload: &Payload,
        context: &mut ExecutionContext,
    ) -> Result<(), StepError> {
        let probe = payload.as_str().unwrap_or_default();
        let url = format!("{}/simulate?payload={probe}", context.target().trim_end_matches('/'));
        session.navigate(&url).await?;
        Ok(())
    }

    async fn verify_result(
        &self,
        session: &mut dyn InteractiveSession,
        _context: &ExecutionContext,
    ) -> Result<bool, StepError> {
        Ok(session.page_source().await?.contains("welcome"))
    }
}

#[async_trait::async_trait]
impl DirectProcedure for SimulatedProcedure {
    async fn execute_step_direct(
        &self,
        client: &mut DirectClient<'_>,
        payload: &Payload,
    ) -> Result<DirectResponse, StepError> {
        let request =
            DirectRequest::post("/simulate").json(serde_json::json!({ "payload": payload.value }));
        client.send(request).await
    }

    async fn verify_result_direct(
        &self,
        response: &DirectResponse,
        _context: &ExecutionContext,
    ) -> Result<bool, StepError> {
        if !response.is_success() {
            return Ok(false);
        }
        let body = response
            .json()
            .map_err(|e| StepError::Verification(format!("unreadable body: {e}")))?;
        Ok(body["success"].as_bool().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::NoDelay;
    use crate::executor::Executor;
    use crate::verdict::Verdict;
    use std::sync::Arc;

    fn executor(config: &SimulationConfig) -> Executor {
        Executor::new(Arc::new(SimulatedTransportFactory::new(config.clone())))
    }

    #[tokio::test]
    async fn direct_probe_never_succeeds_at_zero_probability() {
        let config = SimulationConfig::default();
        let procedure = SimulatedProcedure::new(config.clone()).into_procedure();
        let summary = executor(&config)
            .run(&procedure, "https://sim.test", &NoDelay, None)
            .await;
        assert_eq!(summary.step_results.len(), 3);
        assert_eq!(summary.verdict, Verdict::Pass);
        assert_eq!(summary.target_versions(), vec!["sim-1.0".to_string()]);
    }

    #[tokio::test]
    async fn interactive_probe_succeeds_at_full_probability() {
        let config = SimulationConfig {
            mode: ExecutionMode::Interactive,
            success_probability: 1.0,
            expected: true,
            ..SimulationConfig::default()
        };
        let procedure = SimulatedProcedure::new(config.clone()).into_procedure();
        let summary = executor(&config)
            .run(&procedure, "https://sim.test", &NoDelay, None)
            .await;
        assert!(summary.step_results.iter().all(|r| r.actual));
        assert_eq!(
            summary.step_results[0].snapshot.url.as_deref(),
            Some("https://sim.test/simulate?payload=probe-1")
        );
        assert_eq!(summary.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn csrf_rejections_are_recovered() {
        let config = SimulationConfig {
            csrf_rejection_probability: 0.3,
            success_probability: 1.0,
            expected: true,
            steps: 10,
            ..SimulationConfig::default()
        };
        let procedure = SimulatedProcedure::new(config.clone()).into_procedure();
        let summary = executor(&config)
            .run(&procedure, "https://sim.test", &NoDelay, None)
            .await;
        assert_eq!(summary.step_results.len(), 10);
        assert!(summary.successful_steps() > 0);
        assert_eq!(summary.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn construction_failure_aborts_run() {
        let config = SimulationConfig {
            construction_failure_probability: 1.0,
            ..SimulationConfig::default()
        };
        let procedure = SimulatedProcedure::new(config.clone()).into_procedure();
        let summary = executor(&config)
            .run(&procedure, "https://sim.test", &NoDelay, None)
            .await;
        assert!(summary.aborted);
        assert!(summary.setup_error.is_some());
        assert_eq!(summary.verdict, Verdict::Fail);
    }
}
