//! Test procedures
//!
//! A procedure is one test definition: a finite payload stream plus the
//! step/verify pair for exactly one transport. The pair is chosen when the
//! [`Procedure`] value is built, so an executor can never mix an interactive
//! step with a direct verification.

use crate::auth::Authentication;
use crate::context::ExecutionContext;
use crate::coordinators::{CsrfConfig, DirectClient, RateLimitConfig};
use crate::error::StepError;
use crate::transport::{DirectResponse, InteractiveSession};
use crate::types::{ExecutionMode, ExpectedPolicy, Payload};
use std::sync::Arc;

/// Metadata shared by both procedure kinds
pub trait TestProcedure: Send + Sync {
    /// Stable identifier used in summaries and logs
    fn id(&self) -> &str;

    /// How step outcomes are judged
    fn expected_policy(&self) -> ExpectedPolicy {
        ExpectedPolicy::WholeRun
    }

    /// Whole-run expectation; also the fallback for payloads without one
    fn expected(&self) -> bool {
        true
    }

    /// Finite payload stream; called once per run
    fn payloads(&self) -> Vec<Payload>;

    /// Authentication applied during setup
    fn authentication(&self) -> Option<Arc<dyn Authentication>> {
        None
    }

    /// CSRF handling for direct requests
    fn csrf(&self) -> Option<CsrfConfig> {
        None
    }

    /// Throttling handling for direct requests
    fn rate_limit(&self) -> Option<RateLimitConfig> {
        Some(RateLimitConfig::default())
    }
}

/// Procedure driven through a browser-like session
#[async_trait::async_trait]
pub trait InteractiveProcedure: TestProcedure {
    /// Drive one payload through the session
    async fn execute_step(
        &self,
        session: &mut dyn InteractiveSession,
        payload: &Payload,
        context: &mut ExecutionContext,
    ) -> Result<(), StepError>;

    /// Inspect the session after the step
    async fn verify_result(
        &self,
        session: &mut dyn InteractiveSession,
        context: &ExecutionContext,
    ) -> Result<bool, StepError>;
}

/// Procedure driven through an HTTP-like session
#[async_trait::async_trait]
pub trait DirectProcedure: TestProcedure {
    /// Issue the step's request(s) and return the response to judge
    async fn execute_step_direct(
        &self,
        client: &mut DirectClient<'_>,
        payload: &Payload,
    ) -> Result<DirectResponse, StepError>;

    /// Judge the response
    async fn verify_result_direct(
        &self,
        response: &DirectResponse,
        context: &ExecutionContext,
    ) -> Result<bool, StepError>;
}

/// Procedure tagged with its transport mode
#[derive(Clone)]
pub enum Procedure {
    /// Interactive step/verify pair
    Interactive(Arc<dyn InteractiveProcedure>),
    /// Direct step/verify pair
    Direct(Arc<dyn DirectProcedure>),
}

impl Procedure {
    /// Wrap an interactive procedure
    #[inline]
    #[must_use]
    pub fn interactive(procedure: impl InteractiveProcedure + 'static) -> Self {
        Self::Interactive(Arc::new(procedure))
    }

    /// Wrap a direct procedure
    #[inline]
    #[must_use]
    pub fn direct(procedure: impl DirectProcedure + 'static) -> Self {
        Self::Direct(Arc::new(procedure))
    }

    /// Declared transport mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Interactive(_) => ExecutionMode::Interactive,
            Self::Direct(_) => ExecutionMode::Direct,
        }
    }

    /// Procedure identifier
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Interactive(p) => p.id(),
            Self::Direct(p) => p.id(),
        }
    }

    /// Expected-outcome policy
    #[must_use]
    pub fn expected_policy(&self) -> ExpectedPolicy {
        match self {
            Self::Interactive(p) => p.expected_policy(),
            Self::Direct(p) => p.expected_policy(),
        }
    }

    /// Whole-run expectation
    #[must_use]
    pub fn expected(&self) -> bool {
        match self {
            Self::Interactive(p) => p.expected(),
            Self::Direct(p) => p.expected(),
        }
    }

    /// Fresh payload stream
    #[must_use]
    pub fn payloads(&self) -> Vec<Payload> {
        match self {
            Self::Interactive(p) => p.payloads(),
            Self::Direct(p) => p.payloads(),
        }
    }

    /// Authentication collaborator
    #[must_use]
    pub fn authentication(&self) -> Option<Arc<dyn Authentication>> {
        match self {
            Self::Interactive(p) => p.authentication(),
            Self::Direct(p) => p.authentication(),
        }
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("id", &self.id())
            .field("mode", &self.mode())
            .field("expected_policy", &self.expected_policy())
            .field("expected", &self.expected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl TestProcedure for Probe {
        fn id(&self) -> &str {
            "probe"
        }

        fn expected(&self) -> bool {
            false
        }

        fn payloads(&self) -> Vec<Payload> {
            vec!["a".into(), "b".into()]
        }
    }

    #[async_trait::async_trait]
    impl DirectProcedure for Probe {
        async fn execute_step_direct(
            &self,
            client: &mut DirectClient<'_>,
            payload: &Payload,
        ) -> Result<DirectResponse, StepError> {
            let url = format!("/probe?q={}", payload.as_str().unwrap_or_default());
            client.send(crate::transport::DirectRequest::get(url)).await
        }

        async fn verify_result_direct(
            &self,
            response: &DirectResponse,
            _context: &ExecutionContext,
        ) -> Result<bool, StepError> {
            Ok(response.is_success())
        }
    }

    #[test]
    fn tagged_mode_and_delegation() {
        let procedure = Procedure::direct(Probe);
        assert_eq!(procedure.mode(), ExecutionMode::Direct);
        assert_eq!(procedure.id(), "probe");
        assert!(!procedure.expected());
        assert_eq!(procedure.expected_policy(), ExpectedPolicy::WholeRun);
        assert_eq!(procedure.payloads().len(), 2);
        assert!(procedure.authentication().is_none());
        assert!(format!("{procedure:?}").contains("Direct"));
    }
}
