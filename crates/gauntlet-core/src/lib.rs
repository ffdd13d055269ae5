//! Gauntlet Core - adverse-condition test execution
//!
//! Runs a test procedure against a target application, step by step, under
//! a pluggable behavior, and decides PASS/FAIL against a declared
//! expectation:
//! - Execution Context carrying per-run state and the transport mode
//! - Behavior Controller deciding pacing, continuation and error handling
//! - CSRF and rate-limit Retry Coordinators wrapping direct requests
//! - Single-Run Executor dispatching INTERACTIVE or DIRECT steps
//! - Orchestration Layer replicating runs (sequential, parallel,
//!   distributed, batch)
//! - Verdict Engine comparing outcomes with expectations
//!
//! # Example
//!
//! ```rust,ignore
//! use gauntlet_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = SimulationConfig::default();
//! let executor = Executor::new(Arc::new(SimulatedTransportFactory::new(sim.clone())));
//! let procedure = SimulatedProcedure::new(sim).into_procedure();
//!
//! let job = OrchestrationJob::new(procedure, "https://app.test", 10)
//!     .with_strategy(Strategy::Parallel)
//!     .with_concurrency(3);
//! let result = Orchestrator::new(executor).orchestrate(job).await?;
//!
//! println!("{}", result.generate_text());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod behavior;
pub mod config;
pub mod context;
pub mod coordinators;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod orchestration;
pub mod procedure;
pub mod simulator;
pub mod transport;
pub mod types;
pub mod verdict;

// Re-exports for convenience
pub use auth::{Authentication, BearerTokenAuth, StaticAuth};
pub use behavior::{
    Behavior, DefaultBehavior, HumanBehavior, MachineBehavior, NoDelay, StealthBehavior,
};
pub use config::{BatchSection, BehaviorSection, ExecutorSection, JobConfig};
pub use context::ExecutionContext;
pub use coordinators::{
    CsrfConfig, CsrfCoordinator, DirectClient, RateLimitConfig, RateLimitCoordinator,
    TokenSource, TokenTarget,
};
pub use error::{
    AuthError, ConfigError, OrchestrationError, SetupError, StepError, TransportError,
};
pub use executor::{Executor, ExecutorConfig, DEFAULT_VERSION_HEADER};
pub use lifecycle::{RunLifecycle, RunPhase};
pub use orchestration::{
    assign, Assignment, BatchConfig, BatchReport, Breakdown, CredentialSet, DimensionStats,
    NetworkProxy, OrchestrationJob, OrchestrationResult, Orchestrator, ResultCollector,
    RotationPolicy, StopHandle, Strategy,
};
pub use procedure::{DirectProcedure, InteractiveProcedure, Procedure, TestProcedure};
pub use simulator::{SimulatedProcedure, SimulatedTransportFactory, SimulationConfig};
pub use transport::{
    DirectRequest, DirectResponse, DirectSession, Headers, InteractiveSession, Method,
    RequestBody, ResponseMeta, TransportFactory,
};
pub use types::{
    ExecutionMode, ExpectedPolicy, Payload, RunId, RunSummary, StepResult, StopReason,
    TransportSnapshot,
};
pub use verdict::{evaluate, Verdict};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for writing procedures and running jobs
    pub use crate::{
        Behavior, DirectClient, DirectProcedure, DirectRequest, DirectResponse,
        ExecutionContext, ExecutionMode, Executor, InteractiveProcedure, InteractiveSession,
        OrchestrationJob, Orchestrator, Payload, Procedure, RunSummary, SimulatedProcedure,
        SimulatedTransportFactory, SimulationConfig, StepError, Strategy, TestProcedure,
        Verdict,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
