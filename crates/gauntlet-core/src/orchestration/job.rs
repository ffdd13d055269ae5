//! Orchestration job description

use super::assignment::{CredentialSet, NetworkProxy, RotationPolicy};
use crate::behavior::{Behavior, DefaultBehavior};
use crate::error::OrchestrationError;
use crate::procedure::Procedure;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Replication strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One after another on the calling task
    #[default]
    Sequential,
    /// Bounded worker pool
    Parallel,
    /// Worker pool with proxy/credential assignment
    Distributed,
    /// Fixed-size batches with whole-batch retry
    Batch,
}

/// Batch parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Replications per batch
    pub batch_size: usize,
    /// Retries allowed per batch after the first attempt
    pub max_batch_retries: usize,
    /// Failure rate above which a batch is retried
    pub failure_threshold: f64,
    /// Batches running at the same time
    pub max_concurrent_batches: usize,
    /// Pause between batch waves
    pub batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_batch_retries: 2,
            failure_threshold: 0.5,
            max_concurrent_batches: 1,
            batch_delay: Duration::ZERO,
        }
    }
}

impl BatchConfig {
    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// With retry count
    #[inline]
    #[must_use]
    pub fn with_max_batch_retries(mut self, retries: usize) -> Self {
        self.max_batch_retries = retries;
        self
    }

    /// With failure threshold in `[0, 1]`
    #[inline]
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// With concurrent batch limit
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max;
        self
    }

    /// With pause between batch waves
    #[inline]
    #[must_use]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

/// Immutable job configuration
#[derive(Clone)]
pub struct OrchestrationJob {
    /// Procedure replicated by every run
    pub procedure: Procedure,
    /// Base target
    pub target: String,
    /// Number of replications
    pub replication_count: usize,
    /// Strategy
    pub strategy: Strategy,
    /// Worker pool size (also per-batch pool size)
    pub concurrency_limit: usize,
    /// Stagger between initial worker starts
    pub ramp_up: Duration,
    /// Proxy pool (DISTRIBUTED)
    pub proxies: Vec<NetworkProxy>,
    /// Credential pool (DISTRIBUTED)
    pub credentials: Vec<CredentialSet>,
    /// Pairing policy (DISTRIBUTED)
    pub rotation: RotationPolicy,
    /// Batch parameters (BATCH)
    pub batch: BatchConfig,
    /// Behavior shared by all replications
    pub behavior: Arc<dyn Behavior>,
}

impl OrchestrationJob {
    /// Create a sequential job with default behavior
    #[must_use]
    pub fn new(procedure: Procedure, target: impl Into<String>, replication_count: usize) -> Self {
        Self {
            procedure,
            target: target.into(),
            replication_count,
            strategy: Strategy::Sequential,
            concurrency_limit: 1,
            ramp_up: Duration::ZERO,
            proxies: Vec::new(),
            credentials: Vec::new(),
            rotation: RotationPolicy::RoundRobin,
            batch: BatchConfig::default(),
            behavior: Arc::new(DefaultBehavior::new()),
        }
    }

    /// With strategy
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// With worker pool size
    #[inline]
    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// With ramp-up stagger
    #[inline]
    #[must_use]
    pub fn with_ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up = ramp_up;
        self
    }

    /// With proxy pool
    #[inline]
    #[must_use]
    pub fn with_proxies(mut self, proxies: Vec<NetworkProxy>) -> Self {
        self.proxies = proxies;
        self
    }

    /// With credential pool
    #[inline]
    #[must_use]
    pub fn with_credentials(mut self, credentials: Vec<CredentialSet>) -> Self {
        self.credentials = credentials;
        self
    }

    /// With rotation policy
    #[inline]
    #[must_use]
    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    /// With batch parameters
    #[inline]
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// With behavior
    #[inline]
    #[must_use]
    pub fn with_behavior(mut self, behavior: Arc<dyn Behavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.replication_count == 0 {
            return Err(OrchestrationError::NoReplications);
        }
        if self.concurrency_limit == 0 {
            return Err(OrchestrationError::ZeroConcurrency);
        }
        match self.strategy {
            Strategy::Distributed if self.proxies.is_empty() && self.credentials.is_empty() => {
                Err(OrchestrationError::EmptyPools)
            }
            Strategy::Batch => {
                if self.batch.batch_size == 0 {
                    return Err(OrchestrationError::ZeroBatchSize);
                }
                if self.batch.max_concurrent_batches == 0 {
                    return Err(OrchestrationError::ZeroConcurrency);
                }
                if !(0.0..=1.0).contains(&self.batch.failure_threshold) {
                    return Err(OrchestrationError::InvalidThreshold(
                        self.batch.failure_threshold.to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for OrchestrationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationJob")
            .field("procedure", &self.procedure)
            .field("target", &self.target)
            .field("replication_count", &self.replication_count)
            .field("strategy", &self.strategy)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("ramp_up", &self.ramp_up)
            .field("proxies", &self.proxies.len())
            .field("credentials", &self.credentials.len())
            .field("rotation", &self.rotation)
            .field("batch", &self.batch)
            .field("behavior", &self.behavior.name())
            .finish()
    }
}
