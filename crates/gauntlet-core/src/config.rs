//! Job files
//!
//! A [`JobConfig`] describes an orchestration job on disk, as TOML or JSON.
//! Durations are milliseconds. Everything except `target` has a default.
//!
//! ```toml
//! target = "https://app.test"
//! replications = 20
//! strategy = "batch"
//! concurrency = 4
//!
//! [batch]
//! size = 5
//! max_retries = 1
//!
//! [behavior]
//! preset = "human"
//! seed = 7
//! ```

use crate::behavior::{
    Behavior, DefaultBehavior, HumanBehavior, MachineBehavior, NoDelay, StealthBehavior,
};
use crate::error::ConfigError;
use crate::executor::ExecutorConfig;
use crate::orchestration::{
    BatchConfig, CredentialSet, NetworkProxy, OrchestrationJob, RotationPolicy, Strategy,
};
use crate::procedure::Procedure;
use crate::simulator::SimulationConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Batch section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// Replications per batch
    pub size: usize,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Failure rate that triggers a retry
    pub failure_threshold: f64,
    /// Batches per wave
    pub max_concurrent: usize,
    /// Pause between waves
    pub delay_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        let defaults = BatchConfig::default();
        Self {
            size: defaults.batch_size,
            max_retries: defaults.max_batch_retries,
            failure_threshold: defaults.failure_threshold,
            max_concurrent: defaults.max_concurrent_batches,
            delay_ms: 0,
        }
    }
}

impl From<&BatchSection> for BatchConfig {
    fn from(section: &BatchSection) -> Self {
        BatchConfig::default()
            .with_batch_size(section.size)
            .with_max_batch_retries(section.max_retries)
            .with_failure_threshold(section.failure_threshold)
            .with_max_concurrent_batches(section.max_concurrent)
            .with_batch_delay(Duration::from_millis(section.delay_ms))
    }
}

/// Behavior preset with optional overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "preset", rename_all = "snake_case")]
pub enum BehaviorSection {
    /// No delays, never halts
    None,
    /// Fixed delay, fail-soft
    Default {
        /// Delay after each step
        #[serde(default)]
        delay_ms: Option<u64>,
        /// Halt after this many failures in a row
        #[serde(default)]
        max_consecutive_failures: Option<usize>,
    },
    /// Machine-speed with optional fail-fast
    Machine {
        /// Delay after each step
        #[serde(default)]
        delay_ms: Option<u64>,
        /// Abort on the first step error
        #[serde(default)]
        fail_fast: Option<bool>,
        /// Halt after this many failures in a row
        #[serde(default)]
        max_consecutive_failures: Option<usize>,
    },
    /// Base delay with bounded jitter
    Human {
        /// Base delay
        #[serde(default)]
        delay_ms: Option<u64>,
        /// Maximum jitter either way
        #[serde(default)]
        variance_ms: Option<u64>,
        /// Halt after this many failures in a row
        #[serde(default)]
        max_consecutive_failures: Option<usize>,
        /// RNG seed
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Uniform delay, occasional long pause, request cap
    Stealth {
        /// Lower delay bound
        #[serde(default)]
        min_delay_ms: Option<u64>,
        /// Upper delay bound
        #[serde(default)]
        max_delay_ms: Option<u64>,
        /// Long pause length
        #[serde(default)]
        long_pause_ms: Option<u64>,
        /// Chance of a long pause per step
        #[serde(default)]
        long_pause_probability: Option<f64>,
        /// Steps allowed per run
        #[serde(default)]
        max_requests_per_run: Option<usize>,
        /// Halt after this many failures in a row
        #[serde(default)]
        max_consecutive_failures: Option<usize>,
        /// RNG seed
        #[serde(default)]
        seed: Option<u64>,
    },
}

impl Default for BehaviorSection {
    fn default() -> Self {
        Self::Default {
            delay_ms: None,
            max_consecutive_failures: None,
        }
    }
}

impl BehaviorSection {
    /// Build the behavior
    #[must_use]
    pub fn build(&self) -> Arc<dyn Behavior> {
        match self {
            Self::None => Arc::new(NoDelay),
            Self::Default {
                delay_ms,
                max_consecutive_failures,
            } => {
                let mut behavior = DefaultBehavior::new();
                if let Some(ms) = delay_ms {
                    behavior = behavior.with_delay(Duration::from_millis(*ms));
                }
                if let Some(max) = max_consecutive_failures {
                    behavior = behavior.with_max_consecutive_failures(*max);
                }
                Arc::new(behavior)
            }
            Self::Machine {
                delay_ms,
                fail_fast,
                max_consecutive_failures,
            } => {
                let mut behavior = MachineBehavior::new();
                if let Some(ms) = delay_ms {
                    behavior = behavior.with_delay(Duration::from_millis(*ms));
                }
                if let Some(fail_fast) = fail_fast {
                    behavior = behavior.with_fail_fast(*fail_fast);
                }
                if let Some(max) = max_consecutive_failures {
                    behavior = behavior.with_max_consecutive_failures(*max);
                }
                Arc::new(behavior)
            }
            Self::Human {
                delay_ms,
                variance_ms,
                max_consecutive_failures,
                seed,
            } => {
                let mut behavior = HumanBehavior::new(*seed);
                if delay_ms.is_some() || variance_ms.is_some() {
                    behavior = behavior.with_delay(
                        Duration::from_millis(delay_ms.unwrap_or(2_000)),
                        Duration::from_millis(variance_ms.unwrap_or(1_000)),
                    );
                }
                if let Some(max) = max_consecutive_failures {
                    behavior = behavior.with_max_consecutive_failures(*max);
                }
                Arc::new(behavior)
            }
            Self::Stealth {
                min_delay_ms,
                max_delay_ms,
                long_pause_ms,
                long_pause_probability,
                max_requests_per_run,
                max_consecutive_failures,
                seed,
            } => {
                let mut behavior = StealthBehavior::new(*seed);
                if min_delay_ms.is_some() || max_delay_ms.is_some() {
                    behavior = behavior.with_delay_range(
                        Duration::from_millis(min_delay_ms.unwrap_or(5_000)),
                        Duration::from_millis(max_delay_ms.unwrap_or(15_000)),
                    );
                }
                if long_pause_ms.is_some() || long_pause_probability.is_some() {
                    behavior = behavior.with_long_pause(
                        Duration::from_millis(long_pause_ms.unwrap_or(30_000)),
                        long_pause_probability.unwrap_or(0.1),
                    );
                }
                if let Some(max) = max_requests_per_run {
                    behavior = behavior.with_max_requests_per_run(*max);
                }
                if let Some(max) = max_consecutive_failures {
                    behavior = behavior.with_max_consecutive_failures(*max);
                }
                Arc::new(behavior)
            }
        }
    }

    fn reseed(&mut self, new_seed: u64) {
        match self {
            Self::Human { seed, .. } | Self::Stealth { seed, .. } => *seed = Some(new_seed),
            Self::None | Self::Default { .. } | Self::Machine { .. } => {}
        }
    }
}

/// Executor section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Header carrying the target version
    pub version_header: Option<String>,
    /// Per-step timeout
    pub step_timeout_ms: Option<u64>,
}

/// Orchestration job as written in a job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Base target URL
    pub target: String,
    /// Number of replications
    #[serde(default = "default_replications")]
    pub replications: usize,
    /// Strategy
    #[serde(default)]
    pub strategy: Strategy,
    /// Worker pool size
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Stagger between initial worker starts
    #[serde(default)]
    pub ramp_up_ms: u64,
    /// Proxy/credential pairing
    #[serde(default)]
    pub rotation: RotationPolicy,
    /// Proxy pool
    #[serde(default)]
    pub proxies: Vec<NetworkProxy>,
    /// Credential pool
    #[serde(default)]
    pub credentials: Vec<CredentialSet>,
    /// Batch parameters
    #[serde(default)]
    pub batch: BatchSection,
    /// Behavior preset
    #[serde(default)]
    pub behavior: BehaviorSection,
    /// Executor settings
    #[serde(default)]
    pub executor: ExecutorSection,
    /// Simulator parameters
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_replications() -> usize {
    1
}

fn default_concurrency() -> usize {
    1
}

impl JobConfig {
    /// Load from a `.toml` or `.json` file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };
        tracing::debug!(path = %path.display(), strategy = ?config.strategy, "job file loaded");
        Ok(config)
    }

    /// Parse TOML
    ///
    /// # Errors
    /// Returns `ConfigError::Toml` on malformed input.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Parse JSON
    ///
    /// # Errors
    /// Returns `ConfigError::Json` on malformed input.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Override every seed in the file
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.simulation.seed = seed;
        self.behavior.reseed(seed);
        self
    }

    /// Check field ranges and the job the file describes
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::Field {
                field: "target",
                reason: "must not be empty".to_string(),
            });
        }
        for (field, value) in self.simulation.probabilities() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Field {
                    field,
                    reason: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if let BehaviorSection::Stealth {
            long_pause_probability: Some(p),
            ..
        } = &self.behavior
        {
            if !(0.0..=1.0).contains(p) {
                return Err(ConfigError::Field {
                    field: "behavior.long_pause_probability",
                    reason: format!("{p} is outside [0, 1]"),
                });
            }
        }
        self.job_shell().validate()?;
        Ok(())
    }

    /// Executor settings
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::new();
        if let Some(header) = &self.executor.version_header {
            config = config.with_version_header(header.clone());
        }
        if let Some(ms) = self.executor.step_timeout_ms {
            config = config.with_step_timeout(Duration::from_millis(ms));
        }
        config
    }

    /// Build the job around `procedure`
    #[must_use]
    pub fn into_job(self, procedure: Procedure) -> OrchestrationJob {
        OrchestrationJob::new(procedure, self.target, self.replications)
            .with_strategy(self.strategy)
            .with_concurrency(self.concurrency)
            .with_ramp_up(Duration::from_millis(self.ramp_up_ms))
            .with_proxies(self.proxies)
            .with_credentials(self.credentials)
            .with_rotation(self.rotation)
            .with_batch(BatchConfig::from(&self.batch))
            .with_behavior(self.behavior.build())
    }

    /// Job carrying only the structural settings, for validation
    fn job_shell(&self) -> OrchestrationJob {
        use crate::simulator::SimulatedProcedure;

        self.clone()
            .into_job(SimulatedProcedure::new(self.simulation.clone()).into_procedure())
    }
}
