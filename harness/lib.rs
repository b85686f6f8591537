//! BFT Lab Resilience Harness
//!
//! This crate drives the `bftlab_sim` consensus simulation through fault injection,
//! structured chaos experiments and Byzantine attack scenarios, then aggregates the
//! outcomes into resilience reports.
//!
//! ## Components
//!
//! - **cluster**: the shared simulator plus the live fault-condition overlay
//! - **faults**: timed, cancellable fault injections with auto-revert
//! - **monitor**: health sampling and abort-condition evaluation during experiments
//! - **experiment**: chaos experiment lifecycle, safety gating and test suites
//! - **scenario**: Byzantine fault-injection scenarios and coordinated attacks
//! - **report**: BFT and chaos reports over a time window
//!
//! ## Usage
//!
//! ### Byzantine scenario
//!
//! ```rust,no_run
//! use bftlab_harness::{ByzantineScenario, Harness, HarnessConfig};
//! use bftlab_sim::{BehaviorType, ProtocolKind};
//! use std::time::Duration;
//!
//! # async fn run() -> bftlab_harness::HarnessResult<()> {
//! let harness = Harness::new(HarnessConfig::default())?;
//!
//! let scenario = ByzantineScenario::new("pbft-4-1", 4, 1, ProtocolKind::Pbft)
//!     .with_behavior(BehaviorType::Equivocating)
//!     .with_duration(Duration::from_secs(10));
//!
//! let result = harness.scenarios.execute_fault_injection_scenario(scenario).await;
//! println!("success: {}, detection: {:.1}%", result.success,
//!     result.system_resilience.byzantine_detection_rate);
//! # Ok(())
//! # }
//! ```
//!
//! ### Chaos experiment
//!
//! ```rust,no_run
//! use bftlab_harness::{ExperimentType, Harness, HarnessConfig};
//! use bftlab_sim::ProtocolKind;
//!
//! # async fn run() -> bftlab_harness::HarnessResult<()> {
//! let harness = Harness::new(HarnessConfig::default())?;
//! harness.cluster.initialize(7, ProtocolKind::Pbft, 0).await?;
//!
//! let experiment = harness.orchestrator.create_experiment_template(ExperimentType::NodeFailure);
//! let result = harness.orchestrator.execute_experiment(experiment).await?;
//! println!("{:?} in {:?}", result.status, result.actual_behavior.recovery_time);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

use bftlab_sim::{SimConfig, SimError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod cluster;
pub mod experiment;
pub mod faults;
pub mod monitor;
pub mod report;
pub mod scenario;

pub use cluster::{ClusterConditions, ClusterHealth, FaultEffect, SimulatedCluster};
pub use experiment::{
    AbortResult, ActiveExperimentInfo, ActualBehavior, ChaosExperiment, ChaosOrchestrator,
    ExpectedBehavior, ExperimentMetrics, ExperimentPhase, ExperimentResult, ExperimentStatus,
    ExperimentTargets, ExperimentType, RecoveryValidation, SafetyValidation, Safeguards, Severity,
    TestSuite, TestSuiteResult,
};
pub use faults::{
    ActiveFaultInfo, FaultInjection, FaultInjectionResult, FaultInjector, FaultParameters,
    FaultPattern, FaultRecord, FaultRemovalResult, FaultScope, FaultTarget, FaultType,
    RevertReason,
};
pub use monitor::{
    AbortCondition, AlertSeverity, ExperimentMonitor, MonitorAlert, MonitorOutcome, MonitorSample,
};
pub use report::{
    BftReport, ChaosReport, RecommendationTiers, ResilienceAggregator, RiskAssessment, RiskLevel,
    TimeRange, ToleranceAnalysis,
};
pub use scenario::{
    AttackType, BftScenarioEngine, ByzantineScenario, ByzantineTestResult, PerformanceImpact,
    SystemResilience,
};

/// Error types for the harness
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarnessError {
    /// Error raised by the simulation engine
    #[error(transparent)]
    Simulation(#[from] SimError),
    /// Invalid scenario, experiment or fault parameters
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// No active fault with this id
    #[error("fault not found: {0}")]
    FaultNotFound(String),
    /// A fault with this id is already active
    #[error("fault already active: {0}")]
    FaultAlreadyActive(String),
    /// Experiment-scoped injection without a passed safety validation
    #[error("experiment {0} has not passed safety validation")]
    SafetyNotValidated(String),
    /// No active experiment with this id
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),
    /// An experiment with this id is already executing
    #[error("experiment already running: {0}")]
    ExperimentAlreadyRunning(String),
    /// Experiment ended by an abort
    #[error("experiment aborted: {0}")]
    ExperimentAborted(String),
    /// Configuration file could not be parsed or written
    #[error("config error: {0}")]
    Config(String),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Pause between consensus rounds of a scenario (milliseconds)
    pub round_interval_ms: u64,

    /// Round time regarded as unimpaired when computing latency increase (milliseconds)
    pub baseline_latency_ms: u64,

    /// Health sampling interval during experiments (milliseconds)
    pub monitor_interval_ms: u64,

    /// Settling time after faults are removed (milliseconds)
    pub stabilization_ms: u64,

    /// Health score at which the cluster counts as recovered
    pub recovery_health_threshold: f64,

    /// Pause between experiments of a suite when the suite sets none (milliseconds)
    pub default_cooldown_ms: u64,

    /// Longest experiment the safety gate accepts without flagging a risk (milliseconds)
    pub max_experiment_duration_ms: u64,

    /// Capacity of the monitor alert broadcast channel
    pub alert_channel_capacity: usize,

    /// Simulation engine settings (`[sim]` table)
    pub sim: SimConfig,
}

impl HarnessConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            round_interval_ms: 100,
            baseline_latency_ms: 1_000,
            monitor_interval_ms: 1_000,
            stabilization_ms: 5_000,
            recovery_health_threshold: 80.0,
            default_cooldown_ms: 30_000,
            max_experiment_duration_ms: 600_000,
            alert_channel_capacity: 256,
            sim: SimConfig::default(),
        }
    }

    /// Set the simulation seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.sim.seed = seed;
        self
    }

    /// Set the pause between scenario rounds
    pub fn with_round_interval(mut self, interval_ms: u64) -> Self {
        self.round_interval_ms = interval_ms;
        self
    }

    /// Set the stabilization wait after recovery
    pub fn with_stabilization(mut self, stabilization_ms: u64) -> Self {
        self.stabilization_ms = stabilization_ms;
        self
    }

    /// Set the suite cooldown default
    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.default_cooldown_ms = cooldown_ms;
        self
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_cooldown_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> HarnessResult<()> {
        self.sim.validate()?;

        if self.baseline_latency_ms == 0 {
            return Err(HarnessError::InvalidConfiguration(
                "Baseline latency must be positive".to_string(),
            ));
        }

        if self.monitor_interval_ms == 0 {
            return Err(HarnessError::InvalidConfiguration(
                "Monitor interval must be positive".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.recovery_health_threshold) {
            return Err(HarnessError::InvalidConfiguration(
                "Recovery health threshold must be within [0, 100]".to_string(),
            ));
        }

        if self.alert_channel_capacity == 0 {
            return Err(HarnessError::InvalidConfiguration(
                "Alert channel capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> HarnessResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> HarnessResult<String> {
        toml::to_string(self).map_err(|e| HarnessError::Config(e.to_string()))
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The wired harness: one cluster shared by the injector, orchestrator and scenario engine
#[derive(Clone)]
pub struct Harness {
    pub config: HarnessConfig,
    pub cluster: Arc<SimulatedCluster>,
    pub injector: FaultInjector,
    pub orchestrator: Arc<ChaosOrchestrator>,
    pub scenarios: Arc<BftScenarioEngine>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;

        let cluster = Arc::new(SimulatedCluster::new(&config));
        let injector = FaultInjector::new(cluster.clone());
        let orchestrator = Arc::new(ChaosOrchestrator::new(
            config.clone(),
            cluster.clone(),
            injector.clone(),
        ));
        let scenarios = Arc::new(BftScenarioEngine::new(
            config.clone(),
            cluster.clone(),
            injector.clone(),
        ));

        Ok(Self {
            config,
            cluster,
            injector,
            orchestrator,
            scenarios,
        })
    }
}

// Integration utilities
pub mod integration {
    //! Helpers for wiring the harness in tests and tools

    use super::{Harness, HarnessConfig, HarnessResult};
    use tracing_subscriber::EnvFilter;

    /// Install a test-friendly tracing subscriber; repeated calls are no-ops
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    /// Build a harness from a TOML configuration document
    pub fn create_harness_from_toml(document: &str) -> HarnessResult<Harness> {
        Harness::new(HarnessConfig::from_toml_str(document)?)
    }

    /// Harness with short timings for fast runs
    pub fn create_fast_harness(seed: u64) -> HarnessResult<Harness> {
        let config = HarnessConfig::default()
            .with_seed(seed)
            .with_round_interval(10)
            .with_stabilization(100)
            .with_cooldown(100);
        Harness::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.round_interval_ms, 100);
        assert_eq!(config.baseline_latency_ms, 1_000);
        assert_eq!(config.recovery_health_threshold, 80.0);
        assert_eq!(config.max_experiment_duration_ms, 600_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_toml_roundtrip_with_partial_document() {
        let config = HarnessConfig::from_toml_str(
            r#"
            round_interval_ms = 5
            stabilization_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.round_interval_ms, 5);
        assert_eq!(config.stabilization_ms, 250);
        assert_eq!(config.monitor_interval_ms, 1_000);

        let rendered = config.to_toml_string().unwrap();
        assert_eq!(HarnessConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_config_validation() {
        let mut config = HarnessConfig::default();
        config.recovery_health_threshold = 120.0;
        assert!(matches!(config.validate(), Err(HarnessError::InvalidConfiguration(_))));

        assert!(matches!(
            HarnessConfig::from_toml_str("round_interval_ms = \"fast\""),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn test_sim_error_conversion() {
        let err: HarnessError = SimError::NotInitialized.into();
        assert_eq!(err, HarnessError::Simulation(SimError::NotInitialized));
    }
}
