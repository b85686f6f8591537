//! Chaos experiment orchestration
//!
//! Each experiment walks a strict phase sequence:
//!
//! ```text
//! Pending -> Running -> Recovering -> Monitoring -> Completed
//!               \            \             \
//!                `------------`-------------`--> Aborted
//! ```
//!
//! Before anything is injected the experiment passes through the safety gate. Only a
//! cleared experiment may inject faults scoped to it. While its faults are live the
//! [`ExperimentMonitor`] samples cluster health and evaluates the abort conditions;
//! [`ChaosOrchestrator::abort_experiment`] can end the experiment from any task.

use crate::cluster::SimulatedCluster;
use crate::faults::{
    FaultInjection, FaultInjectionResult, FaultInjector, FaultParameters, FaultPattern,
    FaultScope, FaultType,
};
use crate::monitor::{AbortCondition, ExperimentMonitor, MonitorOutcome, MonitorSample};
use crate::report::{ChaosReport, ResilienceAggregator, TimeRange};
use crate::{HarnessConfig, HarnessError, HarnessResult};
use bftlab_sim::utils::{duration_ms, option_duration_ms};
use bftlab_sim::{BehaviorType, NodeId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Kind of chaos experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    NetworkPartition,
    NodeFailure,
    ByzantineFailure,
    ResourceExhaustion,
    LatencyInjection,
}

impl ExperimentType {
    pub fn slug(&self) -> &'static str {
        match self {
            ExperimentType::NetworkPartition => "network-partition",
            ExperimentType::NodeFailure => "node-failure",
            ExperimentType::ByzantineFailure => "byzantine-failure",
            ExperimentType::ResourceExhaustion => "resource-exhaustion",
            ExperimentType::LatencyInjection => "latency-injection",
        }
    }

    /// Whether the experiment needs concrete target nodes
    fn needs_targets(&self) -> bool {
        !matches!(self, ExperimentType::LatencyInjection)
    }
}

/// Experiment severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Nodes an experiment affects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExperimentTargets {
    /// Explicit targets; when empty `percentage` of the cluster is drawn at random
    pub nodes: Vec<NodeId>,
    /// Share of the cluster to target, percent
    pub percentage: f64,
}

/// What the cluster is expected to do under the experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpectedBehavior {
    pub should_recover: bool,
    #[serde(with = "duration_ms")]
    pub max_recovery_time: Duration,
    pub max_data_loss_allowed: bool,
    pub consensus_must_continue: bool,
}

impl Default for ExpectedBehavior {
    fn default() -> Self {
        Self {
            should_recover: true,
            max_recovery_time: Duration::from_secs(30),
            max_data_loss_allowed: false,
            consensus_must_continue: true,
        }
    }
}

/// Limits and rollback plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Safeguards {
    #[serde(with = "option_duration_ms")]
    pub max_duration: Option<Duration>,
    pub abort_conditions: Vec<AbortCondition>,
    pub rollback_steps: Vec<String>,
}

/// Chaos experiment descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChaosExperiment {
    pub id: String,
    pub name: String,
    pub description: String,
    pub experiment_type: ExperimentType,
    pub targets: ExperimentTargets,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub severity: Severity,
    pub parameters: FaultParameters,
    pub expected_behavior: ExpectedBehavior,
    pub safeguards: Safeguards,
}

impl ChaosExperiment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, experiment_type: ExperimentType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            experiment_type,
            targets: ExperimentTargets {
                nodes: Vec::new(),
                percentage: 20.0,
            },
            duration: Duration::from_secs(60),
            severity: Severity::Medium,
            parameters: FaultParameters::default(),
            expected_behavior: ExpectedBehavior::default(),
            safeguards: Safeguards {
                max_duration: Some(Duration::from_secs(300)),
                abort_conditions: vec![AbortCondition::HealthBelow(20.0)],
                rollback_steps: Vec::new(),
            },
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_target_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.targets.nodes = nodes;
        self
    }

    pub fn with_target_percentage(mut self, percentage: f64) -> Self {
        self.targets.percentage = percentage;
        self
    }

    pub fn with_parameters(mut self, parameters: FaultParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_expected_behavior(mut self, expected: ExpectedBehavior) -> Self {
        self.expected_behavior = expected;
        self
    }

    pub fn with_safeguards(mut self, safeguards: Safeguards) -> Self {
        self.safeguards = safeguards;
        self
    }
}

/// Final status of an experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Success,
    Failure,
    Partial,
    Aborted,
}

/// Lifecycle phase of a running experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    Pending,
    Running,
    Recovering,
    Monitoring,
    Completed,
    Aborted,
}

/// Observed behavior of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActualBehavior {
    pub recovered: bool,
    #[serde(with = "option_duration_ms")]
    pub recovery_time: Option<Duration>,
    pub nodes_affected: usize,
    pub nodes_continued: usize,
    pub data_loss: bool,
    pub consensus_continuity: bool,
}

/// Health metrics around the experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExperimentMetrics {
    /// Health drop during the experiment relative to before, percent
    pub performance_impact: f64,
    pub health_before: f64,
    /// Mean of the samples taken while faults were live
    pub health_during: f64,
    pub health_after: f64,
    pub max_latency_ms: u64,
    pub samples: Vec<MonitorSample>,
}

/// Stored result of an experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub experiment_name: String,
    pub experiment_type: ExperimentType,
    pub status: ExperimentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub actual_behavior: ActualBehavior,
    pub metrics: ExperimentMetrics,
    pub faults_injected: Vec<String>,
    pub violations: Vec<String>,
    pub lessons_learned: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ExperimentResult {
    fn failure(experiment: &ChaosExperiment, start_time: DateTime<Utc>, violations: Vec<String>) -> Self {
        Self {
            experiment_id: experiment.id.clone(),
            experiment_name: experiment.name.clone(),
            experiment_type: experiment.experiment_type,
            status: ExperimentStatus::Failure,
            start_time,
            end_time: Utc::now(),
            actual_behavior: ActualBehavior::default(),
            metrics: ExperimentMetrics::default(),
            faults_injected: Vec::new(),
            violations,
            lessons_learned: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExperimentStatus::Success
    }
}

/// Safety gate verdict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyValidation {
    pub experiment_id: String,
    pub is_safe: bool,
    pub risks: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Outcome of [`ChaosOrchestrator::abort_experiment`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbortResult {
    pub success: bool,
    pub experiment_id: String,
    pub error: Option<String>,
    pub faults_removed: Vec<String>,
    pub rollback_steps_executed: usize,
}

/// Ordered set of experiments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSuite {
    pub id: String,
    pub name: String,
    pub experiments: Vec<ChaosExperiment>,
    pub abort_on_first_failure: bool,
    /// Pause between experiments; the configured default when unset
    #[serde(with = "option_duration_ms")]
    pub cooldown: Option<Duration>,
}

impl TestSuite {
    pub fn new(id: impl Into<String>, name: impl Into<String>, experiments: Vec<ChaosExperiment>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            experiments,
            abort_on_first_failure: false,
            cooldown: None,
        }
    }
}

/// Roll-up of a suite run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSuiteResult {
    pub suite_id: String,
    pub suite_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub results: Vec<ExperimentResult>,
    pub stopped_early: bool,
    /// Percent of experiments with `Success`
    pub success_rate: f64,
    /// Percent of experiments after which the cluster recovered
    pub recovery_rate: f64,
    #[serde(with = "option_duration_ms")]
    pub average_recovery_time: Option<Duration>,
    /// `0.6 * success_rate + 0.4 * recovery_rate`
    pub resilience_score: f64,
}

/// Outcome of [`ChaosOrchestrator::validate_recovery`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryValidation {
    pub recovered: bool,
    #[serde(with = "option_duration_ms")]
    pub recovery_time: Option<Duration>,
    pub final_health: f64,
    pub checks: usize,
}

/// Public view of a running experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveExperimentInfo {
    pub experiment_id: String,
    pub name: String,
    pub phase: ExperimentPhase,
    pub started_at: DateTime<Utc>,
    pub fault_ids: Vec<String>,
}

struct ActiveExperiment {
    experiment: ChaosExperiment,
    phase: ExperimentPhase,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    fault_ids: Vec<String>,
    abort_reason: Option<String>,
}

/// Fault and observation state of an experiment whose faults went live
struct Observation {
    targets: Vec<NodeId>,
    fault_ids: Vec<String>,
    outcome: MonitorOutcome,
}

/// Runs chaos experiments and suites against the shared cluster
pub struct ChaosOrchestrator {
    config: HarnessConfig,
    cluster: Arc<SimulatedCluster>,
    injector: FaultInjector,
    monitor: ExperimentMonitor,
    active: DashMap<String, ActiveExperiment>,
    history: RwLock<Vec<ExperimentResult>>,
}

impl ChaosOrchestrator {
    pub fn new(config: HarnessConfig, cluster: Arc<SimulatedCluster>, injector: FaultInjector) -> Self {
        let monitor = ExperimentMonitor::new(&config, cluster.clone());
        Self {
            config,
            cluster,
            injector,
            monitor,
            active: DashMap::new(),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn monitor(&self) -> &ExperimentMonitor {
        &self.monitor
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    /// Run one experiment to completion. A second concurrent run of the same id is an error.
    pub async fn execute_experiment(&self, experiment: ChaosExperiment) -> HarnessResult<ExperimentResult> {
        let cancel = CancellationToken::new();
        match self.active.entry(experiment.id.clone()) {
            Entry::Occupied(_) => {
                return Err(HarnessError::ExperimentAlreadyRunning(experiment.id.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveExperiment {
                    experiment: experiment.clone(),
                    phase: ExperimentPhase::Pending,
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                    fault_ids: Vec::new(),
                    abort_reason: None,
                });
            }
        }

        info!(experiment = %experiment.id, kind = ?experiment.experiment_type, "experiment started");
        let result = self.run(&experiment, cancel).await;

        // Revoke before releasing the id so a successor's clearance survives
        self.injector.revoke_experiment(&experiment.id);
        self.active.remove(&experiment.id);

        info!(experiment = %experiment.id, status = ?result.status, "experiment finished");
        self.history.write().await.push(result.clone());
        Ok(result)
    }

    async fn run(&self, experiment: &ChaosExperiment, cancel: CancellationToken) -> ExperimentResult {
        let start_time = Utc::now();
        let id = experiment.id.as_str();

        let safety = self.validate_experiment_safety(experiment);
        if !safety.is_safe {
            warn!(experiment = id, risks = safety.risks.len(), "experiment rejected by safety gate");
            let mut result = ExperimentResult::failure(experiment, start_time, safety.risks);
            result.recommendations = safety.recommendations;
            return result;
        }

        self.set_phase(id, ExperimentPhase::Running);
        let health_before = self.cluster.health().await.health_score;

        let observation = match self.inject_and_observe(experiment, cancel.clone()).await {
            Ok(observation) => observation,
            Err(e) => {
                error!(experiment = id, error = %e, "experiment failed");
                let removed = self.injector.emergency_recovery(id).await;
                let mut result = ExperimentResult::failure(experiment, start_time, vec![e.to_string()]);
                result.metrics.health_before = health_before;
                result.faults_injected = removed;
                result.recommendations =
                    vec!["Investigate the experiment configuration and cluster state".to_string()];
                return result;
            }
        };

        if let Some(condition) = observation.outcome.triggered {
            self.abort_experiment(id, &format!("Abort condition met: {}", condition))
                .await;
        }
        let aborted = cancel.is_cancelled();

        // Recovering
        self.set_phase(id, ExperimentPhase::Recovering);
        self.injector.remove_faults_for_experiment(id).await;
        let recovery_started = Instant::now();
        if !aborted {
            sleep(self.config.stabilization()).await;
        }

        // Monitoring
        self.set_phase(id, ExperimentPhase::Monitoring);
        let recovery = self
            .validate_recovery(experiment.expected_behavior.max_recovery_time)
            .await;
        let recovery_time = recovery.recovered.then(|| recovery_started.elapsed());

        self.set_phase(
            id,
            if aborted {
                ExperimentPhase::Aborted
            } else {
                ExperimentPhase::Completed
            },
        );

        self.synthesize(
            experiment,
            start_time,
            health_before,
            observation,
            recovery,
            recovery_time,
            aborted,
        )
        .await
    }

    async fn inject_and_observe(
        &self,
        experiment: &ChaosExperiment,
        cancel: CancellationToken,
    ) -> HarnessResult<Observation> {
        let targets = self.resolve_targets(experiment).await?;
        let faults = self.build_faults(experiment, &targets).await?;

        let mut fault_ids = Vec::with_capacity(faults.len());
        for fault in faults {
            let result = self.injector.inject_fault(fault).await;
            if !result.success {
                return Err(HarnessError::InvalidConfiguration(
                    result.error.unwrap_or_else(|| "fault injection failed".to_string()),
                ));
            }
            fault_ids.push(result.injection_id.clone());
            if let Some(mut active) = self.active.get_mut(&experiment.id) {
                active.fault_ids.push(result.injection_id);
            }
        }

        let outcome = self
            .monitor
            .watch(
                &experiment.id,
                &experiment.safeguards.abort_conditions,
                self.bounded_duration(experiment),
                cancel,
            )
            .await;

        Ok(Observation {
            targets,
            fault_ids,
            outcome,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn synthesize(
        &self,
        experiment: &ChaosExperiment,
        start_time: DateTime<Utc>,
        health_before: f64,
        observation: Observation,
        recovery: RecoveryValidation,
        recovery_time: Option<Duration>,
        aborted: bool,
    ) -> ExperimentResult {
        let expected = &experiment.expected_behavior;
        let outcome = &observation.outcome;

        let health_during = outcome.mean_health().unwrap_or(health_before);
        let performance_impact = if health_before > 0.0 {
            ((health_before - health_during) / health_before * 100.0).max(0.0)
        } else {
            0.0
        };
        let consensus_continuity = outcome.consensus_continuous();
        let data_loss = outcome
            .samples
            .iter()
            .any(|s| !s.consensus_capable && s.byzantine_nodes > 0);
        let total_nodes = self.cluster.node_count().await;
        let nodes_affected = observation.targets.len();

        let mut violations = Vec::new();
        if expected.should_recover && !recovery.recovered {
            violations.push(format!(
                "Cluster did not recover within {} ms (final health {:.1})",
                expected.max_recovery_time.as_millis(),
                recovery.final_health
            ));
        }
        if let Some(time) = recovery_time {
            if time > expected.max_recovery_time {
                violations.push(format!(
                    "Recovery took {} ms, above the {} ms allowed",
                    time.as_millis(),
                    expected.max_recovery_time.as_millis()
                ));
            }
        }
        if expected.consensus_must_continue && !consensus_continuity {
            violations.push("Consensus was interrupted while faults were active".to_string());
        }
        if !expected.max_data_loss_allowed && data_loss {
            violations.push("Byzantine share exceeded protocol tolerance; data loss possible".to_string());
        }

        let status = if aborted {
            let reason = self
                .active
                .get(&experiment.id)
                .and_then(|active| active.abort_reason.clone());
            if let Some(reason) = reason {
                violations.push(format!("Aborted: {}", reason));
            }
            ExperimentStatus::Aborted
        } else {
            // Expected-behavior violations are findings of a completed run
            ExperimentStatus::Success
        };

        let mut lessons_learned = Vec::new();
        if let Some(time) = recovery_time {
            lessons_learned.push(format!(
                "Cluster recovered {} ms after faults were removed",
                time.as_millis()
            ));
        }
        if performance_impact > 20.0 {
            lessons_learned.push(format!(
                "Health dropped by {:.1}% with {} of {} nodes affected",
                performance_impact, nodes_affected, total_nodes
            ));
        }
        if !consensus_continuity {
            lessons_learned.push("Consensus capability depends on the affected nodes".to_string());
        }

        let mut recommendations = Vec::new();
        if !recovery.recovered {
            recommendations.push("Review recovery procedures and automated failover".to_string());
        }
        if !consensus_continuity {
            recommendations.push("Increase cluster size or redundancy to keep consensus under this fault".to_string());
        }
        if performance_impact > 50.0 {
            recommendations.push("Reduce blast radius: fewer targets or lower intensity".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("Resilience held; consider raising intensity in the next run".to_string());
        }

        ExperimentResult {
            experiment_id: experiment.id.clone(),
            experiment_name: experiment.name.clone(),
            experiment_type: experiment.experiment_type,
            status,
            start_time,
            end_time: Utc::now(),
            actual_behavior: ActualBehavior {
                recovered: recovery.recovered,
                recovery_time,
                nodes_affected,
                nodes_continued: total_nodes.saturating_sub(nodes_affected),
                data_loss,
                consensus_continuity,
            },
            metrics: ExperimentMetrics {
                performance_impact,
                health_before,
                health_during,
                health_after: recovery.final_health,
                max_latency_ms: outcome.max_latency_ms(),
                samples: outcome.samples.clone(),
            },
            faults_injected: observation.fault_ids,
            violations,
            lessons_learned,
            recommendations,
        }
    }

    /// Explicit targets, or `percentage` of the cluster drawn at random
    async fn resolve_targets(&self, experiment: &ChaosExperiment) -> HarnessResult<Vec<NodeId>> {
        if !experiment.targets.nodes.is_empty() {
            return Ok(experiment.targets.nodes.clone());
        }

        let total = self.cluster.node_count().await;
        let count = ((total as f64) * experiment.targets.percentage / 100.0).ceil() as usize;
        let targets = self.cluster.select_nodes(count.min(total)).await?;

        if targets.is_empty() && experiment.experiment_type.needs_targets() {
            return Err(HarnessError::InvalidConfiguration(format!(
                "Experiment {} resolves to no target nodes",
                experiment.id
            )));
        }
        Ok(targets)
    }

    async fn build_faults(
        &self,
        experiment: &ChaosExperiment,
        targets: &[NodeId],
    ) -> HarnessResult<Vec<FaultInjection>> {
        let id = &experiment.id;
        let params = experiment.parameters.clone();

        let fault = match experiment.experiment_type {
            ExperimentType::NetworkPartition => {
                let rest: Vec<NodeId> = self
                    .cluster
                    .nodes()
                    .await
                    .into_iter()
                    .map(|n| n.node_id)
                    .filter(|n| !targets.contains(n))
                    .collect();
                FaultInjection::new(format!("{}-partition", id), FaultType::Network, FaultScope::Cluster)
                    .with_parameters(FaultParameters {
                        pattern: FaultPattern::Partition,
                        groups: vec![rest, targets.to_vec()],
                        ..params
                    })
            }
            ExperimentType::NodeFailure => FaultInjection::new(
                format!("{}-process", id),
                FaultType::Process,
                FaultScope::Nodes(targets.to_vec()),
            )
            .with_parameters(params),
            ExperimentType::ByzantineFailure => FaultInjection::new(
                format!("{}-consensus", id),
                FaultType::Consensus,
                FaultScope::Nodes(targets.to_vec()),
            )
            .with_parameters(FaultParameters {
                behavior: Some(params.behavior.unwrap_or(BehaviorType::Coordinated)),
                ..params
            }),
            ExperimentType::ResourceExhaustion => FaultInjection::new(
                format!("{}-resource", id),
                FaultType::Cpu,
                FaultScope::Nodes(targets.to_vec()),
            )
            .with_parameters(params),
            ExperimentType::LatencyInjection => FaultInjection::new(
                format!("{}-latency", id),
                FaultType::Network,
                FaultScope::Cluster,
            )
            .with_parameters(FaultParameters {
                latency_ms: Some(
                    params
                        .latency_ms
                        .unwrap_or((params.intensity * self.config.baseline_latency_ms as f64) as u64),
                ),
                ..params
            }),
        };

        Ok(vec![fault
            .with_duration(self.bounded_duration(experiment))
            .for_experiment(id.clone())])
    }

    fn bounded_duration(&self, experiment: &ChaosExperiment) -> Duration {
        match experiment.safeguards.max_duration {
            Some(max) => experiment.duration.min(max),
            None => experiment.duration,
        }
    }

    /// Advance the phase; an aborted experiment stays aborted
    fn set_phase(&self, experiment_id: &str, phase: ExperimentPhase) {
        if let Some(mut active) = self.active.get_mut(experiment_id) {
            if active.phase == ExperimentPhase::Aborted {
                return;
            }
            info!(experiment = experiment_id, from = ?active.phase, to = ?phase, "experiment phase");
            active.phase = phase;
        }
    }

    /// Cancel a running experiment, remove its faults and replay its rollback steps.
    /// The entry stays registered until the run itself finishes.
    pub async fn abort_experiment(&self, experiment_id: &str, reason: &str) -> AbortResult {
        let refused = |error: HarnessError| AbortResult {
            success: false,
            experiment_id: experiment_id.to_string(),
            error: Some(error.to_string()),
            faults_removed: Vec::new(),
            rollback_steps_executed: 0,
        };

        let steps = {
            let Some(mut active) = self.active.get_mut(experiment_id) else {
                return refused(HarnessError::ExperimentNotFound(experiment_id.to_string()));
            };
            if active.phase == ExperimentPhase::Aborted {
                return refused(HarnessError::ExperimentAborted(experiment_id.to_string()));
            }

            warn!(experiment = experiment_id, reason, phase = ?active.phase, "aborting experiment");
            active.phase = ExperimentPhase::Aborted;
            active.abort_reason = Some(reason.to_string());
            active.cancel.cancel();
            active.experiment.safeguards.rollback_steps.clone()
        };

        let faults_removed = self.injector.emergency_recovery(experiment_id).await;

        for (index, step) in steps.iter().enumerate() {
            info!(experiment = experiment_id, step = index + 1, action = %step, "rollback step");
        }

        AbortResult {
            success: true,
            experiment_id: experiment_id.to_string(),
            error: None,
            faults_removed,
            rollback_steps_executed: steps.len(),
        }
    }

    /// Run a suite sequentially with a cooldown between experiments
    pub async fn execute_test_suite(&self, suite: TestSuite) -> TestSuiteResult {
        let start_time = Utc::now();
        let cooldown = suite.cooldown.unwrap_or_else(|| self.config.default_cooldown());
        let mut results = Vec::with_capacity(suite.experiments.len());
        let mut stopped_early = false;

        info!(suite = %suite.id, experiments = suite.experiments.len(), "test suite started");

        for (index, experiment) in suite.experiments.iter().enumerate() {
            if index > 0 && !cooldown.is_zero() {
                sleep(cooldown).await;
            }

            let result = match self.execute_experiment(experiment.clone()).await {
                Ok(result) => result,
                Err(e) => ExperimentResult::failure(experiment, Utc::now(), vec![e.to_string()]),
            };
            let succeeded = result.is_success();
            results.push(result);

            if !succeeded && suite.abort_on_first_failure {
                warn!(suite = %suite.id, experiment = %experiment.id, "suite stopped after failure");
                stopped_early = true;
                break;
            }
        }

        let total = results.len();
        let successes = results.iter().filter(|r| r.is_success()).count();
        let recovery_times: Vec<Duration> = results
            .iter()
            .filter(|r| r.actual_behavior.recovered)
            .filter_map(|r| r.actual_behavior.recovery_time)
            .collect();
        let recovered = results.iter().filter(|r| r.actual_behavior.recovered).count();

        let success_rate = bftlab_sim::utils::percentage(successes, total);
        let recovery_rate = bftlab_sim::utils::percentage(recovered, total);
        let average_recovery_time = if recovery_times.is_empty() {
            None
        } else {
            Some(recovery_times.iter().sum::<Duration>() / recovery_times.len() as u32)
        };

        TestSuiteResult {
            suite_id: suite.id,
            suite_name: suite.name,
            start_time,
            end_time: Utc::now(),
            results,
            stopped_early,
            success_rate,
            recovery_rate,
            average_recovery_time,
            resilience_score: 0.6 * success_rate + 0.4 * recovery_rate,
        }
    }

    /// Score an experiment's risk; safe experiments are cleared for fault injection
    pub fn validate_experiment_safety(&self, experiment: &ChaosExperiment) -> SafetyValidation {
        let validation = assess_safety(experiment, self.config.max_experiment_duration_ms);
        if validation.is_safe {
            self.injector.clear_experiment(&experiment.id);
        } else {
            self.injector.revoke_experiment(&experiment.id);
        }
        validation
    }

    /// Poll health until it reaches the recovery threshold or `timeout` passes
    pub async fn validate_recovery(&self, timeout: Duration) -> RecoveryValidation {
        let started = Instant::now();
        let deadline = started + timeout;
        let threshold = self.config.recovery_health_threshold;
        let mut checks = 0;

        loop {
            let health = self.cluster.health().await.health_score;
            checks += 1;

            if health >= threshold {
                return RecoveryValidation {
                    recovered: true,
                    recovery_time: Some(started.elapsed()),
                    final_health: health,
                    checks,
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return RecoveryValidation {
                    recovered: false,
                    recovery_time: None,
                    final_health: health,
                    checks,
                };
            }
            sleep(self.config.monitor_interval().min(deadline - now)).await;
        }
    }

    /// Partition the cluster for `duration`
    pub async fn simulate_network_partition(
        &self,
        groups: Vec<Vec<NodeId>>,
        duration: Duration,
    ) -> FaultInjectionResult {
        let id = format!("partition-{}", uuid::Uuid::new_v4());
        self.injector
            .inject_fault(FaultInjection::partition(id, groups).with_duration(duration))
            .await
    }

    /// Take `nodes` offline for `duration`
    pub async fn simulate_node_failure(&self, nodes: Vec<NodeId>, duration: Duration) -> FaultInjectionResult {
        let id = format!("node-failure-{}", uuid::Uuid::new_v4());
        self.injector
            .inject_fault(FaultInjection::node_failure(id, nodes).with_duration(duration))
            .await
    }

    pub fn get_active_experiments(&self) -> Vec<ActiveExperimentInfo> {
        let mut active: Vec<ActiveExperimentInfo> = self
            .active
            .iter()
            .map(|entry| ActiveExperimentInfo {
                experiment_id: entry.key().clone(),
                name: entry.experiment.name.clone(),
                phase: entry.phase,
                started_at: entry.started_at,
                fault_ids: entry.fault_ids.clone(),
            })
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Ready-to-run experiment with conservative defaults for `experiment_type`
    pub fn create_experiment_template(&self, experiment_type: ExperimentType) -> ChaosExperiment {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", experiment_type.slug(), &short[..8]);

        let (name, description, percentage, parameters, rollback) = match experiment_type {
            ExperimentType::NetworkPartition => (
                "Network partition",
                "Isolate a minority of nodes from the rest of the cluster",
                30.0,
                FaultParameters {
                    pattern: FaultPattern::Partition,
                    ..FaultParameters::default()
                },
                "Heal network partition",
            ),
            ExperimentType::NodeFailure => (
                "Node failure",
                "Take a share of the nodes offline",
                20.0,
                FaultParameters::default(),
                "Restart failed nodes",
            ),
            ExperimentType::ByzantineFailure => (
                "Byzantine failure",
                "Compromise nodes with coordinated Byzantine behavior",
                25.0,
                FaultParameters {
                    behavior: Some(BehaviorType::Coordinated),
                    ..FaultParameters::default()
                },
                "Restore compromised nodes",
            ),
            ExperimentType::ResourceExhaustion => (
                "Resource exhaustion",
                "Apply cpu pressure to a share of the nodes",
                20.0,
                FaultParameters {
                    intensity: 0.7,
                    ..FaultParameters::default()
                },
                "Release resource pressure",
            ),
            ExperimentType::LatencyInjection => (
                "Latency injection",
                "Add network latency to every consensus round",
                100.0,
                FaultParameters {
                    latency_ms: Some(500),
                    ..FaultParameters::default()
                },
                "Remove injected latency",
            ),
        };

        let mut experiment = ChaosExperiment::new(id, name, experiment_type)
            .with_target_percentage(percentage)
            .with_parameters(parameters);
        experiment.description = description.to_string();
        experiment.safeguards.rollback_steps = vec![rollback.to_string()];
        experiment
    }

    pub async fn experiment_history(&self) -> Vec<ExperimentResult> {
        self.history.read().await.clone()
    }

    /// Chaos report over the stored history
    pub async fn generate_report(&self, range: Option<TimeRange>) -> ChaosReport {
        let history = self.history.read().await;
        ResilienceAggregator::generate_chaos_report(&history, range)
    }
}

/// Risk assessment behind the safety gate
pub fn assess_safety(experiment: &ChaosExperiment, max_duration_ms: u64) -> SafetyValidation {
    let mut risks = Vec::new();
    let mut recommendations = Vec::new();

    if experiment.duration.as_millis() > max_duration_ms as u128 {
        risks.push(format!(
            "Experiment duration exceeds {} minutes",
            max_duration_ms / 60_000
        ));
        recommendations.push("Shorten the experiment or split it into phases".to_string());
    }

    if experiment.severity == Severity::Critical {
        risks.push("Critical severity experiments can cause system-wide outages".to_string());
        recommendations.push("Run critical experiments in an isolated environment first".to_string());
    }

    if experiment.targets.percentage > 50.0 {
        risks.push("Experiment targets more than 50% of nodes".to_string());
        recommendations.push("Target at most half of the cluster".to_string());
    }

    if experiment.safeguards.max_duration.is_none() {
        risks.push("No maximum duration safeguard configured".to_string());
        recommendations.push("Set a maximum duration safeguard".to_string());
    }

    let is_safe = risks.len() <= 2 && experiment.severity != Severity::Critical;

    SafetyValidation {
        experiment_id: experiment.id.clone(),
        is_safe,
        risks,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_safety_gate_rules() {
        let safe = ChaosExperiment::new("e1", "safe", ExperimentType::NodeFailure);
        let validation = assess_safety(&safe, 600_000);
        assert!(validation.is_safe);
        assert!(validation.risks.is_empty());

        let critical = safe
            .clone()
            .with_duration(Duration::from_millis(700_000))
            .with_severity(Severity::Critical);
        let validation = assess_safety(&critical, 600_000);
        assert!(!validation.is_safe);
        assert_eq!(validation.risks.len(), 2);

        // Two risks alone still pass
        let mut risky = safe.clone().with_target_percentage(60.0);
        risky.safeguards.max_duration = None;
        assert!(assess_safety(&risky, 600_000).is_safe);

        // Three do not
        let risky = risky.with_duration(Duration::from_secs(900));
        let validation = assess_safety(&risky, 600_000);
        assert_eq!(validation.risks.len(), 3);
        assert!(!validation.is_safe);
    }

    #[test]
    fn test_experiment_json_shape() {
        let experiment = ChaosExperiment::new("json", "json", ExperimentType::LatencyInjection)
            .with_duration(Duration::from_secs(45));
        let value = serde_json::to_value(&experiment).unwrap();
        assert_eq!(value["duration"], 45_000);
        assert_eq!(value["experiment_type"], "latency_injection");
        assert_eq!(value["safeguards"]["max_duration"], 300_000);
        assert_eq!(
            value["safeguards"]["abort_conditions"][0],
            serde_json::json!({ "kind": "health_below", "threshold": 20.0 })
        );

        let back: ChaosExperiment = serde_json::from_value(value).unwrap();
        assert_eq!(back, experiment);
    }

    fn severity() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Low),
            Just(Severity::Medium),
            Just(Severity::High),
            Just(Severity::Critical),
        ]
    }

    proptest! {
        #[test]
        fn prop_safety_gate_never_clears_critical(
            duration_ms in 0u64..2_000_000,
            percentage in 0.0f64..100.0,
            severity in severity(),
            bounded in any::<bool>(),
        ) {
            let mut experiment = ChaosExperiment::new("p", "p", ExperimentType::NodeFailure)
                .with_duration(Duration::from_millis(duration_ms))
                .with_severity(severity)
                .with_target_percentage(percentage);
            if !bounded {
                experiment.safeguards.max_duration = None;
            }

            let validation = assess_safety(&experiment, 600_000);
            prop_assert_eq!(
                validation.is_safe,
                validation.risks.len() <= 2 && severity != Severity::Critical
            );
            prop_assert_eq!(validation.risks.len(), validation.recommendations.len());
            if severity == Severity::Critical {
                prop_assert!(!validation.is_safe);
            }
        }
    }

    #[test]
    fn test_experiment_type_slugs() {
        assert_eq!(ExperimentType::NodeFailure.slug(), "node-failure");
        assert!(!ExperimentType::LatencyInjection.needs_targets());
        assert!(ExperimentType::NetworkPartition.needs_targets());
    }
}
