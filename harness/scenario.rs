//! Byzantine fault-injection scenarios
//!
//! A scenario re-initializes the shared cluster, compromises a set of nodes, keeps its
//! faults live through the injector and drives consensus rounds. The verdict is derived
//! from the rounds alone:
//!
//! - safety holds iff no round finalized a tampered value
//! - liveness holds iff fewer than 10% of rounds overran the protocol timeout
//! - consensus is achieved iff more than 90% of rounds reached agreement
//!
//! Scenario entry points never return `Err`. Failures are folded into a
//! `success = false` result and recorded like any other run.

use crate::cluster::SimulatedCluster;
use crate::faults::{FaultInjection, FaultInjector};
use crate::report::{BftReport, ResilienceAggregator, TimeRange};
use crate::{HarnessConfig, HarnessError, HarnessResult};
use bftlab_sim::utils::{duration_ms, percentage};
use bftlab_sim::{
    BehaviorType, ConsensusStatistics, ConsensusValidation, DetectionReport, Node, NodeId,
    ProtocolKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const MIN_ROUNDS: usize = 10;

/// Named attack patterns for coordinated attacks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Lying,
    Equivocation,
    Delay,
    Silence,
    Flooding,
    Coordinated,
}

impl AttackType {
    pub fn behavior(&self) -> BehaviorType {
        match self {
            AttackType::Lying => BehaviorType::Lying,
            AttackType::Equivocation => BehaviorType::Equivocating,
            AttackType::Delay => BehaviorType::Delaying,
            AttackType::Silence => BehaviorType::Silent,
            AttackType::Flooding => BehaviorType::Flooding,
            AttackType::Coordinated => BehaviorType::Coordinated,
        }
    }
}

/// Byzantine scenario descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ByzantineScenario {
    pub id: String,
    pub total_nodes: usize,
    pub byzantine_count: usize,
    /// Explicit Byzantine nodes; drawn at random when empty
    pub byzantine_nodes: Vec<NodeId>,
    pub behavior: BehaviorType,
    pub protocol: ProtocolKind,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Lower bound on rounds beyond the duration-derived count
    pub rounds: Option<usize>,
    /// Faults kept live while the rounds run
    pub faults: Vec<FaultInjection>,
}

impl ByzantineScenario {
    pub fn new(id: impl Into<String>, total_nodes: usize, byzantine_count: usize, protocol: ProtocolKind) -> Self {
        Self {
            id: id.into(),
            total_nodes,
            byzantine_count,
            byzantine_nodes: Vec::new(),
            behavior: BehaviorType::Lying,
            protocol,
            duration: Duration::from_secs(10),
            rounds: None,
            faults: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: BehaviorType) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Fix the Byzantine set; also sets `byzantine_count`
    pub fn with_byzantine_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.byzantine_count = nodes.len();
        self.byzantine_nodes = nodes;
        self
    }

    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = Some(rounds);
        self
    }

    pub fn with_faults(mut self, faults: Vec<FaultInjection>) -> Self {
        self.faults = faults;
        self
    }

    /// `max(10, duration_s)`, raised to `rounds` when that is larger
    pub fn round_count(&self) -> usize {
        let by_duration = (self.duration.as_millis() / 1000) as usize;
        let base = by_duration.max(MIN_ROUNDS);
        self.rounds.map_or(base, |r| r.max(base))
    }

    pub fn byzantine_percentage(&self) -> f64 {
        percentage(self.byzantine_count, self.total_nodes)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.total_nodes == 0 {
            return Err(HarnessError::InvalidConfiguration(
                "Scenario needs at least one node".to_string(),
            ));
        }

        if self.byzantine_count > self.total_nodes {
            return Err(HarnessError::InvalidConfiguration(format!(
                "Byzantine count {} exceeds total nodes {}",
                self.byzantine_count, self.total_nodes
            )));
        }

        if let Some(id) = self
            .byzantine_nodes
            .iter()
            .find(|id| **id as usize >= self.total_nodes)
        {
            return Err(HarnessError::InvalidConfiguration(format!(
                "Byzantine node {} is outside a cluster of {}",
                id, self.total_nodes
            )));
        }

        if self.byzantine_count > 0 && self.behavior == BehaviorType::Honest {
            return Err(HarnessError::InvalidConfiguration(
                "Byzantine nodes need a malicious behavior".to_string(),
            ));
        }

        Ok(())
    }
}

/// Resilience verdict of a scenario
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemResilience {
    pub safety_maintained: bool,
    pub liveness_maintained: bool,
    pub consensus_achieved: bool,
    /// Percent of Byzantine round appearances that were detected
    pub byzantine_detection_rate: f64,
}

/// Performance cost of a scenario, all in percent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceImpact {
    pub latency_increase: f64,
    pub throughput_decrease: f64,
    pub resource_overhead: f64,
}

/// Outcome of a scenario or coordinated attack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ByzantineTestResult {
    pub scenario_id: String,
    pub protocol: ProtocolKind,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_nodes: usize,
    pub byzantine_nodes: Vec<NodeId>,
    pub byzantine_percentage: f64,
    pub consensus_results: Vec<ConsensusValidation>,
    pub statistics: ConsensusStatistics,
    pub system_resilience: SystemResilience,
    pub performance_impact: PerformanceImpact,
    pub error: Option<String>,
    pub recommendations: Vec<String>,
}

impl ByzantineTestResult {
    fn failed(scenario: &ByzantineScenario, start_time: DateTime<Utc>, error: &HarnessError) -> Self {
        Self {
            scenario_id: scenario.id.clone(),
            protocol: scenario.protocol,
            success: false,
            start_time,
            end_time: Utc::now(),
            total_nodes: scenario.total_nodes,
            byzantine_nodes: scenario.byzantine_nodes.clone(),
            byzantine_percentage: scenario.byzantine_percentage(),
            consensus_results: Vec::new(),
            statistics: ConsensusStatistics::default(),
            system_resilience: SystemResilience::default(),
            performance_impact: PerformanceImpact::default(),
            error: Some(error.to_string()),
            recommendations: vec![format!(
                "Investigate scenario failure: {}",
                error
            )],
        }
    }
}

/// Runs Byzantine scenarios against the shared cluster
pub struct BftScenarioEngine {
    config: HarnessConfig,
    cluster: Arc<SimulatedCluster>,
    injector: FaultInjector,
    history: RwLock<Vec<ByzantineTestResult>>,
}

impl BftScenarioEngine {
    pub fn new(config: HarnessConfig, cluster: Arc<SimulatedCluster>, injector: FaultInjector) -> Self {
        Self {
            config,
            cluster,
            injector,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Run a scenario; every outcome, including failures, is recorded
    pub async fn execute_fault_injection_scenario(&self, scenario: ByzantineScenario) -> ByzantineTestResult {
        let start_time = Utc::now();
        info!(
            scenario = %scenario.id,
            protocol = %scenario.protocol,
            nodes = scenario.total_nodes,
            byzantine = scenario.byzantine_count,
            "scenario started"
        );

        let mut injected = Vec::new();
        let result = match self.run(&scenario, start_time, &mut injected).await {
            Ok(result) => result,
            Err(e) => {
                error!(scenario = %scenario.id, error = %e, "scenario failed");
                self.remove_scenario_faults(&mut injected).await;
                ByzantineTestResult::failed(&scenario, start_time, &e)
            }
        };

        info!(
            scenario = %scenario.id,
            success = result.success,
            safety = result.system_resilience.safety_maintained,
            liveness = result.system_resilience.liveness_maintained,
            "scenario finished"
        );
        self.history.write().await.push(result.clone());
        result
    }

    /// `injected` collects the fault ids this run owns; only those are ever removed
    async fn run(
        &self,
        scenario: &ByzantineScenario,
        start_time: DateTime<Utc>,
        injected: &mut Vec<String>,
    ) -> HarnessResult<ByzantineTestResult> {
        scenario.validate()?;

        self.cluster
            .initialize(scenario.total_nodes, scenario.protocol, 0)
            .await?;

        let byzantine_nodes = if scenario.byzantine_nodes.is_empty() {
            self.cluster.select_nodes(scenario.byzantine_count).await?
        } else {
            scenario.byzantine_nodes.clone()
        };
        if !byzantine_nodes.is_empty() {
            self.cluster.compromise(&byzantine_nodes, scenario.behavior).await;
        }

        for fault in &scenario.faults {
            let outcome = self.injector.inject_fault(fault.clone()).await;
            if !outcome.success {
                return Err(HarnessError::InvalidConfiguration(
                    outcome
                        .error
                        .unwrap_or_else(|| format!("fault {} was not injected", fault.id)),
                ));
            }
            injected.push(outcome.injection_id);
        }

        let rounds = scenario.round_count();
        let mut consensus_results = Vec::with_capacity(rounds);
        for round in 0..rounds {
            if round > 0 {
                sleep(self.config.round_interval()).await;
            }
            let value = format!("{}-value-{}", scenario.id, round);
            let validation = self.cluster.execute_round(&value).await?;
            debug!(
                scenario = %scenario.id,
                round = validation.round,
                reached = validation.consensus_reached,
                "scenario round"
            );
            consensus_results.push(validation);
        }

        self.remove_scenario_faults(injected).await;

        let statistics = ConsensusStatistics::from_history(&consensus_results);
        let system_resilience = SystemResilience {
            safety_maintained: statistics.safety_violations == 0,
            liveness_maintained: (statistics.liveness_violations as f64) < rounds as f64 * 0.1,
            consensus_achieved: statistics.success_rate > 90.0,
            byzantine_detection_rate: statistics.detection_rate,
        };

        let byzantine_percentage = percentage(byzantine_nodes.len(), scenario.total_nodes);
        let performance_impact = self
            .performance_impact(&statistics, byzantine_percentage)
            .await;

        let success = system_resilience.safety_maintained
            && system_resilience.liveness_maintained
            && system_resilience.consensus_achieved;
        let recommendations = recommendations(success, &system_resilience, byzantine_percentage);

        if !success {
            warn!(scenario = %scenario.id, byzantine_percentage, "resilience not maintained");
        }

        Ok(ByzantineTestResult {
            scenario_id: scenario.id.clone(),
            protocol: scenario.protocol,
            success,
            start_time,
            end_time: Utc::now(),
            total_nodes: scenario.total_nodes,
            byzantine_nodes,
            byzantine_percentage,
            consensus_results,
            statistics,
            system_resilience,
            performance_impact,
            error: None,
            recommendations,
        })
    }

    async fn performance_impact(&self, statistics: &ConsensusStatistics, byzantine_percentage: f64) -> PerformanceImpact {
        let baseline_ms = self.config.baseline_latency_ms as f64;
        let (throughput_factor, overhead_noise) = self
            .cluster
            .with_simulator(|sim| {
                let rng = sim.rng();
                (rng.uniform(0.5, 1.0), rng.uniform(5.0, 15.0))
            })
            .await;

        PerformanceImpact {
            latency_increase: latency_increase(statistics.average_consensus_time_ms, baseline_ms),
            throughput_decrease: byzantine_percentage * throughput_factor,
            resource_overhead: overhead_noise + 0.2 * byzantine_percentage,
        }
    }

    async fn remove_scenario_faults(&self, injected: &mut Vec<String>) {
        for id in injected.drain(..) {
            // A timer may already have released it
            if self.injector.is_active(&id) {
                self.injector.remove_fault(&id).await;
            }
        }
    }

    pub async fn compromise_nodes(&self, ids: &[NodeId], behavior: BehaviorType) -> bool {
        self.cluster.compromise(ids, behavior).await
    }

    pub async fn restore_nodes(&self, ids: &[NodeId]) -> bool {
        self.cluster.restore(ids).await
    }

    /// Compromise the honest nodes among `ids` with lying behavior and run `rounds` rounds
    pub async fn validate_consensus_under_attack(
        &self,
        ids: &[NodeId],
        rounds: usize,
    ) -> HarnessResult<Vec<ConsensusValidation>> {
        let honest: Vec<NodeId> = self
            .cluster
            .nodes()
            .await
            .into_iter()
            .filter(|n| ids.contains(&n.node_id) && n.is_honest())
            .map(|n| n.node_id)
            .collect();
        if !honest.is_empty() {
            self.cluster.compromise(&honest, BehaviorType::Lying).await;
        }

        let mut validations = Vec::with_capacity(rounds);
        for round in 0..rounds {
            validations.push(self.cluster.execute_round(&format!("attack-value-{}", round)).await?);
        }
        Ok(validations)
    }

    /// Scenario over the current cluster size and protocol with explicit attackers
    pub async fn simulate_coordinated_attack(
        &self,
        attackers: Vec<NodeId>,
        attack_type: AttackType,
        duration: Duration,
    ) -> ByzantineTestResult {
        let id = format!("coordinated-{}", uuid::Uuid::new_v4());
        let protocol = self.cluster.protocol().await;
        let total = self.cluster.node_count().await;

        let Some(protocol) = protocol else {
            let scenario = ByzantineScenario::new(id, total, attackers.len(), ProtocolKind::Pbft)
                .with_byzantine_nodes(attackers);
            let result = ByzantineTestResult::failed(
                &scenario,
                Utc::now(),
                &HarnessError::Simulation(bftlab_sim::SimError::NotInitialized),
            );
            warn!(scenario = %result.scenario_id, "coordinated attack on uninitialized cluster");
            self.history.write().await.push(result.clone());
            return result;
        };

        info!(attackers = attackers.len(), ?attack_type, "coordinated attack");
        let scenario = ByzantineScenario::new(id, total, attackers.len(), protocol)
            .with_byzantine_nodes(attackers)
            .with_behavior(attack_type.behavior())
            .with_duration(duration);
        self.execute_fault_injection_scenario(scenario).await
    }

    pub async fn get_byzantine_node_status(&self) -> Vec<Node> {
        self.cluster
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.is_byzantine())
            .collect()
    }

    pub async fn detect_byzantine_behavior(&self) -> DetectionReport {
        self.cluster.detect().await
    }

    pub async fn initialize_cluster(&self, node_count: usize, protocol: ProtocolKind) -> HarnessResult<()> {
        self.cluster.initialize(node_count, protocol, 0).await
    }

    pub async fn scenario_history(&self) -> Vec<ByzantineTestResult> {
        self.history.read().await.clone()
    }

    /// BFT report over the stored scenario results, last 24 hours by default
    pub async fn generate_bft_report(&self, range: Option<TimeRange>) -> BftReport {
        let history = self.history.read().await;
        ResilienceAggregator::generate_bft_report(&history, range)
    }
}

/// Percent by which the mean round time exceeds the baseline, never negative
fn latency_increase(average_ms: f64, baseline_ms: f64) -> f64 {
    if baseline_ms <= 0.0 {
        return 0.0;
    }
    ((average_ms - baseline_ms) / baseline_ms * 100.0).max(0.0)
}

fn recommendations(success: bool, resilience: &SystemResilience, byzantine_percentage: f64) -> Vec<String> {
    let mut recommendations = Vec::new();

    if !resilience.safety_maintained {
        recommendations.push(
            "Critical: safety was violated; review the protocol's Byzantine fault handling".to_string(),
        );
    }
    if byzantine_percentage > 33.0 {
        recommendations.push(format!(
            "Critical: Byzantine share of {:.1}% exceeds the one-third tolerance",
            byzantine_percentage
        ));
    }
    if !resilience.liveness_maintained {
        recommendations.push("Tune consensus timeouts and leader rotation to restore liveness".to_string());
    }
    if resilience.byzantine_detection_rate < 80.0 {
        recommendations.push("Strengthen Byzantine detection with extra evidence sources".to_string());
    }
    if success {
        recommendations.push("Resilience held; keep continuous monitoring in place".to_string());
    }

    recommendations
}
