//! Shared simulated cluster
//!
//! Wraps the consensus simulator in a tokio mutex and keeps the live fault conditions
//! beside it. Fault effects are recorded per fault id so that reverting one fault
//! never undoes another. Locks are always taken simulator first, conditions second,
//! and neither is held across a sleep.

use crate::faults::{FaultInjection, FaultPattern, FaultScope, FaultTarget, FaultType};
use crate::{HarnessConfig, HarnessError, HarnessResult};
use async_trait::async_trait;
use bftlab_sim::{
    utils, BehaviorType, ConsensusSimulator, ConsensusValidation, DetectionReport, Node, NodeId,
    NodeStatus, ProtocolKind, RoundConditions,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Effect a fault left on the cluster, kept for its revert
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FaultEffect {
    /// Round latency added by a network fault
    Latency { latency_ms: u64 },
    /// Nodes taken offline by a process fault
    Offline { nodes: Vec<NodeId> },
    /// Network partition applied to the simulator
    Partition {
        groups: Vec<Vec<NodeId>>,
        isolated: Vec<NodeId>,
    },
    /// Nodes compromised by a consensus fault
    Compromised { nodes: Vec<NodeId> },
    /// Resource pressure on cpu, memory or disk
    Resource { latency_ms: u64, error_rate: f64 },
}

/// Live fault conditions keyed by fault id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterConditions {
    pub effects: BTreeMap<String, FaultEffect>,
    /// Faults whose node-bound effect went away with a re-initialized cluster
    #[serde(default)]
    pub discarded: BTreeSet<String>,
}

impl ClusterConditions {
    pub fn extra_latency_ms(&self) -> u64 {
        self.effects
            .values()
            .map(|effect| match effect {
                FaultEffect::Latency { latency_ms } => *latency_ms,
                FaultEffect::Resource { latency_ms, .. } => *latency_ms,
                _ => 0,
            })
            .sum()
    }

    /// Combined error rate, capped at 1
    pub fn error_rate(&self) -> f64 {
        let total: f64 = self
            .effects
            .values()
            .map(|effect| match effect {
                FaultEffect::Resource { error_rate, .. } => *error_rate,
                _ => 0.0,
            })
            .sum();
        total.min(1.0)
    }

    /// Keep cluster-wide effects and discard those bound to the old node set
    fn retain_for_new_cluster(&mut self) {
        let bound: Vec<String> = self
            .effects
            .iter()
            .filter(|(_, effect)| {
                !matches!(effect, FaultEffect::Latency { .. } | FaultEffect::Resource { .. })
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in bound {
            self.effects.remove(&id);
            self.discarded.insert(id);
        }
    }

    fn partition_groups(&self) -> Vec<Vec<Vec<NodeId>>> {
        self.effects
            .values()
            .filter_map(|effect| match effect {
                FaultEffect::Partition { groups, .. } => Some(groups.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn round_conditions(&self) -> RoundConditions {
        RoundConditions::nominal().with_extra_latency(self.extra_latency_ms())
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

/// Point-in-time health of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterHealth {
    pub timestamp: DateTime<Utc>,
    pub total_nodes: usize,
    pub participating_nodes: usize,
    pub byzantine_nodes: usize,
    pub offline_nodes: usize,
    /// Health in [0, 100]
    pub health_score: f64,
    /// Expected round latency including fault latency
    pub latency_ms: u64,
    pub error_rate: f64,
    /// The protocol tolerates the current participant/Byzantine split
    pub consensus_capable: bool,
    pub active_effects: usize,
}

impl ClusterHealth {
    fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            total_nodes: 0,
            participating_nodes: 0,
            byzantine_nodes: 0,
            offline_nodes: 0,
            health_score: 0.0,
            latency_ms: 0,
            error_rate: 0.0,
            consensus_capable: false,
            active_effects: 0,
        }
    }
}

/// The simulator shared by experiments, scenarios and fault timers
pub struct SimulatedCluster {
    simulator: Mutex<ConsensusSimulator>,
    conditions: RwLock<ClusterConditions>,
    baseline_latency_ms: u64,
}

impl SimulatedCluster {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            simulator: Mutex::new(ConsensusSimulator::new(config.sim.clone())),
            conditions: RwLock::new(ClusterConditions::default()),
            baseline_latency_ms: config.baseline_latency_ms,
        }
    }

    /// Re-initialize the simulator. Latency and resource effects carry over to the new
    /// cluster; effects bound to the old nodes are discarded and their later revert is a no-op.
    pub async fn initialize(
        &self,
        node_count: usize,
        protocol: ProtocolKind,
        byzantine_count: usize,
    ) -> HarnessResult<()> {
        let mut sim = self.simulator.lock().await;
        sim.initialize_consensus(node_count, protocol, byzantine_count)?;
        self.conditions.write().await.retain_for_new_cluster();
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.simulator.lock().await.is_initialized()
    }

    pub async fn node_count(&self) -> usize {
        self.simulator.lock().await.node_store().len()
    }

    pub async fn protocol(&self) -> Option<ProtocolKind> {
        self.simulator.lock().await.protocol()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.simulator.lock().await.nodes()
    }

    pub async fn conditions(&self) -> ClusterConditions {
        self.conditions.read().await.clone()
    }

    /// Run `f` with exclusive access to the simulator
    pub async fn with_simulator<R>(&self, f: impl FnOnce(&mut ConsensusSimulator) -> R) -> R {
        let mut sim = self.simulator.lock().await;
        f(&mut sim)
    }

    /// One consensus round under the live fault conditions
    pub async fn execute_round(&self, proposed_value: &str) -> HarnessResult<ConsensusValidation> {
        let conditions = self.conditions.read().await.round_conditions();
        let mut sim = self.simulator.lock().await;
        Ok(sim.execute_round_with(proposed_value, &conditions)?)
    }

    pub async fn compromise(&self, ids: &[NodeId], behavior: BehaviorType) -> bool {
        self.simulator.lock().await.compromise_nodes(ids, behavior)
    }

    pub async fn restore(&self, ids: &[NodeId]) -> bool {
        self.simulator.lock().await.restore_nodes(ids)
    }

    pub async fn detect(&self) -> DetectionReport {
        self.simulator.lock().await.detect_byzantine_behavior()
    }

    pub async fn select_nodes(&self, count: usize) -> HarnessResult<Vec<NodeId>> {
        Ok(self.simulator.lock().await.select_nodes(count)?)
    }

    /// Health snapshot; zero health for an uninitialized cluster
    pub async fn health(&self) -> ClusterHealth {
        let (nodes, protocol) = {
            let sim = self.simulator.lock().await;
            (sim.nodes(), sim.protocol())
        };
        let conditions = self.conditions.read().await;

        let Some(protocol) = protocol else {
            return ClusterHealth::empty();
        };

        let total = nodes.len();
        let participating: Vec<&Node> = nodes.iter().filter(|n| n.consensus_participation).collect();
        let honest_participating = participating.iter().filter(|n| n.is_honest()).count();
        let byzantine_participating = participating.iter().filter(|n| n.is_byzantine()).count();

        let extra_latency_ms = conditions.extra_latency_ms();
        let error_rate = conditions.error_rate();

        // Availability less the error rate and a latency penalty of up to 50 points
        let availability = utils::percentage(honest_participating, total);
        let latency_penalty = (extra_latency_ms as f64 / self.baseline_latency_ms as f64 * 25.0).min(50.0);
        let health_score = (availability - error_rate * 100.0 - latency_penalty).clamp(0.0, 100.0);

        ClusterHealth {
            timestamp: Utc::now(),
            total_nodes: total,
            participating_nodes: participating.len(),
            byzantine_nodes: nodes.iter().filter(|n| n.is_byzantine()).count(),
            offline_nodes: nodes.iter().filter(|n| n.status == NodeStatus::Offline).count(),
            health_score,
            latency_ms: self.baseline_latency_ms + extra_latency_ms,
            error_rate,
            consensus_capable: protocol
                .strategy()
                .tolerates(participating.len(), byzantine_participating),
            active_effects: conditions.effects.len(),
        }
    }

    fn scope_nodes(scope: &FaultScope, sim: &ConsensusSimulator) -> Vec<NodeId> {
        match scope {
            FaultScope::Cluster => sim.node_store().ids(),
            FaultScope::Nodes(ids) => ids.clone(),
        }
    }
}

#[async_trait]
impl FaultTarget for SimulatedCluster {
    async fn apply(&self, fault: &FaultInjection) -> HarnessResult<()> {
        let params = &fault.parameters;

        let effect = {
            let mut sim = self.simulator.lock().await;
            if !sim.is_initialized() {
                return Err(HarnessError::Simulation(bftlab_sim::SimError::NotInitialized));
            }

            match fault.fault_type {
                FaultType::Network
                    if params.pattern == FaultPattern::Partition || !params.groups.is_empty() =>
                {
                    let partition = sim.simulate_network_partition(params.groups.clone())?;
                    FaultEffect::Partition {
                        groups: partition.groups,
                        isolated: partition.isolated,
                    }
                }
                FaultType::Network => {
                    let latency_ms = params
                        .latency_ms
                        .unwrap_or((params.intensity * self.baseline_latency_ms as f64) as u64);
                    FaultEffect::Latency { latency_ms }
                }
                FaultType::Process => {
                    let targets = Self::scope_nodes(&fault.target, &sim);
                    FaultEffect::Offline {
                        nodes: sim.fail_nodes(&targets),
                    }
                }
                FaultType::Consensus => {
                    let targets = Self::scope_nodes(&fault.target, &sim);
                    let behavior = params.behavior.unwrap_or(BehaviorType::Coordinated);
                    let honest: Vec<NodeId> = targets
                        .into_iter()
                        .filter(|id| sim.node_store().get(*id).is_some_and(|n| n.is_honest()))
                        .collect();
                    sim.compromise_nodes(&honest, behavior);
                    FaultEffect::Compromised { nodes: honest }
                }
                FaultType::Cpu | FaultType::Memory | FaultType::Disk => FaultEffect::Resource {
                    latency_ms: params
                        .latency_ms
                        .unwrap_or((params.intensity * self.baseline_latency_ms as f64 / 2.0) as u64),
                    error_rate: params.packet_loss.unwrap_or(params.intensity * 0.1),
                },
            }
        };

        debug!(fault = %fault.id, ?effect, "fault effect applied");
        let mut conditions = self.conditions.write().await;
        conditions.discarded.remove(&fault.id);
        conditions.effects.insert(fault.id.clone(), effect);
        Ok(())
    }

    async fn revert(&self, fault: &FaultInjection) -> HarnessResult<()> {
        let mut sim = self.simulator.lock().await;
        let mut conditions = self.conditions.write().await;
        let Some(effect) = conditions.effects.remove(&fault.id) else {
            if conditions.discarded.remove(&fault.id) {
                debug!(fault = %fault.id, "fault effect already discarded by re-initialization");
                return Ok(());
            }
            return Err(HarnessError::FaultNotFound(fault.id.clone()));
        };

        match &effect {
            FaultEffect::Partition { .. } => {
                sim.heal_network_partition()?;
                // Healing is cluster-wide; partitions still live are put back
                for groups in conditions.partition_groups() {
                    sim.simulate_network_partition(groups)?;
                }
            }
            FaultEffect::Offline { nodes } => {
                sim.recover_nodes(nodes);
            }
            FaultEffect::Compromised { nodes } => {
                sim.restore_nodes(nodes);
            }
            FaultEffect::Latency { .. } | FaultEffect::Resource { .. } => {}
        }

        info!(fault = %fault.id, "fault effect reverted");
        Ok(())
    }
}
