//! # Consensus Simulator
//!
//! Drives a [`NodeStore`] through consensus rounds under one protocol strategy. Each
//! round produces an immutable [`ConsensusValidation`] recording who took part, who was
//! Byzantine, what was finalized and whether safety or liveness was violated.
//!
//! ## State machine
//!
//! ```text
//! uninitialized --initialize_consensus--> configured --execute_*--> configured
//!                                             |  ^
//!                          simulate_network_partition / heal_network_partition
//! ```
//!
//! Re-initializing discards the node set, the history and any partition.

use crate::behavior::{BehaviorEngine, DetectionReport};
use crate::network::{self, NetworkPartition};
use crate::node_store::NodeStore;
use crate::protocol::{PhaseInterference, ProtocolKind, RoundContext};
use crate::{
    utils, BehaviorType, Node, NodeId, SimConfig, SimError, SimResult, SimRng, Verifiable,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Record of one executed round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusValidation {
    pub round: u64,
    pub timestamp: DateTime<Utc>,
    pub protocol: ProtocolKind,
    pub participating_nodes: Vec<NodeId>,
    /// Byzantine nodes among the participants
    pub byzantine_nodes: Vec<NodeId>,
    pub proposed_value: String,
    pub final_value: Option<String>,
    pub consensus_reached: bool,
    pub consensus_time_ms: u64,
    pub byzantine_detected: Vec<NodeId>,
    pub safety_violation: bool,
    pub liveness_violation: bool,
    /// Per-phase interference, PBFT only
    pub interference: Vec<PhaseInterference>,
}

/// Live fault conditions overlaid on a single round
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoundConditions {
    /// Added to the protocol's own latency
    pub extra_latency_ms: u64,
    /// Nodes excluded from this round only
    pub offline_nodes: Vec<NodeId>,
}

impl RoundConditions {
    pub fn nominal() -> Self {
        Self::default()
    }

    pub fn with_extra_latency(mut self, latency_ms: u64) -> Self {
        self.extra_latency_ms = latency_ms;
        self
    }

    pub fn with_offline(mut self, nodes: Vec<NodeId>) -> Self {
        self.offline_nodes = nodes;
        self
    }

    pub fn is_nominal(&self) -> bool {
        self.extra_latency_ms == 0 && self.offline_nodes.is_empty()
    }
}

/// Aggregates over the round history
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsensusStatistics {
    pub total_rounds: u64,
    pub successful_rounds: u64,
    /// Percent
    pub success_rate: f64,
    pub average_consensus_time_ms: f64,
    pub safety_violations: u64,
    pub liveness_violations: u64,
    /// Sum over rounds of Byzantine participants
    pub byzantine_appearances: u64,
    pub byzantine_detected: u64,
    /// Percent of appearances that were detected
    pub detection_rate: f64,
}

impl ConsensusStatistics {
    pub fn from_history(history: &[ConsensusValidation]) -> Self {
        if history.is_empty() {
            return Self::default();
        }

        let total = history.len();
        let successful = history.iter().filter(|v| v.consensus_reached).count();
        let appearances: usize = history.iter().map(|v| v.byzantine_nodes.len()).sum();
        let detected: usize = history.iter().map(|v| v.byzantine_detected.len()).sum();
        let total_time: u64 = history.iter().map(|v| v.consensus_time_ms).sum();

        Self {
            total_rounds: total as u64,
            successful_rounds: successful as u64,
            success_rate: utils::percentage(successful, total),
            average_consensus_time_ms: total_time as f64 / total as f64,
            safety_violations: history.iter().filter(|v| v.safety_violation).count() as u64,
            liveness_violations: history.iter().filter(|v| v.liveness_violation).count() as u64,
            byzantine_appearances: appearances as u64,
            byzantine_detected: detected as u64,
            detection_rate: utils::percentage(detected, appearances),
        }
    }
}

/// Round-by-round consensus simulation over a node store
#[derive(Debug, Clone)]
pub struct ConsensusSimulator {
    config: SimConfig,
    rng: SimRng,
    store: NodeStore,
    behavior: BehaviorEngine,
    protocol: Option<ProtocolKind>,
    round: u64,
    history: Vec<ConsensusValidation>,
    partition: Option<NetworkPartition>,
    next_partition_id: u32,
}

impl ConsensusSimulator {
    pub fn new(config: SimConfig) -> Self {
        Self {
            rng: SimRng::new(config.seed),
            behavior: BehaviorEngine::new(&config),
            config,
            store: NodeStore::new(),
            protocol: None,
            round: 0,
            history: Vec::new(),
            partition: None,
            next_partition_id: 1,
        }
    }

    /// Build a fresh cluster of `node_count` nodes, `byzantine_count` of them compromised
    /// at random with random malicious behaviors
    pub fn initialize_consensus(
        &mut self,
        node_count: usize,
        protocol: ProtocolKind,
        byzantine_count: usize,
    ) -> SimResult<()> {
        self.config.validate()?;
        if node_count == 0 {
            return Err(SimError::InvalidConfiguration(
                "Node count must be positive".to_string(),
            ));
        }
        if byzantine_count > node_count {
            return Err(SimError::InvalidConfiguration(format!(
                "Byzantine count {} exceeds node count {}",
                byzantine_count, node_count
            )));
        }

        let mut store = NodeStore::new();
        store.initialize(node_count)?;

        let byzantine = store.select_subset(byzantine_count, &mut self.rng)?;
        for id in &byzantine {
            let behavior = self
                .rng
                .pick(&BehaviorType::MALICIOUS)
                .copied()
                .unwrap_or(BehaviorType::Lying);
            self.behavior.compromise(&mut store, &[*id], behavior);
        }

        self.store = store;
        self.protocol = Some(protocol);
        self.round = 0;
        self.history.clear();
        self.partition = None;

        info!(node_count, byzantine_count, %protocol, "consensus initialized");
        Ok(())
    }

    /// Run one round with no fault conditions
    pub fn execute_consensus_round(&mut self, proposed_value: &str) -> SimResult<ConsensusValidation> {
        self.execute_round_with(proposed_value, &RoundConditions::nominal())
    }

    /// Run one round under `conditions`
    pub fn execute_round_with(
        &mut self,
        proposed_value: &str,
        conditions: &RoundConditions,
    ) -> SimResult<ConsensusValidation> {
        let protocol = self.protocol.ok_or(SimError::NotInitialized)?;

        let offline: HashSet<NodeId> = conditions.offline_nodes.iter().copied().collect();
        let mut participating: Vec<NodeId> = self
            .store
            .participating_ids()
            .into_iter()
            .filter(|id| !offline.contains(id))
            .collect();
        participating.sort_unstable();

        let byzantine: Vec<NodeId> = participating
            .iter()
            .copied()
            .filter(|id| self.store.get(*id).is_some_and(Node::is_byzantine))
            .collect();

        let ctx = RoundContext {
            participating: &participating,
            byzantine: &byzantine,
            proposed_value,
        };
        let decision = protocol.strategy().decide(&ctx, &mut self.rng);
        let consensus_time_ms = decision.latency_ms + conditions.extra_latency_ms;

        let detection_probability = self.config.detection_probability;
        let byzantine_detected: Vec<NodeId> = byzantine
            .iter()
            .copied()
            .filter(|_| self.rng.chance(detection_probability))
            .collect();

        self.round += 1;
        if self.config.record_round_actions {
            let context = format!("round {}", self.round);
            for id in &byzantine {
                self.behavior.record_action(&mut self.store, *id, &context);
            }
        }
        for id in &byzantine_detected {
            self.behavior.mark_detected(&mut self.store, *id);
        }

        let validation = ConsensusValidation {
            round: self.round,
            timestamp: Utc::now(),
            protocol,
            participating_nodes: participating,
            byzantine_nodes: byzantine,
            proposed_value: proposed_value.to_string(),
            final_value: decision.final_value,
            consensus_reached: decision.consensus_reached,
            consensus_time_ms,
            byzantine_detected,
            safety_violation: decision.tampered,
            liveness_violation: consensus_time_ms > protocol.timeout_ms(),
            interference: decision.interference,
        };

        if validation.safety_violation {
            warn!(round = self.round, %protocol, "byzantine coalition finalized a tampered value");
        }
        debug!(
            round = self.round,
            reached = validation.consensus_reached,
            time_ms = consensus_time_ms,
            byzantine = validation.byzantine_nodes.len(),
            "round executed"
        );

        self.history.push(validation.clone());
        Ok(validation)
    }

    /// Cut off every node outside the largest of `groups`
    pub fn simulate_network_partition(&mut self, groups: Vec<Vec<NodeId>>) -> SimResult<NetworkPartition> {
        self.ensure_initialized()?;

        let partition = NetworkPartition::apply(self.next_partition_id, groups, &mut self.store)?;
        self.next_partition_id += 1;
        self.partition = Some(partition.clone());
        Ok(partition)
    }

    /// Every honest node regains participation; returns the restored ids
    pub fn heal_network_partition(&mut self) -> SimResult<Vec<NodeId>> {
        self.ensure_initialized()?;

        let restored = match self.partition.take() {
            Some(mut partition) => partition.heal(&mut self.store),
            None => network::heal_all(&mut self.store),
        };
        Ok(restored)
    }

    pub fn get_consensus_statistics(&self) -> ConsensusStatistics {
        ConsensusStatistics::from_history(&self.history)
    }

    /// Compromise nodes through the behavior engine
    pub fn compromise_nodes(&mut self, ids: &[NodeId], behavior: BehaviorType) -> bool {
        self.behavior.compromise(&mut self.store, ids, behavior)
    }

    /// Restore nodes through the behavior engine
    pub fn restore_nodes(&mut self, ids: &[NodeId]) -> bool {
        self.behavior.restore(&mut self.store, ids)
    }

    pub fn detect_byzantine_behavior(&mut self) -> DetectionReport {
        self.behavior.detect(&mut self.store)
    }

    /// Take nodes offline until [`ConsensusSimulator::recover_nodes`]
    pub fn fail_nodes(&mut self, ids: &[NodeId]) -> Vec<NodeId> {
        self.store.mark_offline(ids)
    }

    pub fn recover_nodes(&mut self, ids: &[NodeId]) -> Vec<NodeId> {
        self.store.mark_online(ids)
    }

    /// Pseudo-random node ids drawn from the simulation's seeded source
    pub fn select_nodes(&mut self, count: usize) -> SimResult<Vec<NodeId>> {
        self.ensure_initialized()?;
        self.store.select_subset(count, &mut self.rng)
    }

    pub fn is_initialized(&self) -> bool {
        self.protocol.is_some()
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.protocol
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn history(&self) -> &[ConsensusValidation] {
        &self.history
    }

    pub fn partition(&self) -> Option<&NetworkPartition> {
        self.partition.as_ref()
    }

    /// Snapshot of every node sorted by id
    pub fn nodes(&self) -> Vec<Node> {
        self.store.snapshot()
    }

    pub fn node_store(&self) -> &NodeStore {
        &self.store
    }

    /// Seeded random source shared with callers that need reproducible noise
    pub fn rng(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    fn ensure_initialized(&self) -> SimResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(SimError::NotInitialized)
        }
    }
}

impl Default for ConsensusSimulator {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Verifiable for ConsensusSimulator {
    fn verify_safety(&self) -> SimResult<()> {
        match self.history.iter().find(|v| v.safety_violation) {
            Some(v) => Err(SimError::ProtocolViolation(format!(
                "Round {} finalized a tampered value",
                v.round
            ))),
            None => Ok(()),
        }
    }

    fn verify_liveness(&self) -> SimResult<()> {
        match self.history.iter().find(|v| v.liveness_violation) {
            Some(v) => Err(SimError::ProtocolViolation(format!(
                "Round {} took {} ms, above the {} timeout of {} ms",
                v.round,
                v.consensus_time_ms,
                v.protocol,
                v.protocol.timeout_ms()
            ))),
            None => Ok(()),
        }
    }

    fn verify_byzantine_resilience(&self) -> SimResult<()> {
        for v in &self.history {
            let strategy = v.protocol.strategy();
            if !strategy.tolerates(v.participating_nodes.len(), v.byzantine_nodes.len()) {
                return Err(SimError::ProtocolViolation(format!(
                    "Round {} had {} Byzantine of {} participants, beyond {} tolerance",
                    v.round,
                    v.byzantine_nodes.len(),
                    v.participating_nodes.len(),
                    v.protocol
                )));
            }
        }
        Ok(())
    }
}
