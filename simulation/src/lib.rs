//! # BFT Lab - Byzantine Consensus Simulation Engine
//!
//! This library simulates a cluster of consensus-participating nodes, lets callers
//! compromise and restore individual nodes with Byzantine behaviors, and drives the
//! cluster through consensus rounds under one of four protocol strategies.
//!
//! ## Architecture
//!
//! - **NodeStore**: owns every simulated node and its mutable state
//! - **BehaviorEngine**: compromise/restore/detect with an append-only malicious action trail
//! - **Protocols**: PBFT (n-1)/3, Raft majority + honest leader, PoS 2/3 stake, PoW honest hash majority
//! - **ConsensusSimulator**: per-round decision, detection, safety and liveness evaluation
//! - **Network**: partition overlay over node participation
//!
//! ## Usage
//!
//! ```rust
//! use bftlab_sim::{ConsensusSimulator, ProtocolKind, SimConfig};
//!
//! let mut sim = ConsensusSimulator::new(SimConfig::default().with_seed(7));
//! sim.initialize_consensus(4, ProtocolKind::Pbft, 1).unwrap();
//!
//! let round = sim.execute_consensus_round("block-1").unwrap();
//! assert!(round.consensus_reached);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod behavior;
pub mod consensus;
pub mod network;
pub mod node_store;
pub mod protocol;
pub mod rng;

pub use behavior::{BehaviorEngine, DetectionReport};
pub use consensus::{ConsensusSimulator, ConsensusStatistics, ConsensusValidation, RoundConditions};
pub use network::NetworkPartition;
pub use node_store::NodeStore;
pub use protocol::{
    ConsensusProtocol, Interference, PhaseInterference, ProtocolDecision, ProtocolKind,
    TAMPER_MARKER,
};
pub use rng::SimRng;

/// Node identifier, sequential from zero within one cluster
pub type NodeId = u32;

/// Trust score bounds
pub const MAX_TRUST_SCORE: f64 = 100.0;
pub const MIN_TRUST_SCORE: f64 = 0.0;
/// Port of node 0; node `i` listens on `BASE_PORT + i`
pub const BASE_PORT: u16 = 8000;

/// Regions used for round-robin distribution of nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    UsEast,
    UsWest,
    EuCentral,
    AsiaPacific,
    SouthAmerica,
}

impl Region {
    /// All regions in assignment order
    pub const ALL: [Region; 5] = [
        Region::UsEast,
        Region::UsWest,
        Region::EuCentral,
        Region::AsiaPacific,
        Region::SouthAmerica,
    ];

    /// Region for the node at `index` (round-robin)
    pub fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }
}

/// Node status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Honest,
    Byzantine,
    Offline,
}

/// Behavior a node exhibits; anything other than `Honest` makes the node Byzantine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorType {
    Honest,
    Lying,
    Equivocating,
    Delaying,
    Silent,
    Flooding,
    Coordinated,
}

impl BehaviorType {
    /// Behaviors a randomly compromised node may be assigned
    pub const MALICIOUS: [BehaviorType; 6] = [
        BehaviorType::Lying,
        BehaviorType::Equivocating,
        BehaviorType::Delaying,
        BehaviorType::Silent,
        BehaviorType::Flooding,
        BehaviorType::Coordinated,
    ];

    pub fn is_malicious(&self) -> bool {
        !matches!(self, BehaviorType::Honest)
    }

    /// Action type recorded when a node exhibits this behavior
    pub fn action_type(&self) -> ActionType {
        match self {
            BehaviorType::Lying => ActionType::FalseVote,
            BehaviorType::Equivocating => ActionType::DoubleSpend,
            BehaviorType::Delaying => ActionType::MessageDelay,
            BehaviorType::Silent => ActionType::MessageDrop,
            BehaviorType::Flooding => ActionType::FakeConsensus,
            _ => ActionType::DataCorruption,
        }
    }

    /// Impact of actions produced by this behavior
    pub fn impact(&self) -> Impact {
        match self {
            BehaviorType::Coordinated => Impact::Critical,
            BehaviorType::Lying | BehaviorType::Equivocating => Impact::High,
            BehaviorType::Delaying | BehaviorType::Flooding => Impact::Medium,
            _ => Impact::Low,
        }
    }
}

impl fmt::Display for BehaviorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BehaviorType::Honest => "honest",
            BehaviorType::Lying => "lying",
            BehaviorType::Equivocating => "equivocating",
            BehaviorType::Delaying => "delaying",
            BehaviorType::Silent => "silent",
            BehaviorType::Flooding => "flooding",
            BehaviorType::Coordinated => "coordinated",
        };
        write!(f, "{}", name)
    }
}

/// Kind of malicious action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FalseVote,
    DoubleSpend,
    MessageDelay,
    MessageDrop,
    FakeConsensus,
    DataCorruption,
}

/// Severity of a malicious action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
    Critical,
}

impl Impact {
    pub fn is_high(&self) -> bool {
        matches!(self, Impact::High | Impact::Critical)
    }
}

/// One entry in a node's audit trail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaliciousAction {
    pub action_id: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub impact: Impact,
    pub detected: bool,
    pub mitigated: bool,
    pub description: String,
}

impl MaliciousAction {
    /// Create an undetected, unmitigated action for `behavior`
    pub fn new(behavior: BehaviorType, description: String) -> Self {
        Self {
            action_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action_type: behavior.action_type(),
            impact: behavior.impact(),
            detected: false,
            mitigated: false,
            description,
        }
    }
}

/// Simulated cluster participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub region: Region,
    pub status: NodeStatus,
    pub behavior_type: BehaviorType,
    pub trust_score: f64,
    pub malicious_actions: Vec<MaliciousAction>,
    pub consensus_participation: bool,
    pub compromised_since: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// Create an honest node at position `index` of the cluster
    pub fn honest(index: usize) -> SimResult<Self> {
        let port = u16::try_from(index)
            .ok()
            .and_then(|offset| BASE_PORT.checked_add(offset))
            .ok_or_else(|| {
                SimError::InvalidConfiguration(format!(
                    "Node index {} has no port above {}",
                    index, BASE_PORT
                ))
            })?;

        Ok(Self {
            node_id: index as NodeId,
            address: format!("10.0.{}.{}", index / 250, index % 250 + 1),
            port,
            region: Region::for_index(index),
            status: NodeStatus::Honest,
            behavior_type: BehaviorType::Honest,
            trust_score: MAX_TRUST_SCORE,
            malicious_actions: Vec::new(),
            consensus_participation: true,
            compromised_since: None,
            last_seen: Utc::now(),
        })
    }

    pub fn is_byzantine(&self) -> bool {
        self.status == NodeStatus::Byzantine
    }

    pub fn is_honest(&self) -> bool {
        self.status == NodeStatus::Honest
    }

    /// Actions that have not been mitigated yet
    pub fn outstanding_actions(&self) -> impl Iterator<Item = &MaliciousAction> {
        self.malicious_actions.iter().filter(|a| !a.mitigated)
    }
}

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimConfig {
    /// Seed for the simulation's pseudo-random source
    pub seed: u64,

    /// Probability that a Byzantine node is flagged in a round
    pub detection_probability: f64,

    /// Trust removed when a node is compromised
    pub trust_penalty: f64,

    /// Trust restored when a node is restored
    pub trust_recovery: f64,

    /// Record a further malicious action for every Byzantine participant each round
    pub record_round_actions: bool,
}

impl SimConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            seed: 42,
            detection_probability: 0.7,
            trust_penalty: 50.0,
            trust_recovery: 25.0,
            record_round_actions: true,
        }
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the per-round detection probability
    pub fn with_detection_probability(mut self, probability: f64) -> Self {
        self.detection_probability = probability;
        self
    }

    /// Toggle per-round action recording
    pub fn with_round_actions(mut self, enabled: bool) -> Self {
        self.record_round_actions = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> SimResult<()> {
        if !(0.0..=1.0).contains(&self.detection_probability) {
            return Err(SimError::InvalidConfiguration(
                "Detection probability must be within [0, 1]".to_string(),
            ));
        }

        if self.trust_penalty < 0.0 || self.trust_recovery < 0.0 {
            return Err(SimError::InvalidConfiguration(
                "Trust adjustments must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Common error types for the simulation engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Round execution requested before `initialize_consensus`
    #[error("consensus simulation has not been initialized")]
    NotInitialized,
    /// Node id not present in the store
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    /// Simulation invariant broken
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// General error
    #[error("{0}")]
    Other(String),
}

impl From<String> for SimError {
    fn from(s: String) -> Self {
        SimError::Other(s)
    }
}

/// Result type for simulation operations
pub type SimResult<T> = Result<T, SimError>;

/// Components whose recorded history can be checked against the resilience properties
pub trait Verifiable {
    /// No round finalized a tampered value
    fn verify_safety(&self) -> SimResult<()>;

    /// Every round finished within the protocol timeout
    fn verify_liveness(&self) -> SimResult<()>;

    /// Byzantine participants never exceeded the protocol's tolerance
    fn verify_byzantine_resilience(&self) -> SimResult<()>;
}

/// Helpers shared by both crates
pub mod utils {
    /// Cluster sizes exercised by the default suites
    pub fn test_cluster_sizes() -> Vec<usize> {
        vec![4, 7, 10, 13]
    }

    /// Largest PBFT-tolerated Byzantine count for `n` participants
    pub fn pbft_tolerance(n: usize) -> usize {
        if n == 0 {
            0
        } else {
            (n - 1) / 3
        }
    }

    /// Percentage of `part` in `total`, zero for an empty total
    pub fn percentage(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64 * 100.0
        }
    }

    /// Serialize `Duration` as whole milliseconds
    pub mod duration_ms {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_u64(d.as_millis() as u64)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            Ok(Duration::from_millis(u64::deserialize(d)?))
        }
    }

    /// Serialize `Option<Duration>` as optional milliseconds
    pub mod option_duration_ms {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}
