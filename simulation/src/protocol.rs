//! # Consensus Protocol Strategies
//!
//! Each protocol decides a single round from the set of participating nodes and the
//! Byzantine subset among them. The strategies reproduce the tolerance arithmetic of the
//! real protocols, not their message formats:
//!
//! - **PBFT**: Byzantine count ≤ ⌊(n−1)/3⌋, three phases each open to interference
//! - **Raft**: honest count ≥ ⌊n/2⌋+1 and an honest leader
//! - **PoS**: honest stake ≥ 2/3 of total stake (100 stake per node)
//! - **PoW**: honest hash power strictly above Byzantine hash power (100 per node)
//!
//! When a Byzantine coalition exceeds what a protocol tolerates it finalizes a value
//! carrying [`TAMPER_MARKER`], which the simulator reports as a safety violation.

use crate::{NodeId, SimRng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix carried by values finalized under Byzantine control
pub const TAMPER_MARKER: &str = "BYZANTINE_TAMPERED:";

/// Stake/hash power assigned to every node by the PoS and PoW strategies
pub const UNIT_WEIGHT: u64 = 100;

/// Supported protocols
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Pbft,
    Raft,
    Pos,
    Pow,
}

impl ProtocolKind {
    /// Round time above which a round counts as a liveness violation
    pub fn timeout_ms(&self) -> u64 {
        match self {
            ProtocolKind::Pbft => 5_000,
            ProtocolKind::Raft => 3_000,
            ProtocolKind::Pos => 10_000,
            ProtocolKind::Pow => 60_000,
        }
    }

    /// Largest Byzantine share (percent) the protocol is designed to tolerate
    pub fn theoretical_tolerance(&self) -> f64 {
        match self {
            ProtocolKind::Pbft | ProtocolKind::Pos => 100.0 / 3.0,
            ProtocolKind::Raft => 0.0,
            ProtocolKind::Pow => 50.0,
        }
    }

    /// Strategy implementing this protocol
    pub fn strategy(&self) -> Box<dyn ConsensusProtocol> {
        match self {
            ProtocolKind::Pbft => Box::new(Pbft),
            ProtocolKind::Raft => Box::new(Raft),
            ProtocolKind::Pos => Box::new(ProofOfStake),
            ProtocolKind::Pow => Box::new(ProofOfWork),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Pbft => "PBFT",
            ProtocolKind::Raft => "Raft",
            ProtocolKind::Pos => "PoS",
            ProtocolKind::Pow => "PoW",
        };
        write!(f, "{}", name)
    }
}

/// Byzantine interference applied to one PBFT phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Interference {
    Equivocate,
    Delay,
    FalseValue,
    Silent,
}

impl Interference {
    /// Draw with relative weights 30/30/20/20
    pub fn draw(rng: &mut SimRng) -> Self {
        let roll = rng.unit();
        if roll < 0.3 {
            Interference::Equivocate
        } else if roll < 0.6 {
            Interference::Delay
        } else if roll < 0.8 {
            Interference::FalseValue
        } else {
            Interference::Silent
        }
    }

    /// Extra phase latency caused by this interference
    fn added_delay_ms(&self, rng: &mut SimRng) -> u64 {
        match self {
            Interference::Equivocate => rng.between(100, 300),
            Interference::Delay => rng.between(200, 800),
            Interference::FalseValue => rng.between(50, 150),
            Interference::Silent => 0,
        }
    }
}

/// Interference recorded for one phase of a round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseInterference {
    pub phase: String,
    pub interference: Interference,
    pub added_delay_ms: u64,
}

/// Inputs to a protocol decision
#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    /// Participating nodes in ascending id order
    pub participating: &'a [NodeId],
    /// Byzantine nodes among the participants
    pub byzantine: &'a [NodeId],
    pub proposed_value: &'a str,
}

impl RoundContext<'_> {
    pub fn participant_count(&self) -> usize {
        self.participating.len()
    }

    pub fn byzantine_count(&self) -> usize {
        self.byzantine.len()
    }

    pub fn honest_count(&self) -> usize {
        self.participating.len().saturating_sub(self.byzantine.len())
    }

    fn tampered_value(&self) -> String {
        format!("{}{}", TAMPER_MARKER, self.proposed_value)
    }
}

/// Outcome of one protocol round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolDecision {
    pub consensus_reached: bool,
    pub final_value: Option<String>,
    /// Simulated elapsed time, before fault-induced latency
    pub latency_ms: u64,
    /// Set when a Byzantine coalition finalized a tampered value
    pub tampered: bool,
    pub interference: Vec<PhaseInterference>,
}

impl ProtocolDecision {
    fn agreed(value: &str, latency_ms: u64) -> Self {
        Self {
            consensus_reached: true,
            final_value: Some(value.to_string()),
            latency_ms,
            tampered: false,
            interference: Vec::new(),
        }
    }

    fn stalled(latency_ms: u64) -> Self {
        Self {
            consensus_reached: false,
            final_value: None,
            latency_ms,
            tampered: false,
            interference: Vec::new(),
        }
    }

    fn hijacked(ctx: &RoundContext<'_>, latency_ms: u64) -> Self {
        Self {
            consensus_reached: false,
            final_value: Some(ctx.tampered_value()),
            latency_ms,
            tampered: true,
            interference: Vec::new(),
        }
    }
}

/// A consensus protocol's decision function
pub trait ConsensusProtocol: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    fn timeout_ms(&self) -> u64 {
        self.kind().timeout_ms()
    }

    /// Whether the given participant/Byzantine split is within tolerance
    fn tolerates(&self, participants: usize, byzantine: usize) -> bool;

    /// Decide one round
    fn decide(&self, ctx: &RoundContext<'_>, rng: &mut SimRng) -> ProtocolDecision;
}

/// Practical Byzantine Fault Tolerance
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbft;

impl Pbft {
    pub const PHASES: [&'static str; 3] = ["pre-prepare", "prepare", "commit"];
}

impl ConsensusProtocol for Pbft {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Pbft
    }

    fn tolerates(&self, participants: usize, byzantine: usize) -> bool {
        participants >= 1 && byzantine <= (participants - 1) / 3
    }

    fn decide(&self, ctx: &RoundContext<'_>, rng: &mut SimRng) -> ProtocolDecision {
        let mut latency_ms = 0;
        let mut interference = Vec::new();

        for phase in Self::PHASES {
            latency_ms += rng.between(50, 150);
            if ctx.byzantine_count() > 0 {
                let kind = Interference::draw(rng);
                let added_delay_ms = kind.added_delay_ms(rng);
                latency_ms += added_delay_ms;
                interference.push(PhaseInterference {
                    phase: phase.to_string(),
                    interference: kind,
                    added_delay_ms,
                });
            }
        }

        let mut decision = if self.tolerates(ctx.participant_count(), ctx.byzantine_count()) {
            ProtocolDecision::agreed(ctx.proposed_value, latency_ms)
        } else if ctx.participant_count() == 0 {
            ProtocolDecision::stalled(latency_ms)
        } else {
            ProtocolDecision::hijacked(ctx, latency_ms)
        };
        decision.interference = interference;
        decision
    }
}

/// Raft with a leader taken as the lowest participating id
#[derive(Debug, Clone, Copy, Default)]
pub struct Raft;

impl Raft {
    pub fn majority(participants: usize) -> usize {
        participants / 2 + 1
    }
}

impl ConsensusProtocol for Raft {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Raft
    }

    fn tolerates(&self, participants: usize, byzantine: usize) -> bool {
        participants >= 1 && participants.saturating_sub(byzantine) >= Self::majority(participants)
    }

    fn decide(&self, ctx: &RoundContext<'_>, rng: &mut SimRng) -> ProtocolDecision {
        let latency_ms = rng.between(150, 300) + rng.between(50, 150);

        let leader = ctx.participating.first();
        if leader.is_some_and(|l| ctx.byzantine.contains(l)) {
            return ProtocolDecision::hijacked(ctx, latency_ms);
        }

        if self.tolerates(ctx.participant_count(), ctx.byzantine_count()) {
            ProtocolDecision::agreed(ctx.proposed_value, latency_ms)
        } else {
            ProtocolDecision::stalled(latency_ms)
        }
    }
}

/// Proof of Stake with flat stake
#[derive(Debug, Clone, Copy, Default)]
pub struct ProofOfStake;

impl ConsensusProtocol for ProofOfStake {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Pos
    }

    fn tolerates(&self, participants: usize, byzantine: usize) -> bool {
        let total = participants as u64 * UNIT_WEIGHT;
        let honest = participants.saturating_sub(byzantine) as u64 * UNIT_WEIGHT;
        participants >= 1 && 3 * honest >= 2 * total
    }

    fn decide(&self, ctx: &RoundContext<'_>, rng: &mut SimRng) -> ProtocolDecision {
        let latency_ms = rng.between(200, 1_000);

        if self.tolerates(ctx.participant_count(), ctx.byzantine_count()) {
            ProtocolDecision::agreed(ctx.proposed_value, latency_ms)
        } else if ctx.participant_count() == 0 {
            ProtocolDecision::stalled(latency_ms)
        } else {
            ProtocolDecision::hijacked(ctx, latency_ms)
        }
    }
}

/// Proof of Work with flat hash power
#[derive(Debug, Clone, Copy, Default)]
pub struct ProofOfWork;

impl ConsensusProtocol for ProofOfWork {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Pow
    }

    fn tolerates(&self, participants: usize, byzantine: usize) -> bool {
        let honest = participants.saturating_sub(byzantine) as u64 * UNIT_WEIGHT;
        honest > byzantine as u64 * UNIT_WEIGHT
    }

    fn decide(&self, ctx: &RoundContext<'_>, rng: &mut SimRng) -> ProtocolDecision {
        // Mining dominates the round; propagation is comparatively small
        let latency_ms = rng.between(5_000, 15_000) + rng.between(100, 500);

        if self.tolerates(ctx.participant_count(), ctx.byzantine_count()) {
            ProtocolDecision::agreed(ctx.proposed_value, latency_ms)
        } else if ctx.participant_count() == 0 {
            ProtocolDecision::stalled(latency_ms)
        } else {
            ProtocolDecision::hijacked(ctx, latency_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(participating: &'a [NodeId], byzantine: &'a [NodeId]) -> RoundContext<'a> {
        RoundContext {
            participating,
            byzantine,
            proposed_value: "v1",
        }
    }

    #[test]
    fn test_pbft_threshold() {
        let pbft = Pbft;
        assert!(pbft.tolerates(4, 1));
        assert!(!pbft.tolerates(4, 2));
        assert!(pbft.tolerates(7, 2));
        assert!(!pbft.tolerates(7, 3));
        assert!(pbft.tolerates(10, 3));
        assert!(!pbft.tolerates(0, 0));
    }

    #[test]
    fn test_pbft_interference_only_with_byzantine() {
        let mut rng = SimRng::new(1);
        let nodes = [0, 1, 2, 3];

        let clean = Pbft.decide(&ctx(&nodes, &[]), &mut rng);
        assert!(clean.interference.is_empty());
        assert!(clean.latency_ms >= 150 && clean.latency_ms <= 450);

        let attacked = Pbft.decide(&ctx(&nodes, &[3]), &mut rng);
        assert_eq!(attacked.interference.len(), 3);
        assert!(attacked.consensus_reached);
        assert_eq!(attacked.final_value.as_deref(), Some("v1"));
    }

    #[test]
    fn test_pbft_hijacked_beyond_tolerance() {
        let mut rng = SimRng::new(2);
        let decision = Pbft.decide(&ctx(&[0, 1, 2, 3], &[2, 3]), &mut rng);
        assert!(!decision.consensus_reached);
        assert!(decision.tampered);
        assert!(decision.final_value.unwrap().starts_with(TAMPER_MARKER));
    }

    #[test]
    fn test_interference_distribution() {
        let mut rng = SimRng::new(99);
        let mut counts = [0usize; 4];
        for _ in 0..10_000 {
            match Interference::draw(&mut rng) {
                Interference::Equivocate => counts[0] += 1,
                Interference::Delay => counts[1] += 1,
                Interference::FalseValue => counts[2] += 1,
                Interference::Silent => counts[3] += 1,
            }
        }
        assert!((2_700..3_300).contains(&counts[0]));
        assert!((2_700..3_300).contains(&counts[1]));
        assert!((1_700..2_300).contains(&counts[2]));
        assert!((1_700..2_300).contains(&counts[3]));
    }

    #[test]
    fn test_raft_byzantine_leader_fails_round() {
        let mut rng = SimRng::new(3);
        let decision = Raft.decide(&ctx(&[0, 1, 2, 3, 4], &[0]), &mut rng);
        assert!(!decision.consensus_reached);
        assert!(decision.tampered);

        let decision = Raft.decide(&ctx(&[0, 1, 2, 3, 4], &[4]), &mut rng);
        assert!(decision.consensus_reached);
    }

    #[test]
    fn test_raft_majority() {
        assert_eq!(Raft::majority(5), 3);
        assert_eq!(Raft::majority(4), 3);
        assert!(Raft.tolerates(5, 2));
        assert!(!Raft.tolerates(4, 2));

        let mut rng = SimRng::new(4);
        let decision = Raft.decide(&ctx(&[0, 1, 2, 3], &[2, 3]), &mut rng);
        assert!(!decision.consensus_reached);
        assert!(!decision.tampered);
        assert!(decision.final_value.is_none());
    }

    #[test]
    fn test_pos_two_thirds_stake() {
        assert!(ProofOfStake.tolerates(3, 1));
        assert!(!ProofOfStake.tolerates(4, 2));
        assert!(ProofOfStake.tolerates(6, 2));
        assert!(!ProofOfStake.tolerates(6, 3));
    }

    #[test]
    fn test_pow_strict_majority_and_latency() {
        assert!(ProofOfWork.tolerates(5, 2));
        assert!(!ProofOfWork.tolerates(4, 2));

        let mut rng = SimRng::new(5);
        let decision = ProofOfWork.decide(&ctx(&[0, 1, 2], &[]), &mut rng);
        assert!(decision.latency_ms >= 5_100);
        assert!(decision.latency_ms < ProtocolKind::Pow.timeout_ms());
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(ProtocolKind::Pbft.timeout_ms(), 5_000);
        assert_eq!(ProtocolKind::Raft.timeout_ms(), 3_000);
        assert_eq!(ProtocolKind::Pos.timeout_ms(), 10_000);
        assert_eq!(ProtocolKind::Pow.timeout_ms(), 60_000);
    }
}
