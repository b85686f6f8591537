//! Consensus threshold properties for every protocol strategy
//!
//! Exercises the simulator end to end: initialization, rounds with and without
//! Byzantine participants, and the tolerance arithmetic of PBFT, Raft, PoS and PoW.

use bftlab_sim::{
    utils, ConsensusSimulator, NodeStatus, ProtocolKind, SimConfig, SimError, Verifiable,
    MAX_TRUST_SCORE, TAMPER_MARKER,
};
use proptest::prelude::*;

fn simulator(seed: u64) -> ConsensusSimulator {
    ConsensusSimulator::new(SimConfig::default().with_seed(seed))
}

#[test]
fn test_initialize_creates_honest_cluster() {
    for n in utils::test_cluster_sizes() {
        let mut sim = simulator(1);
        sim.initialize_consensus(n, ProtocolKind::Pbft, 0).unwrap();

        let nodes = sim.nodes();
        assert_eq!(nodes.len(), n);
        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(node.node_id as usize, i);
            assert_eq!(node.status, NodeStatus::Honest);
            assert_eq!(node.trust_score, MAX_TRUST_SCORE);
            assert!(node.consensus_participation);
        }
    }
}

#[test]
fn test_invalid_initialization() {
    let mut sim = simulator(1);
    assert!(matches!(
        sim.initialize_consensus(0, ProtocolKind::Raft, 0),
        Err(SimError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        sim.initialize_consensus(4, ProtocolKind::Raft, 5),
        Err(SimError::InvalidConfiguration(_))
    ));
    assert!(!sim.is_initialized());
}

#[test]
fn test_pbft_four_nodes() {
    let mut sim = simulator(3);
    sim.initialize_consensus(4, ProtocolKind::Pbft, 1).unwrap();
    let round = sim.execute_consensus_round("tx-batch").unwrap();
    assert!(round.consensus_reached);
    assert!(!round.safety_violation);

    sim.initialize_consensus(4, ProtocolKind::Pbft, 2).unwrap();
    let round = sim.execute_consensus_round("tx-batch").unwrap();
    assert!(!round.consensus_reached);
    assert!(round.safety_violation);
    assert_eq!(round.final_value.as_deref(), Some("BYZANTINE_TAMPERED:tx-batch"));
}

#[test]
fn test_raft_outcomes_depend_on_leader() {
    let mut sim = simulator(5);
    sim.initialize_consensus(5, ProtocolKind::Raft, 0).unwrap();

    sim.compromise_nodes(&[4], bftlab_sim::BehaviorType::Silent);
    let round = sim.execute_consensus_round("entry").unwrap();
    assert!(round.consensus_reached);

    sim.compromise_nodes(&[0], bftlab_sim::BehaviorType::Lying);
    let round = sim.execute_consensus_round("entry").unwrap();
    assert!(!round.consensus_reached);
    assert!(round.safety_violation);
}

#[test]
fn test_raft_without_majority_stalls_safely() {
    let mut sim = simulator(5);
    sim.initialize_consensus(4, ProtocolKind::Raft, 0).unwrap();
    sim.compromise_nodes(&[2, 3], bftlab_sim::BehaviorType::Delaying);

    let round = sim.execute_consensus_round("entry").unwrap();
    assert!(!round.consensus_reached);
    assert!(!round.safety_violation);
    assert!(round.final_value.is_none());
}

#[test]
fn test_pos_and_pow_thresholds() {
    let mut sim = simulator(8);
    sim.initialize_consensus(6, ProtocolKind::Pos, 2).unwrap();
    assert!(sim.execute_consensus_round("epoch").unwrap().consensus_reached);

    sim.initialize_consensus(6, ProtocolKind::Pos, 3).unwrap();
    let round = sim.execute_consensus_round("epoch").unwrap();
    assert!(!round.consensus_reached);
    assert!(round.final_value.unwrap().starts_with(TAMPER_MARKER));

    sim.initialize_consensus(5, ProtocolKind::Pow, 2).unwrap();
    let round = sim.execute_consensus_round("block").unwrap();
    assert!(round.consensus_reached);
    assert!(!round.liveness_violation);

    sim.initialize_consensus(4, ProtocolKind::Pow, 2).unwrap();
    assert!(sim.execute_consensus_round("block").unwrap().safety_violation);
}

#[test]
fn test_verifiable_over_clean_history() {
    let mut sim = simulator(21);
    sim.initialize_consensus(7, ProtocolKind::Pbft, 2).unwrap();
    for i in 0..10 {
        sim.execute_consensus_round(&format!("block-{}", i)).unwrap();
    }
    assert!(sim.verify_safety().is_ok());
    assert!(sim.verify_liveness().is_ok());
    assert!(sim.verify_byzantine_resilience().is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pbft_reached_iff_tolerated(n in 1usize..=20, b_frac in 0.0f64..=1.0, seed in any::<u64>()) {
        let b = ((n as f64) * b_frac).floor() as usize;
        let mut sim = simulator(seed);
        sim.initialize_consensus(n, ProtocolKind::Pbft, b).unwrap();

        let round = sim.execute_consensus_round("value").unwrap();
        let tolerated = b <= utils::pbft_tolerance(n);
        prop_assert_eq!(round.consensus_reached, tolerated);
        prop_assert_eq!(round.safety_violation, !tolerated);
        prop_assert!(round.byzantine_nodes.len() <= round.participating_nodes.len());
    }

    #[test]
    fn prop_detected_nodes_are_byzantine(n in 1usize..=15, seed in any::<u64>()) {
        let mut sim = simulator(seed);
        sim.initialize_consensus(n, ProtocolKind::Pos, n / 2).unwrap();
        let round = sim.execute_consensus_round("value").unwrap();
        for id in &round.byzantine_detected {
            prop_assert!(round.byzantine_nodes.contains(id));
        }
    }
}
