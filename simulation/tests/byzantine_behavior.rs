//! Byzantine behavior, detection and partition recovery

use bftlab_sim::{
    BehaviorEngine, BehaviorType, ConsensusSimulator, NodeStatus, NodeStore, ProtocolKind,
    SimConfig, MAX_TRUST_SCORE, MIN_TRUST_SCORE,
};
use proptest::prelude::*;

fn behavior_strategy() -> impl Strategy<Value = BehaviorType> {
    prop::sample::select(BehaviorType::MALICIOUS.to_vec())
}

#[derive(Debug, Clone)]
enum Step {
    Compromise(u32, BehaviorType),
    Restore(u32),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u32..8, behavior_strategy()).prop_map(|(id, b)| Step::Compromise(id, b)),
        (0u32..8).prop_map(Step::Restore),
    ]
}

proptest! {
    #[test]
    fn prop_trust_stays_bounded(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let mut store = NodeStore::new();
        store.initialize(6).unwrap();
        let engine = BehaviorEngine::default();

        for step in steps {
            match step {
                Step::Compromise(id, behavior) => {
                    let before = store.get(id).map(|n| n.malicious_actions.len());
                    prop_assert!(engine.compromise(&mut store, &[id], behavior));
                    if let Some(before) = before {
                        let node = store.get(id).unwrap();
                        prop_assert_eq!(node.malicious_actions.len(), before + 1);
                        prop_assert_eq!(node.status, NodeStatus::Byzantine);
                    }
                }
                Step::Restore(id) => {
                    engine.restore(&mut store, &[id]);
                    if let Some(node) = store.get(id) {
                        prop_assert_eq!(node.behavior_type, BehaviorType::Honest);
                        prop_assert!(node.malicious_actions.iter().all(|a| a.mitigated));
                    }
                }
            }

            for node in store.all() {
                prop_assert!(node.trust_score >= MIN_TRUST_SCORE);
                prop_assert!(node.trust_score <= MAX_TRUST_SCORE);
                prop_assert_eq!(node.status == NodeStatus::Byzantine, node.behavior_type.is_malicious());
            }
        }

        let report = engine.detect(&mut store);
        prop_assert!((0.0..=100.0).contains(&report.detection_confidence));
    }
}

#[test]
fn test_detection_on_clean_cluster_is_zero() {
    let mut sim = ConsensusSimulator::default();
    sim.initialize_consensus(10, ProtocolKind::Pbft, 0).unwrap();
    let report = sim.detect_byzantine_behavior();
    assert!(report.suspicious_nodes.is_empty());
    assert_eq!(report.detection_confidence, 0.0);
}

#[test]
fn test_detection_marks_evidence() {
    let mut sim = ConsensusSimulator::default();
    sim.initialize_consensus(7, ProtocolKind::Pbft, 0).unwrap();
    sim.compromise_nodes(&[1, 5], BehaviorType::Equivocating);

    let report = sim.detect_byzantine_behavior();
    assert_eq!(report.suspicious_nodes, vec![1, 5]);
    assert_eq!(report.detection_confidence, 100.0);
    assert!(sim.nodes()[1].malicious_actions.iter().all(|a| a.detected));
}

#[test]
fn test_partition_then_heal_restores_all_honest_nodes() {
    let mut sim = ConsensusSimulator::default();
    sim.initialize_consensus(10, ProtocolKind::Pbft, 0).unwrap();
    sim.compromise_nodes(&[9], BehaviorType::Silent);

    let partition = sim
        .simulate_network_partition(vec![vec![0, 1, 2, 3, 4, 5], vec![6, 7, 8, 9]])
        .unwrap();
    assert_eq!(partition.isolated, vec![6, 7, 8, 9]);

    let round = sim.execute_consensus_round("during-partition").unwrap();
    assert_eq!(round.participating_nodes.len(), 6);
    assert!(round.byzantine_nodes.is_empty());

    sim.heal_network_partition().unwrap();
    for node in sim.nodes() {
        if node.status == NodeStatus::Honest {
            assert!(node.consensus_participation, "node {} not restored", node.node_id);
        }
    }
    // Byzantine participation is left as it was
    assert!(!sim.nodes()[9].consensus_participation);
}

#[test]
fn test_same_seed_same_rounds() {
    let run = |seed: u64| {
        let mut sim = ConsensusSimulator::new(SimConfig::default().with_seed(seed));
        sim.initialize_consensus(10, ProtocolKind::Pbft, 3).unwrap();
        (0..15)
            .map(|i| {
                let v = sim.execute_consensus_round(&format!("b{}", i)).unwrap();
                (
                    v.byzantine_nodes,
                    v.byzantine_detected,
                    v.consensus_time_ms,
                    v.interference,
                )
            })
            .collect::<Vec<_>>()
    };

    assert_eq!(run(1234), run(1234));
    assert_ne!(run(1234), run(4321));
}
