//! # Behavior Engine
//!
//! Turns nodes Byzantine and back, keeping the per-node malicious action trail that
//! detection scores are computed from. Unknown node ids are skipped silently by both
//! `compromise` and `restore`; callers rely on that leniency.

use crate::node_store::NodeStore;
use crate::{
    BehaviorType, MaliciousAction, Node, NodeId, NodeStatus, SimConfig, MAX_TRUST_SCORE,
    MIN_TRUST_SCORE,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Output of [`BehaviorEngine::detect`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionReport {
    /// Nodes flagged as Byzantine or untrusted
    pub suspicious_nodes: Vec<NodeId>,
    /// Confidence in [0, 100]
    pub detection_confidence: f64,
    /// Accumulated actions of the suspicious nodes
    pub evidence: Vec<(NodeId, MaliciousAction)>,
}

/// Compromise/restore/detect operations over a [`NodeStore`]
#[derive(Debug, Clone)]
pub struct BehaviorEngine {
    trust_penalty: f64,
    trust_recovery: f64,
}

impl BehaviorEngine {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            trust_penalty: config.trust_penalty,
            trust_recovery: config.trust_recovery,
        }
    }

    /// Make every known node in `ids` Byzantine with `behavior`, recording one action each.
    /// Returns false without touching the store when `behavior` is `Honest`.
    pub fn compromise(&self, store: &mut NodeStore, ids: &[NodeId], behavior: BehaviorType) -> bool {
        if !behavior.is_malicious() {
            return false;
        }

        let now = Utc::now();
        for id in ids {
            let Some(node) = store.get_mut(*id) else {
                continue;
            };

            node.status = NodeStatus::Byzantine;
            node.behavior_type = behavior;
            node.compromised_since = Some(now);
            node.trust_score = (node.trust_score - self.trust_penalty).max(MIN_TRUST_SCORE);
            node.malicious_actions.push(MaliciousAction::new(
                behavior,
                format!("Node {} compromised with {} behavior", id, behavior),
            ));

            debug!(node = id, %behavior, trust = node.trust_score, "node compromised");
        }

        info!(count = ids.len(), %behavior, "compromise applied");
        true
    }

    /// Return every known node in `ids` to honest operation, mitigating its action trail
    pub fn restore(&self, store: &mut NodeStore, ids: &[NodeId]) -> bool {
        for id in ids {
            let Some(node) = store.get_mut(*id) else {
                continue;
            };

            node.status = NodeStatus::Honest;
            node.behavior_type = BehaviorType::Honest;
            node.compromised_since = None;
            node.trust_score = (node.trust_score + self.trust_recovery).min(MAX_TRUST_SCORE);
            node.consensus_participation = true;
            node.last_seen = Utc::now();
            for action in node.malicious_actions.iter_mut() {
                action.mitigated = true;
            }

            debug!(node = id, trust = node.trust_score, "node restored");
        }

        info!(count = ids.len(), "restore applied");
        true
    }

    /// Append a further action for a node that stays Byzantine. No-op for honest or
    /// unknown nodes.
    pub fn record_action(&self, store: &mut NodeStore, id: NodeId, context: &str) -> bool {
        match store.get_mut(id) {
            Some(node) if node.is_byzantine() => {
                let behavior = node.behavior_type;
                node.malicious_actions.push(MaliciousAction::new(
                    behavior,
                    format!("Node {} {} during {}", id, behavior, context),
                ));
                true
            }
            _ => false,
        }
    }

    /// Mark the outstanding actions of `id` as detected
    pub fn mark_detected(&self, store: &mut NodeStore, id: NodeId) {
        if let Some(node) = store.get_mut(id) {
            for action in node.malicious_actions.iter_mut().filter(|a| !a.mitigated) {
                action.detected = true;
            }
        }
    }

    /// Flag Byzantine or low-trust nodes and score the evidence against them
    pub fn detect(&self, store: &mut NodeStore) -> DetectionReport {
        let suspicious_nodes: Vec<NodeId> = store
            .all()
            .filter(|n| Self::is_suspicious(n))
            .map(|n| n.node_id)
            .collect();

        let mut evidence = Vec::new();
        for id in &suspicious_nodes {
            self.mark_detected(store, *id);
            if let Some(node) = store.get(*id) {
                evidence.extend(node.malicious_actions.iter().cloned().map(|a| (*id, a)));
            }
        }

        let detection_confidence = Self::confidence(&evidence);

        DetectionReport {
            suspicious_nodes,
            detection_confidence,
            evidence,
        }
    }

    fn is_suspicious(node: &Node) -> bool {
        node.status == NodeStatus::Byzantine || node.trust_score < 50.0
    }

    /// `min(100, high_impact_fraction * 100 + evidence_count * 10)`, zero without evidence
    fn confidence(evidence: &[(NodeId, MaliciousAction)]) -> f64 {
        if evidence.is_empty() {
            return 0.0;
        }

        let high = evidence.iter().filter(|(_, a)| a.impact.is_high()).count();
        let fraction = high as f64 / evidence.len() as f64;
        (fraction * 100.0 + evidence.len() as f64 * 10.0).min(100.0)
    }
}

impl Default for BehaviorEngine {
    fn default() -> Self {
        Self::new(&SimConfig::default())
    }
}
