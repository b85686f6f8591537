//! # Node Store
//!
//! Owns the simulated cluster. Nodes are created in bulk by [`NodeStore::initialize`],
//! mutated only through the methods here (directly or via the behavior engine and
//! partition overlay) and discarded when the store is re-initialized.

use crate::{Node, NodeId, NodeStatus, SimError, SimResult, SimRng};
use indexmap::IndexMap;
use tracing::debug;

/// The set of simulated nodes, in creation order
#[derive(Debug, Clone, Default)]
pub struct NodeStore {
    nodes: IndexMap<NodeId, Node>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the store to `total` honest nodes
    pub fn initialize(&mut self, total: usize) -> SimResult<()> {
        if total == 0 {
            return Err(SimError::InvalidConfiguration(
                "Total node count must be positive".to_string(),
            ));
        }

        // Build the whole set first so an unaddressable size leaves the store untouched
        let mut nodes = IndexMap::with_capacity(total);
        for index in 0..total {
            let node = Node::honest(index)?;
            nodes.insert(node.node_id, node);
        }
        self.nodes = nodes;

        debug!(total, "node store initialized");
        Ok(())
    }

    /// Pseudo-random subset of node ids, without replacement
    pub fn select_subset(&self, count: usize, rng: &mut SimRng) -> SimResult<Vec<NodeId>> {
        if count > self.nodes.len() {
            return Err(SimError::InvalidConfiguration(format!(
                "Cannot select {} nodes from a cluster of {}",
                count,
                self.nodes.len()
            )));
        }

        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        Ok(rng.sample(&ids, count))
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All nodes in creation order
    pub fn all(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn byzantine_ids(&self) -> Vec<NodeId> {
        self.filter_ids(|n| n.is_byzantine())
    }

    pub fn honest_ids(&self) -> Vec<NodeId> {
        self.filter_ids(|n| n.is_honest())
    }

    /// Nodes currently taking part in consensus
    pub fn participating_ids(&self) -> Vec<NodeId> {
        self.filter_ids(|n| n.consensus_participation)
    }

    /// Set participation for one node; returns false for an unknown id
    pub fn set_participation(&mut self, id: NodeId, participating: bool) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.consensus_participation = participating;
                true
            }
            None => false,
        }
    }

    /// Take nodes out of consensus. Honest nodes become `Offline`; Byzantine nodes keep
    /// their status. Unknown ids are skipped. Returns the ids that were affected.
    pub fn mark_offline(&mut self, ids: &[NodeId]) -> Vec<NodeId> {
        let mut affected = Vec::new();
        for id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.consensus_participation = false;
                if node.status == NodeStatus::Honest {
                    node.status = NodeStatus::Offline;
                }
                affected.push(*id);
            }
        }
        affected
    }

    /// Bring offline nodes back. Only `Offline` nodes change status; their participation
    /// is restored.
    pub fn mark_online(&mut self, ids: &[NodeId]) -> Vec<NodeId> {
        let mut affected = Vec::new();
        for id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                if node.status == NodeStatus::Offline {
                    node.status = NodeStatus::Honest;
                    node.consensus_participation = true;
                    node.last_seen = chrono::Utc::now();
                    affected.push(*id);
                }
            }
        }
        affected
    }

    /// Snapshot of every node, sorted by id
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    fn filter_ids(&self, predicate: impl Fn(&Node) -> bool) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| predicate(n))
            .map(|n| n.node_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BehaviorType, Region, MAX_TRUST_SCORE};

    #[test]
    fn test_initialize_creates_honest_nodes() {
        let mut store = NodeStore::new();
        store.initialize(7).unwrap();

        assert_eq!(store.len(), 7);
        for node in store.all() {
            assert_eq!(node.status, NodeStatus::Honest);
            assert_eq!(node.behavior_type, BehaviorType::Honest);
            assert_eq!(node.trust_score, MAX_TRUST_SCORE);
            assert!(node.consensus_participation);
        }
        assert_eq!(store.get(5).unwrap().region, Region::UsEast);
        assert_eq!(store.get(3).unwrap().port, 8003);
        assert_eq!(store.get(0).unwrap().address, "10.0.0.1");
    }

    #[test]
    fn test_initialize_rejects_zero() {
        let mut store = NodeStore::new();
        store.initialize(3).unwrap();
        assert!(matches!(store.initialize(0), Err(SimError::InvalidConfiguration(_))));
        // Failed initialization leaves the previous cluster untouched
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_initialize_rejects_unaddressable_size() {
        let mut store = NodeStore::new();
        store.initialize(4).unwrap();

        let too_many = (u16::MAX - crate::BASE_PORT) as usize + 2;
        assert!(matches!(
            store.initialize(too_many),
            Err(SimError::InvalidConfiguration(_))
        ));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_reinitialize_discards_nodes() {
        let mut store = NodeStore::new();
        store.initialize(10).unwrap();
        store.mark_offline(&[1, 2]);
        store.initialize(4).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.participating_ids().len(), 4);
    }

    #[test]
    fn test_select_subset() {
        let mut store = NodeStore::new();
        store.initialize(10).unwrap();
        let mut rng = SimRng::new(1);

        let subset = store.select_subset(4, &mut rng).unwrap();
        assert_eq!(subset.len(), 4);
        let mut dedup = subset.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 4);

        assert!(store.select_subset(11, &mut rng).is_err());
        assert_eq!(store.select_subset(10, &mut rng).unwrap().len(), 10);
    }

    #[test]
    fn test_offline_and_online() {
        let mut store = NodeStore::new();
        store.initialize(4).unwrap();

        let affected = store.mark_offline(&[1, 99]);
        assert_eq!(affected, vec![1]);
        assert_eq!(store.get(1).unwrap().status, NodeStatus::Offline);
        assert_eq!(store.participating_ids(), vec![0, 2, 3]);

        store.mark_online(&[1]);
        assert_eq!(store.get(1).unwrap().status, NodeStatus::Honest);
        assert_eq!(store.participating_ids().len(), 4);
    }
}
