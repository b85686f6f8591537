//! # Network Partition Overlay
//!
//! Models partitions as an overlay on node participation rather than on message
//! delivery: only the largest group keeps taking part in consensus, every other known
//! node is cut off until the partition heals.
//!
//! ## Key Features
//!
//! - **Largest-group selection**: ties resolve to the group seen first
//! - **Lenient membership**: ids unknown to the store are ignored
//! - **Healing**: every honest node regains participation; Byzantine nodes are left as they are

use crate::node_store::NodeStore;
use crate::{NodeId, SimError, SimResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// An applied partition of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkPartition {
    /// Sequential partition identifier within one simulation
    pub id: u32,
    /// Groups as requested by the caller
    pub groups: Vec<Vec<NodeId>>,
    /// Nodes of the largest group, still participating
    pub majority: Vec<NodeId>,
    /// Known nodes cut off from consensus
    pub isolated: Vec<NodeId>,
    pub started_at: DateTime<Utc>,
    pub healed: bool,
}

impl NetworkPartition {
    /// Index of the largest group; the first one wins a tie
    pub fn largest_group(groups: &[Vec<NodeId>]) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, group) in groups.iter().enumerate() {
            let size = group.iter().collect::<HashSet<_>>().len();
            match best {
                Some((_, best_size)) if best_size >= size => {}
                _ => best = Some((index, size)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Split the cluster so only the largest group keeps participating
    pub fn apply(id: u32, groups: Vec<Vec<NodeId>>, store: &mut NodeStore) -> SimResult<Self> {
        let Some(majority_index) = Self::largest_group(&groups) else {
            return Err(SimError::InvalidConfiguration(
                "Partition requires at least one group".to_string(),
            ));
        };

        let majority: Vec<NodeId> = groups[majority_index]
            .iter()
            .copied()
            .filter(|id| store.contains(*id))
            .collect();
        let keep: HashSet<NodeId> = majority.iter().copied().collect();

        let isolated: Vec<NodeId> = store.ids().into_iter().filter(|id| !keep.contains(id)).collect();
        for node in &isolated {
            store.set_participation(*node, false);
        }

        info!(
            partition = id,
            groups = groups.len(),
            majority = majority.len(),
            isolated = isolated.len(),
            "network partition applied"
        );

        Ok(Self {
            id,
            groups,
            majority,
            isolated,
            started_at: Utc::now(),
            healed: false,
        })
    }

    /// Return every honest node to consensus
    pub fn heal(&mut self, store: &mut NodeStore) -> Vec<NodeId> {
        let restored: Vec<NodeId> = store.honest_ids();
        for id in &restored {
            store.set_participation(*id, true);
        }
        self.healed = true;

        info!(partition = self.id, restored = restored.len(), "network partition healed");
        restored
    }

    /// Whether `id` is cut off by this partition
    pub fn isolates(&self, id: NodeId) -> bool {
        !self.healed && self.isolated.contains(&id)
    }
}

/// Heal without a recorded partition: all honest nodes regain participation
pub fn heal_all(store: &mut NodeStore) -> Vec<NodeId> {
    let restored = store.honest_ids();
    for id in &restored {
        store.set_participation(*id, true);
    }
    restored
}
