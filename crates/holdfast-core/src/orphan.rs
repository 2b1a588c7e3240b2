//! Orphan detection.
//!
//! A node is orphaned when its network holds no base. The detector collects
//! the nodes touched by topology changes and, once the world is loaded,
//! re-evaluates each affected network exactly once per tick.

use std::collections::BTreeSet;

use slotmap::SecondaryMap;

use crate::graph::{ConnectionGraph, GraphChange};
use crate::id::NodeId;

/// Pending orphan work between ticks.
#[derive(Debug, Clone, Default)]
pub struct OrphanDetector {
    loaded: bool,
    full_scan_pending: bool,
    seeds: BTreeSet<NodeId>,
}

impl OrphanDetector {
    /// A detector that waits for [`mark_all_loaded`](Self::mark_all_loaded).
    pub fn loading() -> Self {
        Self::default()
    }

    /// A detector for a world that starts empty.
    pub fn loaded() -> Self {
        Self {
            loaded: true,
            full_scan_pending: true,
            seeds: BTreeSet::new(),
        }
    }

    /// Every node is in place; the next evaluation scans all networks.
    pub fn mark_all_loaded(&mut self) {
        self.loaded = true;
        self.full_scan_pending = true;
        self.seeds.clear();
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Queue the network of `node` for re-evaluation.
    pub fn touch(&mut self, node: NodeId) {
        if self.loaded && !self.full_scan_pending {
            self.seeds.insert(node);
        }
    }

    /// Queue both endpoints of a topology change.
    pub fn observe(&mut self, change: &GraphChange) {
        match *change {
            GraphChange::ConnectionAdded { source, target, .. }
            | GraphChange::ConnectionRemoved { source, target, .. } => {
                self.touch(source);
                self.touch(target);
            }
            GraphChange::WeightChanged { .. } => {}
        }
    }

    pub fn has_pending_work(&self) -> bool {
        self.loaded && (self.full_scan_pending || !self.seeds.is_empty())
    }

    /// Evaluate pending networks. Returns `(node, orphaned)` for every member
    /// of every evaluated network; seeds that no longer exist are skipped.
    pub fn evaluate(
        &mut self,
        graph: &ConnectionGraph,
        is_base: impl Fn(NodeId) -> bool,
    ) -> Vec<(NodeId, bool)> {
        if !self.loaded {
            return Vec::new();
        }

        let networks = if std::mem::take(&mut self.full_scan_pending) {
            self.seeds.clear();
            graph.networks()
        } else {
            let mut seen: SecondaryMap<NodeId, ()> = SecondaryMap::new();
            let mut networks = Vec::new();
            for seed in std::mem::take(&mut self.seeds) {
                if seen.contains_key(seed) || !graph.contains_node(seed) {
                    continue;
                }
                let network = graph.network(seed);
                for &member in &network {
                    seen.insert(member, ());
                }
                networks.push(network);
            }
            networks
        };

        let mut result = Vec::new();
        for network in networks {
            let orphaned = !network.iter().any(|&n| is_base(n));
            result.extend(network.into_iter().map(|n| (n, orphaned)));
        }
        result
    }
}
