use crate::fixed::Ticks;
use crate::id::{ConnectionId, NodeId};
use slotmap::SecondaryMap;
use std::collections::BTreeSet;

/// Tracks which nodes have unsaved changes and when each was last written.
///
/// The engine marks a node whenever its persisted state changes and, in
/// post-tick, asks for the nodes whose save interval has elapsed. Nodes
/// still inside their interval stay dirty for a later tick.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    dirty_nodes: BTreeSet<NodeId>,
    dirty_weights: BTreeSet<ConnectionId>,
    last_saved: SecondaryMap<NodeId, Ticks>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_node(&mut self, node: NodeId) {
        self.dirty_nodes.insert(node);
    }

    pub fn mark_weight(&mut self, connection: ConnectionId) {
        self.dirty_weights.insert(connection);
    }

    pub fn is_node_dirty(&self, node: NodeId) -> bool {
        self.dirty_nodes.contains(&node)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_nodes.is_empty() || !self.dirty_weights.is_empty()
    }

    pub fn dirty_nodes(&self) -> &BTreeSet<NodeId> {
        &self.dirty_nodes
    }

    /// Dirty nodes whose last save is at least `interval` ticks old (or that
    /// were never saved). They are removed from the dirty set; the caller
    /// must either save them or [`mark_node`](Self::mark_node) them again.
    pub fn take_due(&mut self, now: Ticks, interval: Ticks) -> Vec<NodeId> {
        let due: Vec<NodeId> = self
            .dirty_nodes
            .iter()
            .copied()
            .filter(|&node| match self.last_saved.get(node) {
                Some(&at) => now.saturating_sub(at) >= interval,
                None => true,
            })
            .collect();
        for node in &due {
            self.dirty_nodes.remove(node);
        }
        due
    }

    /// Take every dirty node regardless of interval (shutdown flush).
    pub fn take_all(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.dirty_nodes).into_iter().collect()
    }

    pub fn take_weights(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.dirty_weights).into_iter().collect()
    }

    pub fn record_saved(&mut self, node: NodeId, tick: Ticks) {
        self.last_saved.insert(node, tick);
    }

    /// Forget a removed node.
    pub fn purge(&mut self, node: NodeId) {
        self.dirty_nodes.remove(&node);
        self.last_saved.remove(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn make_node_ids(count: usize) -> Vec<NodeId> {
        let mut sm: SlotMap<NodeId, ()> = SlotMap::with_key();
        (0..count).map(|_| sm.insert(())).collect()
    }

    #[test]
    fn new_tracker_is_clean() {
        assert!(!DirtyTracker::new().is_dirty());
    }

    #[test]
    fn never_saved_node_is_due_immediately() {
        let ids = make_node_ids(1);
        let mut t = DirtyTracker::new();
        t.mark_node(ids[0]);
        assert_eq!(t.take_due(0, 60), vec![ids[0]]);
        assert!(!t.is_dirty());
    }

    #[test]
    fn save_interval_is_respected() {
        let ids = make_node_ids(2);
        let mut t = DirtyTracker::new();
        t.record_saved(ids[0], 100);
        t.mark_node(ids[0]);
        t.mark_node(ids[1]);

        assert_eq!(t.take_due(120, 60), vec![ids[1]]);
        assert!(t.is_node_dirty(ids[0]));
        assert_eq!(t.take_due(160, 60), vec![ids[0]]);
    }

    #[test]
    fn purge_forgets_node() {
        let ids = make_node_ids(1);
        let mut t = DirtyTracker::new();
        t.record_saved(ids[0], 5);
        t.mark_node(ids[0]);
        t.purge(ids[0]);
        assert!(!t.is_dirty());
        t.mark_node(ids[0]);
        assert_eq!(t.take_due(6, 60), vec![ids[0]]);
    }
}
