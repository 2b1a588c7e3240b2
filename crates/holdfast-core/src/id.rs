use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a node (player-constructed structure) in the connection graph.
    pub struct NodeId;

    /// Identifies a connection (weighted edge) between two nodes.
    pub struct ConnectionId;
}

/// Identifies a node type in the registry. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeTypeId(pub u32);

/// Identifies the faction or corporation owning a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

/// Identifies the zone (world shard) a node lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

/// Identifies an item definition handed to the loot factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemTypeId(pub u32);

/// Stable numeric form of a [`NodeId`], used as the persistence key.
pub fn node_key(node: NodeId) -> u64 {
    use slotmap::Key;
    node.data().as_ffi()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn node_type_id_equality() {
        assert_eq!(NodeTypeId(0), NodeTypeId(0));
        assert_ne!(NodeTypeId(0), NodeTypeId(1));
    }

    #[test]
    fn ids_are_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(OwnerId(7), "red");
        map.insert(OwnerId(8), "blue");
        assert_eq!(map[&OwnerId(7)], "red");
    }

    #[test]
    fn node_key_is_distinct_per_node() {
        let mut sm = SlotMap::<NodeId, ()>::with_key();
        let a = sm.insert(());
        let b = sm.insert(());
        assert_ne!(node_key(a), node_key(b));
        assert_eq!(node_key(a), node_key(a));
    }
}
