//! World snapshots.
//!
//! A snapshot carries the topology and node identities (type, owner, zone,
//! position) plus the tick counter and RNG state, encoded via `bitcode`
//! behind a versioned header. Mutable per-node state lives in the
//! persistence gateway and is read back property by property on restore.
//!
//! Call [`Engine::flush`] before [`Engine::save_snapshot`] so the gateway
//! holds the latest node state.

use serde::{Deserialize, Serialize};

use crate::collab::Collaborators;
use crate::engine::Engine;
use crate::fixed::Fixed64;
use crate::graph::{ConnectionGraph, GraphError};
use crate::id::{NodeId, NodeTypeId, OwnerId, ZoneId};
use crate::node::Position;
use crate::orphan::OrphanDetector;
use crate::persist::{NodeRecord, PropertyKey, PropertyValue};
use crate::registry::Registry;
use crate::rng::SimRng;
use crate::sim::SimState;
use crate::tuning::Tuning;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a world snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0x4F1D_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Tick count at the time the snapshot was taken.
    pub tick: u64,
}

impl SnapshotHeader {
    pub fn new(tick: u64) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            tick,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Decode a snapshot and return only its header.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: WorldSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What never changes after deployment (owner aside, which the gateway
/// does not track).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeIdentity {
    node_type: NodeTypeId,
    owner: OwnerId,
    zone: ZoneId,
    position: Position,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorldSnapshot {
    header: SnapshotHeader,
    graph: ConnectionGraph,
    nodes: Vec<(NodeId, NodeIdentity)>,
    sim_state: SimState,
    rng: SimRng,
}

impl Engine {
    /// Encode topology and node identities.
    pub fn save_snapshot(&self) -> Result<Vec<u8>, SerializeError> {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, node)| {
                (
                    id,
                    NodeIdentity {
                        node_type: node.node_type,
                        owner: node.owner,
                        zone: node.zone,
                        position: node.position,
                    },
                )
            })
            .collect();
        let snapshot = WorldSnapshot {
            header: SnapshotHeader::new(self.sim_state.tick),
            graph: self.graph.clone(),
            nodes,
            sim_state: self.sim_state.clone(),
            rng: self.rng.clone(),
        };
        bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Rebuild an engine from a snapshot and the gateway's node records.
    ///
    /// A node whose record fails to load keeps default state and an error is
    /// logged. Nodes that were mid-deconstruction finish it now. Orphan
    /// detection stays paused until [`Engine::mark_all_loaded`]; the event
    /// bus starts empty.
    pub fn from_snapshot(
        data: &[u8],
        registry: Registry,
        tuning: Tuning,
        collab: Collaborators,
    ) -> Result<Self, DeserializeError> {
        let snapshot: WorldSnapshot =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        snapshot.header.validate()?;

        let mut engine = Engine::with_detector(registry, tuning, collab, OrphanDetector::loading());
        engine.graph = snapshot.graph;
        engine.sim_state = snapshot.sim_state;
        engine.rng = snapshot.rng;

        let gateway = std::sync::Arc::clone(&engine.collab.gateway);
        for (id, identity) in snapshot.nodes {
            if !engine.graph.contains_node(id) {
                tracing::warn!(node = ?id, "snapshot node missing from graph, skipped");
                continue;
            }
            let def = engine.registry.get_or_fallback(identity.node_type);
            let mut node = engine.build_node(
                &def,
                identity.node_type,
                identity.owner,
                identity.zone,
                identity.position,
                false,
            );
            match NodeRecord::load(gateway.as_ref(), id) {
                Ok(Some(record)) => record.apply(&mut node),
                Ok(None) => tracing::warn!(node = ?id, "no persisted state, using defaults"),
                Err(err) => tracing::error!(node = ?id, error = %err, "failed to load node state, using defaults"),
            }
            engine.insert_node(id, node);
        }

        let connections: Vec<_> = engine.graph.connections().map(|(c, d)| (c, d.source)).collect();
        for (connection, source) in connections {
            match gateway.load_property(source, PropertyKey::ConnectionWeight(connection)) {
                Ok(Some(PropertyValue::Real(weight))) => {
                    let stored = Fixed64::checked_from_num(weight)
                        .ok_or(GraphError::InvalidWeight(weight))
                        .and_then(|fixed| engine.graph.set_weight(connection, fixed));
                    if let Err(err) = stored {
                        tracing::warn!(connection = ?connection, error = %err, "stored weight rejected");
                    }
                }
                Ok(Some(other)) => {
                    tracing::error!(connection = ?connection, value = ?other, "stored weight is not a number")
                }
                Ok(None) => {}
                Err(err) => tracing::error!(connection = ?connection, error = %err, "failed to load weight"),
            }
        }
        engine.graph.drain_changes();

        let deconstructing: Vec<NodeId> = engine
            .nodes
            .iter()
            .filter(|(_, n)| n.is_deconstructing())
            .map(|(id, _)| id)
            .collect();
        for id in deconstructing {
            tracing::info!(node = ?id, "resuming interrupted deconstruction");
            engine.deconstruct(id, 0.0);
        }

        tracing::info!(
            tick = engine.sim_state.tick,
            nodes = engine.nodes.len(),
            connections = engine.graph.connection_count(),
            "world restored from snapshot"
        );
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use chrono::TimeDelta;

    #[test]
    fn header_validation() {
        assert!(SnapshotHeader::new(3).validate().is_ok());
        let bad_magic = SnapshotHeader {
            magic: 1,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(bad_magic.validate(), Err(DeserializeError::InvalidMagic(1))));
        let future = SnapshotHeader {
            version: FORMAT_VERSION + 1,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(future.validate(), Err(DeserializeError::FutureVersion(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        let w = TestWorld::new();
        let result = Engine::from_snapshot(
            &[1, 2, 3],
            w.engine.registry().clone(),
            Tuning::default(),
            w.collaborators(),
        );
        assert!(matches!(result, Err(DeserializeError::Decode(_))));
    }

    #[test]
    fn header_carries_tick() {
        let mut w = TestWorld::new();
        w.base_and_relay();
        for _ in 0..4 {
            w.engine.update(TICK);
        }
        let bytes = w.engine.save_snapshot().unwrap();
        assert_eq!(read_snapshot_header(&bytes).unwrap().tick, 4);
    }

    #[test]
    fn restart_resumes_reinforcement() {
        let mut w = TestWorld::new();
        let (base, relay) = w.base_and_relay();
        w.engine.update(TICK);
        w.damage(relay, 600.0);
        let end = w.engine.reinforce_end(relay).unwrap();
        w.engine.flush();

        let mut restarted = w.restart();
        assert_eq!(restarted.engine.reinforce_end(relay), Some(end));
        assert_eq!(restarted.engine.node(base).unwrap().owner, RED);

        restarted.engine.mark_all_loaded();
        restarted.clock.set(end + TimeDelta::seconds(1));
        restarted.engine.update(CHECK);
        assert!(!restarted.engine.is_reinforced(relay));
    }

    #[test]
    fn restart_keeps_weights_and_core() {
        let mut w = TestWorld::new();
        let (base, relay) = w.base_and_relay();
        let c = w.engine.graph().out_connections(base)[0];
        w.engine.set_connection_weight(c, 4.0).unwrap();
        w.set_core(relay, 250.0);
        w.engine.flush();

        let restarted = w.restart();
        assert_eq!(restarted.engine.graph().get_connection(c).unwrap().weight, fixed(4.0));
        assert_eq!(restarted.core(relay), fixed(250.0));
    }

    #[test]
    fn restart_finishes_interrupted_deconstruction() {
        let mut w = TestWorld::new();
        let relay = w.deploy(w.types.relay, RED);
        w.engine.flush();
        w.engine.modify_construction_level(relay, 10, false).unwrap();
        w.engine.flush();
        let bytes = w.engine.save_snapshot().unwrap();

        // Simulate a crash after the level hit zero but before removal.
        use crate::persist::PersistenceGateway;
        w.gateway
            .update(
                relay,
                &[
                    (PropertyKey::ConstructionLevel, PropertyValue::Int(0)),
                    (PropertyKey::ConstructionDirection, PropertyValue::Int(1)),
                ],
            )
            .unwrap();

        let restarted = w.restart_from(&bytes);
        assert!(!restarted.engine.contains_node(relay));
        assert_eq!(restarted.loot.requests().len(), 1);
    }
}
