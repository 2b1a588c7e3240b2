//! Persistence contract.
//!
//! Dynamic node state is stored as individual properties keyed by node. The
//! storage format is the gateway's business; the engine only reads and
//! writes [`PropertyValue`]s.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::GatewayError;
use crate::construction::{ConstructionLevel, Direction};
use crate::fixed::{Fixed64, f64_to_fixed64, fixed64_to_f64};
use crate::id::*;
use crate::node::Node;
use crate::reinforce::{ReinforcePhase, ReinforceSnapshot, Reinforcement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    Online,
    ConstructionLevel,
    ConstructionDirection,
    Armor,
    StoredCore,
    ReinforceCounter,
    ReinforceNextIncrease,
    ReinforceOffset,
    IsReinforced,
    ReinforceEnd,
    IsVulnerable,
    VulnerableEnd,
    Orphaned,
    /// Weight of one of the node's out-connections.
    ConnectionWeight(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Time(DateTime<Utc>),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PropertyValue::Bool(v) => Some(v),
            PropertyValue::Int(v) => Some(v != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            PropertyValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match *self {
            PropertyValue::Real(v) => Some(v),
            PropertyValue::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match *self {
            PropertyValue::Time(v) => Some(v),
            _ => None,
        }
    }
}

/// Storage backend for node properties.
pub trait PersistenceGateway: Send + Sync + Debug {
    fn load_property(&self, node: NodeId, key: PropertyKey) -> Result<Option<PropertyValue>, GatewayError>;

    fn save_property(&self, node: NodeId, key: PropertyKey, value: PropertyValue) -> Result<(), GatewayError>;

    /// Write several properties as one transaction.
    fn update(&self, node: NodeId, values: &[(PropertyKey, PropertyValue)]) -> Result<(), GatewayError> {
        for &(key, value) in values {
            self.save_property(node, key, value)?;
        }
        Ok(())
    }

    /// Drop everything stored for a node.
    fn remove_node(&self, _node: NodeId) -> Result<(), GatewayError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryGateway
// ---------------------------------------------------------------------------

/// Process-local gateway. Survives an engine restart as long as the `Arc`
/// is shared with the new engine.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    properties: Mutex<HashMap<(u64, PropertyKey), PropertyValue>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(u64, PropertyKey), PropertyValue>>, GatewayError> {
        self.properties
            .lock()
            .map_err(|_| GatewayError::Unavailable("in-memory store poisoned".to_string()))
    }

    /// Number of stored properties across all nodes.
    pub fn len(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceGateway for InMemoryGateway {
    fn load_property(&self, node: NodeId, key: PropertyKey) -> Result<Option<PropertyValue>, GatewayError> {
        Ok(self.lock()?.get(&(node_key(node), key)).copied())
    }

    fn save_property(&self, node: NodeId, key: PropertyKey, value: PropertyValue) -> Result<(), GatewayError> {
        self.lock()?.insert((node_key(node), key), value);
        Ok(())
    }

    fn update(&self, node: NodeId, values: &[(PropertyKey, PropertyValue)]) -> Result<(), GatewayError> {
        let mut properties = self.lock()?;
        let node = node_key(node);
        for &(key, value) in values {
            properties.insert((node, key), value);
        }
        Ok(())
    }

    fn remove_node(&self, node: NodeId) -> Result<(), GatewayError> {
        let node = node_key(node);
        self.lock()?.retain(|(n, _), _| *n != node);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NodeRecord
// ---------------------------------------------------------------------------

/// The persisted dynamic state of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub online: bool,
    pub construction_level: i32,
    pub construction_direction: Direction,
    pub armor: Fixed64,
    pub stored_core: Fixed64,
    pub reinforce: ReinforceSnapshot,
    pub orphaned: bool,
}

impl NodeRecord {
    pub fn capture(node: &Node) -> Self {
        Self {
            online: node.online,
            construction_level: node.construction.current(),
            construction_direction: node.construction.direction(),
            armor: node.armor.current(),
            stored_core: node.core.current(),
            reinforce: node.reinforcement.snapshot(),
            orphaned: node.orphaned,
        }
    }

    pub fn to_properties(&self) -> Vec<(PropertyKey, PropertyValue)> {
        let (is_reinforced, reinforce_end, is_vulnerable, vulnerable_end) = match self.reinforce.phase {
            ReinforcePhase::Normal => (false, None, false, None),
            ReinforcePhase::Reinforced { end } => (true, Some(end), false, None),
            ReinforcePhase::Vulnerable { end } => (false, None, true, Some(end)),
        };

        let mut props = vec![
            (PropertyKey::Online, PropertyValue::Bool(self.online)),
            (
                PropertyKey::ConstructionLevel,
                PropertyValue::Int(i64::from(self.construction_level)),
            ),
            (
                PropertyKey::ConstructionDirection,
                PropertyValue::Int(match self.construction_direction {
                    Direction::Up => 0,
                    Direction::Down => 1,
                }),
            ),
            (PropertyKey::Armor, PropertyValue::Real(fixed64_to_f64(self.armor))),
            (PropertyKey::StoredCore, PropertyValue::Real(fixed64_to_f64(self.stored_core))),
            (
                PropertyKey::ReinforceCounter,
                PropertyValue::Int(i64::from(self.reinforce.counter)),
            ),
            (
                PropertyKey::ReinforceNextIncrease,
                PropertyValue::Time(self.reinforce.next_counter_increase),
            ),
            (
                PropertyKey::ReinforceOffset,
                PropertyValue::Int(i64::from(self.reinforce.offset_hour)),
            ),
            (PropertyKey::IsReinforced, PropertyValue::Bool(is_reinforced)),
            (PropertyKey::IsVulnerable, PropertyValue::Bool(is_vulnerable)),
            (PropertyKey::Orphaned, PropertyValue::Bool(self.orphaned)),
        ];
        if let Some(end) = reinforce_end {
            props.push((PropertyKey::ReinforceEnd, PropertyValue::Time(end)));
        }
        if let Some(end) = vulnerable_end {
            props.push((PropertyKey::VulnerableEnd, PropertyValue::Time(end)));
        }
        props
    }

    /// Read a record back. `Ok(None)` if the node was never saved.
    pub fn load(gateway: &dyn PersistenceGateway, node: NodeId) -> Result<Option<Self>, GatewayError> {
        let load = |key| gateway.load_property(node, key);
        let malformed = |key: PropertyKey, reason: &str| GatewayError::Malformed {
            key: format!("{key:?}"),
            reason: reason.to_string(),
        };

        let Some(level) = load(PropertyKey::ConstructionLevel)? else {
            return Ok(None);
        };
        let construction_level = level
            .as_int()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| malformed(PropertyKey::ConstructionLevel, "expected a 32-bit integer"))?;

        let construction_direction = match load(PropertyKey::ConstructionDirection)?.and_then(|v| v.as_int()) {
            Some(0) => Direction::Up,
            Some(_) => Direction::Down,
            None => Direction::Up,
        };

        let flag = |key| -> Result<bool, GatewayError> {
            Ok(load(key)?.and_then(|v| v.as_bool()).unwrap_or(false))
        };
        let real = |key| -> Result<Option<Fixed64>, GatewayError> {
            Ok(load(key)?.and_then(|v| v.as_real()).map(f64_to_fixed64))
        };
        let time = |key| -> Result<Option<DateTime<Utc>>, GatewayError> {
            Ok(load(key)?.and_then(|v| v.as_time()))
        };

        let phase = if flag(PropertyKey::IsReinforced)? {
            let end = time(PropertyKey::ReinforceEnd)?
                .ok_or_else(|| malformed(PropertyKey::ReinforceEnd, "reinforced without an end time"))?;
            ReinforcePhase::Reinforced { end }
        } else if flag(PropertyKey::IsVulnerable)? {
            let end = time(PropertyKey::VulnerableEnd)?
                .ok_or_else(|| malformed(PropertyKey::VulnerableEnd, "vulnerable without an end time"))?;
            ReinforcePhase::Vulnerable { end }
        } else {
            ReinforcePhase::Normal
        };

        let counter = load(PropertyKey::ReinforceCounter)?
            .and_then(|v| v.as_int())
            .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
            .unwrap_or(0);
        let offset_hour = load(PropertyKey::ReinforceOffset)?
            .and_then(|v| v.as_int())
            .map(|v| v.clamp(0, 23) as u8)
            .unwrap_or(0);
        let next_counter_increase = time(PropertyKey::ReinforceNextIncrease)?
            .ok_or_else(|| malformed(PropertyKey::ReinforceNextIncrease, "missing"))?;

        Ok(Some(Self {
            online: flag(PropertyKey::Online)?,
            construction_level,
            construction_direction,
            armor: real(PropertyKey::Armor)?.unwrap_or(Fixed64::ZERO),
            stored_core: real(PropertyKey::StoredCore)?.unwrap_or(Fixed64::ZERO),
            reinforce: ReinforceSnapshot {
                phase,
                counter,
                next_counter_increase,
                offset_hour,
            },
            orphaned: flag(PropertyKey::Orphaned)?,
        }))
    }

    /// Overwrite a node's dynamic state. End times are taken verbatim.
    pub fn apply(&self, node: &mut Node) {
        node.online = self.online;
        node.orphaned = self.orphaned;
        node.construction = ConstructionLevel::restore(
            self.construction_level,
            node.construction.max(),
            self.construction_direction,
        );
        node.armor.set(self.armor);
        node.core.set(self.stored_core);
        node.reinforcement = Reinforcement::restore(self.reinforce, node.tuning.reinforce_counter_max);
        node.pvp_exposed_until = node.reinforcement.vulnerable_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use slotmap::SlotMap;

    fn node_id() -> NodeId {
        let mut sm = SlotMap::<NodeId, ()>::with_key();
        sm.insert(())
    }

    fn record(phase: ReinforcePhase) -> NodeRecord {
        NodeRecord {
            online: true,
            construction_level: 70,
            construction_direction: Direction::Down,
            armor: Fixed64::from_num(412.5),
            stored_core: Fixed64::from_num(80),
            reinforce: ReinforceSnapshot {
                phase,
                counter: 2,
                next_counter_increase: Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap(),
                offset_hour: 6,
            },
            orphaned: false,
        }
    }

    #[test]
    fn missing_node_loads_none() {
        let gw = InMemoryGateway::new();
        assert_eq!(NodeRecord::load(&gw, node_id()).unwrap(), None);
    }

    #[test]
    fn reinforced_record_survives_the_gateway() {
        let gw = InMemoryGateway::new();
        let id = node_id();
        let end = Utc.with_ymd_and_hms(2024, 5, 3, 6, 0, 0).unwrap();
        let rec = record(ReinforcePhase::Reinforced { end });

        gw.update(id, &rec.to_properties()).unwrap();
        assert_eq!(NodeRecord::load(&gw, id).unwrap(), Some(rec));
    }

    #[test]
    fn leaving_reinforcement_clears_the_flag() {
        let gw = InMemoryGateway::new();
        let id = node_id();
        let end = Utc.with_ymd_and_hms(2024, 5, 3, 6, 0, 0).unwrap();
        gw.update(id, &record(ReinforcePhase::Reinforced { end }).to_properties())
            .unwrap();
        gw.update(id, &record(ReinforcePhase::Normal).to_properties()).unwrap();

        let loaded = NodeRecord::load(&gw, id).unwrap().unwrap();
        assert_eq!(loaded.reinforce.phase, ReinforcePhase::Normal);
    }

    #[test]
    fn reinforced_without_end_is_malformed() {
        let gw = InMemoryGateway::new();
        let id = node_id();
        let mut props = record(ReinforcePhase::Normal).to_properties();
        props.push((PropertyKey::IsReinforced, PropertyValue::Bool(true)));
        gw.update(id, &props).unwrap();

        assert!(matches!(
            NodeRecord::load(&gw, id),
            Err(GatewayError::Malformed { .. })
        ));
    }

    #[test]
    fn remove_node_drops_all_properties() {
        let gw = InMemoryGateway::new();
        let id = node_id();
        gw.update(id, &record(ReinforcePhase::Normal).to_properties()).unwrap();
        assert!(!gw.is_empty());
        gw.remove_node(id).unwrap();
        assert!(gw.is_empty());
    }

    #[test]
    fn property_value_conversions() {
        assert_eq!(PropertyValue::Int(1).as_bool(), Some(true));
        assert_eq!(PropertyValue::Int(3).as_real(), Some(3.0));
        assert_eq!(PropertyValue::Bool(true).as_int(), None);
    }
}
