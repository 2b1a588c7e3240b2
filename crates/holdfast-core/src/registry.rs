//! Node type registry.
//!
//! Node types are registered once at start-up through [`RegistryBuilder`] and
//! frozen into an immutable [`Registry`]. Behaviour that differed per
//! structure type is expressed by a [`NodeClass`] tag and its capability
//! methods, plus per-type numeric overrides on [`NodeTypeDef`].

use crate::fixed::Fixed64;
use crate::id::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Structural class of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    /// Anchors a network; a network without one is orphaned.
    Base,
    /// Generates and pushes core energy to its out-connections.
    CorePump,
    /// Stores core energy and forwards it.
    Relay,
    /// Runs production on its active cycle.
    Production,
    /// Fires on its active cycle.
    Turret,
    /// Passive wall segment: construction level and armor only.
    Wall,
}

impl NodeClass {
    pub fn is_base(self) -> bool {
        matches!(self, NodeClass::Base)
    }

    /// Whether the node tracks a construction level at all.
    pub fn has_construction_level(self) -> bool {
        !matches!(self, NodeClass::Base)
    }

    /// Whether the node can be the target of a core transfer.
    pub fn accepts_energy(self) -> bool {
        !matches!(self, NodeClass::Wall)
    }

    /// Whether the node runs the core pump each tick.
    pub fn pumps_energy(self) -> bool {
        matches!(self, NodeClass::Base | NodeClass::CorePump | NodeClass::Relay)
    }

    /// Whether the node runs the core-use state machine.
    pub fn consumes_energy(self) -> bool {
        matches!(self, NodeClass::Production | NodeClass::Turret)
    }

    /// Whether the node can ever enter reinforcement.
    pub fn is_reinforceable(self) -> bool {
        !matches!(self, NodeClass::Wall)
    }

    /// Default for [`NodeTypeDef::offline_when_reinforced`].
    pub fn default_offline_when_reinforced(self) -> bool {
        matches!(self, NodeClass::Production)
    }
}

/// A node type definition.
#[derive(Debug, Clone)]
pub struct NodeTypeDef {
    pub name: String,
    pub class: NodeClass,
    /// Construction points needed to be fully constructed.
    pub construction_max: i32,
    pub armor_max: Fixed64,
    /// Core energy storage capacity.
    pub core_max: Fixed64,
    /// Nominal amount the pump pushes per tick.
    pub core_transferred: Fixed64,
    /// Multiplier applied to every transfer out of this node (<= 1).
    pub transfer_efficiency: Fixed64,
    /// Minimum stored energy for the core-use Active state.
    pub core_minimum: Fixed64,
    /// Static per-cycle consumption, used when the active cycle does not
    /// report a dynamic demand.
    pub core_demand: Fixed64,
    /// Overrides the tuning-wide kick-start ratio.
    pub kick_start_ratio: Option<Fixed64>,
    /// Reinforcement charges; 0 means the type can never be reinforced.
    pub reinforce_counter_max: u32,
    pub offline_when_reinforced: bool,
    /// Item dropped as the deconstruction capsule.
    pub capsule_item: ItemTypeId,
}

impl NodeTypeDef {
    /// A definition with sensible defaults for the given class.
    pub fn new(name: &str, class: NodeClass) -> Self {
        Self {
            name: name.to_string(),
            class,
            construction_max: 100,
            armor_max: Fixed64::from_num(1000),
            core_max: Fixed64::from_num(1000),
            core_transferred: if class.pumps_energy() {
                Fixed64::from_num(50)
            } else {
                Fixed64::ZERO
            },
            transfer_efficiency: Fixed64::ONE,
            core_minimum: Fixed64::from_num(10),
            core_demand: if class.consumes_energy() {
                Fixed64::from_num(10)
            } else {
                Fixed64::ZERO
            },
            kick_start_ratio: None,
            reinforce_counter_max: if class == NodeClass::Wall { 0 } else { 3 },
            offline_when_reinforced: class.default_offline_when_reinforced(),
            capsule_item: ItemTypeId(0),
        }
    }

    /// Applied when a node references a type missing from the registry.
    pub fn fallback() -> Self {
        Self::new("<unknown>", NodeClass::Wall)
    }
}

/// Errors raised while building or querying the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node type not found: {0}")]
    NotFound(String),
    #[error("duplicate node type name: {0}")]
    DuplicateName(String),
    #[error("invalid value for {field} on node type {name}: {reason}")]
    InvalidValue {
        name: String,
        field: &'static str,
        reason: String,
    },
}

/// Builder for constructing an immutable Registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<NodeTypeDef>,
    name_to_id: HashMap<String, NodeTypeId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type. Returns its ID.
    pub fn register(&mut self, def: NodeTypeDef) -> Result<NodeTypeId, RegistryError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        validate(&def)?;
        let id = NodeTypeId(self.types.len() as u32);
        self.name_to_id.insert(def.name.clone(), id);
        self.types.push(def);
        Ok(id)
    }

    /// Mutate an already registered type by name (mods, balancing passes).
    pub fn mutate<F>(&mut self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut NodeTypeDef),
    {
        let id = self
            .name_to_id
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let def = &mut self.types[id.0 as usize];
        f(def);
        validate(def)
    }

    /// Freeze the registry.
    pub fn build(self) -> Registry {
        Registry {
            types: self.types,
            name_to_id: self.name_to_id,
        }
    }
}

fn validate(def: &NodeTypeDef) -> Result<(), RegistryError> {
    let invalid = |field: &'static str, reason: &str| RegistryError::InvalidValue {
        name: def.name.clone(),
        field,
        reason: reason.to_string(),
    };
    if def.construction_max <= 0 {
        return Err(invalid("construction_max", "must be positive"));
    }
    if def.transfer_efficiency < Fixed64::ZERO || def.transfer_efficiency > Fixed64::ONE {
        return Err(invalid("transfer_efficiency", "must be within [0, 1]"));
    }
    if def.core_max < Fixed64::ZERO || def.armor_max <= Fixed64::ZERO {
        return Err(invalid("core_max/armor_max", "must be non-negative"));
    }
    Ok(())
}

/// Immutable registry of node types, frozen at start-up.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    types: Vec<NodeTypeDef>,
    name_to_id: HashMap<String, NodeTypeId>,
}

impl Registry {
    pub fn get(&self, id: NodeTypeId) -> Option<&NodeTypeDef> {
        self.types.get(id.0 as usize)
    }

    pub fn id_by_name(&self, name: &str) -> Option<NodeTypeId> {
        self.name_to_id.get(name).copied()
    }

    /// Look up a type, substituting [`NodeTypeDef::fallback`] when missing.
    ///
    /// A missing type is a configuration error, not a reason to halt the
    /// tick loop.
    pub fn get_or_fallback(&self, id: NodeTypeId) -> NodeTypeDef {
        match self.get(id) {
            Some(def) => def.clone(),
            None => {
                tracing::error!(node_type = id.0, "node type missing from registry, using fallback");
                NodeTypeDef::fallback()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeTypeId, &NodeTypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, def)| (NodeTypeId(i as u32), def))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut builder = RegistryBuilder::new();
        let base = builder.register(NodeTypeDef::new("base", NodeClass::Base)).unwrap();
        let turret = builder
            .register(NodeTypeDef::new("turret", NodeClass::Turret))
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_by_name("turret"), Some(turret));
        assert_eq!(registry.get(base).unwrap().class, NodeClass::Base);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(NodeTypeDef::new("wall", NodeClass::Wall)).unwrap();
        let err = builder
            .register(NodeTypeDef::new("wall", NodeClass::Wall))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn efficiency_above_one_rejected() {
        let mut def = NodeTypeDef::new("leaky", NodeClass::CorePump);
        def.transfer_efficiency = Fixed64::from_num(1.5);
        let err = RegistryBuilder::new().register(def).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidValue { field: "transfer_efficiency", .. }));
    }

    #[test]
    fn mutate_revalidates() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(NodeTypeDef::new("pump", NodeClass::CorePump))
            .unwrap();
        builder
            .mutate("pump", |d| d.core_transferred = Fixed64::from_num(80))
            .unwrap();
        assert!(builder.mutate("pump", |d| d.construction_max = 0).is_err());
        assert!(builder.mutate("missing", |_| {}).is_err());
    }

    #[test]
    fn missing_type_falls_back() {
        let registry = RegistryBuilder::new().build();
        let def = registry.get_or_fallback(NodeTypeId(9));
        assert_eq!(def.name, "<unknown>");
        assert_eq!(def.reinforce_counter_max, 0);
    }

    #[test]
    fn class_capabilities() {
        assert!(NodeClass::Base.is_base());
        assert!(!NodeClass::Wall.accepts_energy());
        assert!(NodeClass::Relay.pumps_energy());
        assert!(NodeClass::Turret.consumes_energy());
        assert!(!NodeClass::CorePump.consumes_energy());
        assert!(NodeClass::Production.default_offline_when_reinforced());
    }
}
