//! Serde data file structs for node type definitions.
//!
//! These structs define the on-disk format for node types. They are
//! deserialized from RON, JSON, or TOML data files and then resolved into
//! engine types by the loader. Simulation tuning is read straight into
//! [`holdfast_core::tuning::Tuning`].

use holdfast_core::registry::NodeClass;
use serde::Deserialize;

// ===========================================================================
// Node types
// ===========================================================================

/// Structural class as written in data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClassData {
    Base,
    CorePump,
    Relay,
    Production,
    Turret,
    Wall,
}

impl From<NodeClassData> for NodeClass {
    fn from(class: NodeClassData) -> Self {
        match class {
            NodeClassData::Base => NodeClass::Base,
            NodeClassData::CorePump => NodeClass::CorePump,
            NodeClassData::Relay => NodeClass::Relay,
            NodeClassData::Production => NodeClass::Production,
            NodeClassData::Turret => NodeClass::Turret,
            NodeClassData::Wall => NodeClass::Wall,
        }
    }
}

/// A node type definition in a data file.
///
/// Every field but `name` and `class` is optional; omitted fields take the
/// class defaults of [`holdfast_core::registry::NodeTypeDef::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct NodeTypeData {
    pub name: String,
    pub class: NodeClassData,
    #[serde(default)]
    pub construction_max: Option<i32>,
    #[serde(default)]
    pub armor_max: Option<f64>,
    #[serde(default)]
    pub core_max: Option<f64>,
    #[serde(default)]
    pub core_transferred: Option<f64>,
    #[serde(default)]
    pub transfer_efficiency: Option<f64>,
    #[serde(default)]
    pub core_minimum: Option<f64>,
    #[serde(default)]
    pub core_demand: Option<f64>,
    #[serde(default)]
    pub kick_start_ratio: Option<f64>,
    #[serde(default)]
    pub reinforce_counter_max: Option<u32>,
    #[serde(default)]
    pub offline_when_reinforced: Option<bool>,
    /// Item id of the capsule dropped on deconstruction.
    #[serde(default)]
    pub capsule_item: Option<u32>,
}

/// TOML wrapper: `[[node_types]]` array of tables.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlNodeTypes {
    pub node_types: Vec<NodeTypeData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names_are_snake_case() {
        let class: NodeClassData = serde_json::from_str(r#""core_pump""#).unwrap();
        assert_eq!(NodeClass::from(class), NodeClass::CorePump);
    }

    #[test]
    fn optional_fields_default_to_none() {
        let data: NodeTypeData = serde_json::from_str(r#"{"name": "relay", "class": "relay"}"#).unwrap();
        assert_eq!(data.name, "relay");
        assert!(data.armor_max.is_none());
        assert!(data.offline_when_reinforced.is_none());
    }

    #[test]
    fn ron_with_overrides() {
        let data: NodeTypeData = ron::from_str(
            r#"(name: "refinery", class: production, core_demand: Some(25.0), capsule_item: Some(12))"#,
        )
        .unwrap();
        assert_eq!(data.class, NodeClassData::Production);
        assert_eq!(data.core_demand, Some(25.0));
        assert_eq!(data.capsule_item, Some(12));
    }
}
