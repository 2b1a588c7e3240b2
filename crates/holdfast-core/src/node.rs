//! Per-node state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::construction::{ConstructionLevel, Direction};
use crate::core_use::{CoreUse, CoreUseParams, CoreUseSnapshot};
use crate::fixed::{Fixed64, ratio};
use crate::id::*;
use crate::registry::{NodeClass, NodeTypeDef};
use crate::reinforce::{ReinforcePhase, Reinforcement};
use crate::tuning::Tuning;

// ---------------------------------------------------------------------------
// Gauge
// ---------------------------------------------------------------------------

/// A bounded quantity: stored core energy, armor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gauge {
    current: Fixed64,
    max: Fixed64,
}

impl Gauge {
    pub fn new(current: Fixed64, max: Fixed64) -> Self {
        let max = max.max(Fixed64::ZERO);
        Self {
            current: current.clamp(Fixed64::ZERO, max),
            max,
        }
    }

    pub fn full(max: Fixed64) -> Self {
        Self::new(max, max)
    }

    pub fn empty(max: Fixed64) -> Self {
        Self::new(Fixed64::ZERO, max)
    }

    pub fn current(&self) -> Fixed64 {
        self.current
    }

    pub fn max(&self) -> Fixed64 {
        self.max
    }

    /// Room left below `max`.
    pub fn free(&self) -> Fixed64 {
        self.max - self.current
    }

    pub fn is_full(&self) -> bool {
        self.current >= self.max
    }

    pub fn is_empty(&self) -> bool {
        self.current <= Fixed64::ZERO
    }

    pub fn ratio(&self) -> Fixed64 {
        ratio(self.current, self.max)
    }

    /// Add up to `amount`, returning what was actually added.
    pub fn add(&mut self, amount: Fixed64) -> Fixed64 {
        let added = amount.max(Fixed64::ZERO).min(self.free());
        self.current += added;
        added
    }

    /// Remove up to `amount`, returning what was actually removed.
    pub fn take(&mut self, amount: Fixed64) -> Fixed64 {
        let taken = amount.max(Fixed64::ZERO).min(self.current);
        self.current -= taken;
        taken
    }

    pub fn set(&mut self, value: Fixed64) {
        self.current = value.clamp(Fixed64::ZERO, self.max);
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

// ---------------------------------------------------------------------------
// NodeTuning
// ---------------------------------------------------------------------------

/// Per-type values resolved once when the node is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeTuning {
    pub core_transferred: Fixed64,
    pub transfer_efficiency: Fixed64,
    pub core_minimum: Fixed64,
    pub core_demand: Fixed64,
    pub kick_start_ratio: Fixed64,
    pub reinforce_counter_max: u32,
    pub offline_when_reinforced: bool,
    pub capsule_item: ItemTypeId,
    pub core_use_cycle: Duration,
}

impl NodeTuning {
    pub fn resolve(def: &NodeTypeDef, tuning: &Tuning) -> Self {
        Self {
            core_transferred: def.core_transferred,
            transfer_efficiency: def.transfer_efficiency,
            core_minimum: def.core_minimum,
            core_demand: def.core_demand,
            kick_start_ratio: def.kick_start_ratio.unwrap_or_else(|| tuning.kick_start_ratio()),
            reinforce_counter_max: if def.class.is_reinforceable() {
                def.reinforce_counter_max
            } else {
                0
            },
            offline_when_reinforced: def.offline_when_reinforced,
            capsule_item: def.capsule_item,
            core_use_cycle: tuning.core_use_cycle(),
        }
    }

    pub fn core_use_params(&self) -> CoreUseParams {
        CoreUseParams {
            core_minimum: self.core_minimum,
            kick_start_ratio: self.kick_start_ratio,
            static_demand: self.core_demand,
            cycle: self.core_use_cycle,
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Everything the engine tracks about one deployed structure.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_type: NodeTypeId,
    pub class: NodeClass,
    pub owner: OwnerId,
    pub position: Position,
    pub zone: ZoneId,
    pub construction: ConstructionLevel,
    pub core: Gauge,
    pub armor: Gauge,
    pub online: bool,
    pub orphaned: bool,
    pub reinforcement: Reinforcement,
    /// Present only for classes that consume energy.
    pub core_use: Option<CoreUse>,
    /// Raw amount drawn by the pump on its last run.
    pub last_used_core: Fixed64,
    pub pvp_exposed_until: Option<DateTime<Utc>>,
    pub tuning: NodeTuning,
}

impl Node {
    pub fn is_fully_constructed(&self) -> bool {
        !self.class.has_construction_level() || self.construction.is_fully_constructed()
    }

    pub fn is_reinforced(&self) -> bool {
        self.reinforcement.is_reinforced()
    }

    pub fn is_vulnerable(&self) -> bool {
        self.reinforcement.is_vulnerable()
    }

    pub fn can_be_killed(&self) -> bool {
        self.reinforcement.can_be_killed()
    }

    pub fn is_pvp_exposed(&self, now: DateTime<Utc>) -> bool {
        self.pvp_exposed_until.is_some_and(|until| now < until)
    }

    /// Being torn down: no longer a valid pump target.
    pub fn is_deconstructing(&self) -> bool {
        self.class.has_construction_level() && self.construction.is_deconstructing()
    }

    pub fn snapshot(&self, id: NodeId) -> NodeSnapshot {
        NodeSnapshot {
            id,
            node_type: self.node_type,
            class: self.class,
            owner: self.owner,
            zone: self.zone,
            position: self.position,
            construction_level: self.construction.current(),
            construction_max: self.construction.max(),
            construction_direction: self.construction.direction(),
            core: self.core,
            armor: self.armor,
            online: self.online,
            orphaned: self.orphaned,
            reinforce: self.reinforcement.phase(),
            reinforce_counter: self.reinforcement.counter(),
            reinforce_offset: self.reinforcement.offset_hour(),
            core_use: self.core_use.as_ref().map(CoreUse::snapshot),
            last_used_core: self.last_used_core,
            pvp_exposed_until: self.pvp_exposed_until,
        }
    }
}

/// Point-in-time view of a node, sent to viewers and returned by accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub node_type: NodeTypeId,
    pub class: NodeClass,
    pub owner: OwnerId,
    pub zone: ZoneId,
    pub position: Position,
    pub construction_level: i32,
    pub construction_max: i32,
    pub construction_direction: Direction,
    pub core: Gauge,
    pub armor: Gauge,
    pub online: bool,
    pub orphaned: bool,
    pub reinforce: ReinforcePhase,
    pub reinforce_counter: u32,
    pub reinforce_offset: u8,
    pub core_use: Option<CoreUseSnapshot>,
    pub last_used_core: Fixed64,
    pub pvp_exposed_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx(v: f64) -> Fixed64 {
        Fixed64::from_num(v)
    }

    #[test]
    fn gauge_add_is_capped() {
        let mut g = Gauge::new(fx(90.0), fx(100.0));
        assert_eq!(g.add(fx(25.0)), fx(10.0));
        assert!(g.is_full());
        assert_eq!(g.free(), Fixed64::ZERO);
    }

    #[test]
    fn gauge_take_is_floored() {
        let mut g = Gauge::new(fx(5.0), fx(100.0));
        assert_eq!(g.take(fx(8.0)), fx(5.0));
        assert!(g.is_empty());
    }

    #[test]
    fn gauge_new_clamps() {
        let g = Gauge::new(fx(150.0), fx(100.0));
        assert_eq!(g.current(), fx(100.0));
        assert_eq!(g.ratio(), Fixed64::ONE);
    }

    #[test]
    fn tuning_uses_type_kick_start_override() {
        let mut def = NodeTypeDef::new("miner", NodeClass::Production);
        let t = NodeTuning::resolve(&def, &Tuning::default());
        assert_eq!(t.kick_start_ratio, Tuning::default().kick_start_ratio());

        def.kick_start_ratio = Some(fx(0.25));
        let t = NodeTuning::resolve(&def, &Tuning::default());
        assert_eq!(t.kick_start_ratio, fx(0.25));
    }

    #[test]
    fn walls_have_no_reinforce_charges() {
        let mut def = NodeTypeDef::new("wall", NodeClass::Wall);
        def.reinforce_counter_max = 5;
        let t = NodeTuning::resolve(&def, &Tuning::default());
        assert_eq!(t.reinforce_counter_max, 0);
    }
}
