//! Simulation-wide tuning values.
//!
//! Stored in data files as plain numbers (seconds, minutes, ratios) and
//! converted to fixed-point and duration types through the accessor methods.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, Ticks, f64_to_fixed64};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Below this stored amount the pump does nothing.
    pub pump_minimum: f64,
    /// Effective transfers at or below this amount are dropped.
    pub min_transfer: f64,
    pub delayed_start_min_secs: u64,
    pub delayed_start_max_secs: u64,
    pub core_use_cycle_secs: u64,
    /// Fraction of capacity a warming-up node needs before going Active.
    pub kick_start_ratio: f64,
    pub reinforce_check_secs: u64,
    /// Armor ratio below which a Normal node enters reinforcement.
    pub reinforce_armor_threshold: f64,
    pub counter_increase_minutes: i64,
    pub reinforce_length_minutes: i64,
    pub vulnerable_length_minutes: i64,
    /// Minimum ticks between two persistence writes of the same node.
    pub save_interval_ticks: Ticks,
    pub rng_seed: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            pump_minimum: 5.0,
            min_transfer: 1.0,
            delayed_start_min_secs: 30,
            delayed_start_max_secs: 45,
            core_use_cycle_secs: 30,
            kick_start_ratio: 0.7,
            reinforce_check_secs: 10,
            reinforce_armor_threshold: 0.5,
            counter_increase_minutes: 2880,
            reinforce_length_minutes: 1440,
            vulnerable_length_minutes: 120,
            save_interval_ticks: 60,
            rng_seed: 0x5EED,
        }
    }
}

impl Tuning {
    pub fn pump_minimum(&self) -> Fixed64 {
        f64_to_fixed64(self.pump_minimum)
    }

    pub fn min_transfer(&self) -> Fixed64 {
        f64_to_fixed64(self.min_transfer)
    }

    pub fn kick_start_ratio(&self) -> Fixed64 {
        f64_to_fixed64(self.kick_start_ratio)
    }

    pub fn reinforce_armor_threshold(&self) -> Fixed64 {
        f64_to_fixed64(self.reinforce_armor_threshold)
    }

    pub fn delayed_start_window(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.delayed_start_min_secs),
            Duration::from_secs(self.delayed_start_max_secs),
        )
    }

    pub fn core_use_cycle(&self) -> Duration {
        Duration::from_secs(self.core_use_cycle_secs)
    }

    pub fn reinforce_check_interval(&self) -> Duration {
        Duration::from_secs(self.reinforce_check_secs)
    }

    pub fn counter_increase_interval(&self) -> TimeDelta {
        TimeDelta::minutes(self.counter_increase_minutes)
    }

    pub fn reinforce_length(&self) -> TimeDelta {
        TimeDelta::minutes(self.reinforce_length_minutes)
    }

    pub fn vulnerable_length(&self) -> TimeDelta {
        TimeDelta::minutes(self.vulnerable_length_minutes)
    }
}
