//! Construction level tracking.
//!
//! A node's construction level climbs from 0 towards its maximum while it is
//! being built (direction [`Direction::Up`]). Once fully constructed the
//! direction flips to [`Direction::Down`]: the node may now be charged
//! downwards, and reaching 0 in that direction deconstructs it.

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Whether the node is being built or is ready to be unbuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

/// What a successful [`ConstructionLevel::modify`] call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionChange {
    /// Level moved but crossed no boundary.
    Changed,
    /// Level reached the maximum from below.
    FullyConstructed,
    /// Level reached zero while deconstructing; the node must be removed.
    Deconstructed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructionLevel {
    current: i32,
    max: i32,
    direction: Direction,
}

impl ConstructionLevel {
    /// A freshly deployed node: level 0, under construction.
    pub fn new(max: i32) -> Self {
        Self {
            current: 0,
            max: max.max(1),
            direction: Direction::Up,
        }
    }

    /// A node that starts out fully built (bases, admin spawns).
    pub fn fully_constructed(max: i32) -> Self {
        let max = max.max(1);
        Self {
            current: max,
            max,
            direction: Direction::Down,
        }
    }

    /// Rebuild from persisted values, clamping the level into range.
    pub fn restore(current: i32, max: i32, direction: Direction) -> Self {
        let max = max.max(1);
        Self {
            current: current.clamp(0, max),
            max,
            direction,
        }
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_fully_constructed(&self) -> bool {
        self.current >= self.max
    }

    /// A level of zero reached while tearing down: the deconstruction path
    /// must run (again, after a restart).
    pub fn is_deconstructing(&self) -> bool {
        self.current == 0 && self.direction == Direction::Down
    }

    /// Apply a construction charge.
    ///
    /// `force` skips validation and drops the level to zero.
    pub fn modify(&mut self, amount: i32, force: bool) -> Result<ConstructionChange, NodeError> {
        if force {
            self.current = 0;
            self.direction = Direction::Down;
            return Ok(ConstructionChange::Deconstructed);
        }

        if amount > 0 && self.current >= self.max {
            return Err(NodeError::ConstructionLevelMaxReached);
        }
        if amount < 0 {
            if self.current <= 0 {
                return Err(NodeError::ConstructionLevelMinReached);
            }
            if self.direction == Direction::Up {
                return Err(NodeError::OnlyConstructionPossible);
            }
        }

        let was_below_max = self.current < self.max;
        self.current = self.current.saturating_add(amount).clamp(0, self.max);

        if self.current >= self.max && was_below_max {
            self.direction = Direction::Down;
            return Ok(ConstructionChange::FullyConstructed);
        }
        if self.is_deconstructing() {
            return Ok(ConstructionChange::Deconstructed);
        }
        Ok(ConstructionChange::Changed)
    }

    /// Construction progress in `[0, 1]`, used to size the materials loot.
    pub fn progress(&self) -> f64 {
        self.current as f64 / self.max as f64
    }
}
