//! Core-use state machine.
//!
//! Decides whether a consuming node may run its active cycle, purely from
//! its stored core energy:
//!
//! ```text
//! DelayedStart --(timer, enough core)--> Active
//! DelayedStart --(timer, not enough)---> WarmUp
//! WarmUp --(stored ratio >= kick-start)--> Active
//! Active --(stored < demand or < minimum)--> WarmUp
//! ```
//!
//! Delayed-start timers are randomised by the engine so a freshly loaded
//! zone does not evaluate every node on the same tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, Ticks, ratio};
use crate::id::*;
use crate::node::Gauge;

// ---------------------------------------------------------------------------
// Active cycle behaviour
// ---------------------------------------------------------------------------

/// What a node does with an Active cycle: run production, fire a weapon.
///
/// Registered per node type on the engine. Nodes whose type has no
/// registered behaviour still consume their static demand.
pub trait ActiveCycle: Send {
    /// Per-cycle consumption for `node`, or `None` for the type's static
    /// demand.
    fn demand(&self, _node: NodeId) -> Option<Fixed64> {
        None
    }

    fn run(&mut self, ctx: &CycleContext);
}

/// Handed to [`ActiveCycle::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleContext {
    pub node: NodeId,
    pub node_type: NodeTypeId,
    pub owner: OwnerId,
    pub zone: ZoneId,
    pub consumed: Fixed64,
    pub tick: Ticks,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorePhase {
    DelayedStart,
    WarmUp,
    Active,
}

/// Persistable view of a [`CoreUse`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoreUseSnapshot {
    pub phase: CorePhase,
    pub last_used: Fixed64,
}

/// Per-node parameters, resolved from the node type and tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreUseParams {
    pub core_minimum: Fixed64,
    pub kick_start_ratio: Fixed64,
    pub static_demand: Fixed64,
    pub cycle: Duration,
}

/// Result of one [`CoreUse::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoreUseOutcome {
    /// No timer expired, or WarmUp stayed WarmUp.
    Idle,
    EnteredActive,
    EnteredWarmUp,
    /// An Active cycle consumed `consumed` core; the caller runs the node's
    /// active-cycle behaviour if the node is fully constructed and online.
    Cycle { consumed: Fixed64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreUse {
    phase: CorePhase,
    /// Time left until the current phase is evaluated again.
    timer: Duration,
    last_used: Fixed64,
}

impl CoreUse {
    /// Start in DelayedStart with the given (already randomised) delay.
    pub fn new(start_delay: Duration) -> Self {
        Self {
            phase: CorePhase::DelayedStart,
            timer: start_delay,
            last_used: Fixed64::ZERO,
        }
    }

    pub fn phase(&self) -> CorePhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == CorePhase::Active
    }

    /// Core consumed by the most recent cycle.
    pub fn last_used(&self) -> Fixed64 {
        self.last_used
    }

    pub fn snapshot(&self) -> CoreUseSnapshot {
        CoreUseSnapshot {
            phase: self.phase,
            last_used: self.last_used,
        }
    }

    /// Force WarmUp; the next evaluation happens one cycle from now.
    pub fn to_warm_up(&mut self, cycle: Duration) {
        self.phase = CorePhase::WarmUp;
        self.timer = cycle;
        self.last_used = Fixed64::ZERO;
    }

    /// Force Active; the first consumption happens one cycle from now.
    pub fn to_active(&mut self, cycle: Duration) {
        self.phase = CorePhase::Active;
        self.timer = cycle;
    }

    /// Advance the machine by `dt`.
    ///
    /// `demand` is only called when an Active cycle is due; it returns the
    /// node's dynamic consumption, or the static fallback.
    pub fn update(
        &mut self,
        dt: Duration,
        core: &mut Gauge,
        params: &CoreUseParams,
        demand: impl FnOnce() -> Fixed64,
    ) -> CoreUseOutcome {
        self.timer = self.timer.saturating_sub(dt);
        if !self.timer.is_zero() {
            return CoreUseOutcome::Idle;
        }
        self.timer = params.cycle;

        match self.phase {
            CorePhase::DelayedStart => {
                if core.current() >= params.core_minimum {
                    self.phase = CorePhase::Active;
                    CoreUseOutcome::EnteredActive
                } else {
                    self.phase = CorePhase::WarmUp;
                    CoreUseOutcome::EnteredWarmUp
                }
            }
            CorePhase::WarmUp => {
                if ratio(core.current(), core.max()) >= params.kick_start_ratio {
                    self.phase = CorePhase::Active;
                    CoreUseOutcome::EnteredActive
                } else {
                    self.last_used = Fixed64::ZERO;
                    CoreUseOutcome::Idle
                }
            }
            CorePhase::Active => {
                let demand = demand().max(Fixed64::ZERO);
                if core.current() < demand || core.current() < params.core_minimum {
                    self.phase = CorePhase::WarmUp;
                    self.last_used = Fixed64::ZERO;
                    return CoreUseOutcome::EnteredWarmUp;
                }
                core.take(demand);
                self.last_used = demand;
                CoreUseOutcome::Cycle { consumed: demand }
            }
        }
    }
}
