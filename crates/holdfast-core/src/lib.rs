//! Holdfast Core -- the simulation engine for persistent-world structure
//! networks.
//!
//! Players deploy structures (nodes) and link them with weighted, directed
//! connections. Bases and core pumps push energy through the network,
//! production buildings and turrets consume it, damaged structures enter a
//! wall-clock reinforcement window, and networks cut off from every base are
//! orphaned.
//!
//! # Six-Phase Tick Pipeline
//!
//! Each call to [`engine::Engine::update`] advances the simulation by one
//! tick through the following phases:
//!
//! 1. **Pre-tick** -- Drain graph changes and re-evaluate orphaned networks.
//! 2. **Pump** -- Online, built pumping nodes distribute core energy.
//! 3. **Core use** -- Consumers advance DelayedStart / WarmUp / Active.
//! 4. **Reinforce** -- Periodic checks of reinforcement windows.
//! 5. **Post-tick** -- Deliver events and dispatch background jobs
//!    (persistence, structure log, notifications).
//! 6. **Bookkeeping** -- Increment tick counter and compute the state hash.
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Main simulation engine and pipeline orchestrator.
//! - [`graph::ConnectionGraph`] -- Directed graph of nodes and weighted
//!   connections; networks are its weakly connected components.
//! - [`node::Node`] -- Per-node state: construction, core, armor, flags.
//! - [`reinforce::Reinforcement`] -- Normal / Reinforced / Vulnerable.
//! - [`core_use::CoreUse`] -- Energy consumption state machine.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`registry::Registry`] -- Immutable registry of node types.
//! - [`collab::Collaborators`] -- Persistence, notifications, loot, log,
//!   clock and task spawner.
//! - [`event::EventBus`] -- Typed event bus with buffered delivery.
//! - [`serialize`] -- Versioned world snapshots via bitcode.

pub mod background;
pub mod clock;
pub mod collab;
pub mod construction;
pub mod core_use;
pub mod dirty;
pub mod engine;
pub mod error;
pub mod event;
pub mod fixed;
pub mod graph;
pub mod id;
pub mod node;
pub mod orphan;
pub mod persist;
pub mod pump;
pub mod registry;
pub mod reinforce;
pub mod rng;
pub mod serialize;
pub mod sim;
pub mod tuning;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
