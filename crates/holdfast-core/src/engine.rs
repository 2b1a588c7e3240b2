//! The simulation engine: owns the connection graph and per-node state, and
//! orchestrates the six-phase tick pipeline.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - A [`ConnectionGraph`] (nodes = structures, connections = energy links)
//! - Per-node state ([`Node`]) and per-node background guards
//! - The [`OrphanDetector`] and the persistence [`DirtyTracker`]
//! - A [`SimState`] (tick counter, elapsed time) and a deterministic [`SimRng`]
//! - An [`EventBus`] for typed simulation events
//! - The [`Collaborators`] bundle (persistence, notifications, loot, log,
//!   clock, task spawner)
//!
//! # Six-Phase Pipeline
//!
//! Each [`Engine::update`] runs:
//! 1. **Pre-tick** -- drain graph changes, re-evaluate orphaned networks
//! 2. **Pump** -- every online, built pumping node distributes core energy
//! 3. **Core use** -- consuming nodes advance their core-use state machine
//! 4. **Reinforce** -- periodic reinforcement checks against the wall clock
//! 5. **Post-tick** -- deliver events, dispatch log entries, notifications
//!    and throttled persistence as background jobs
//! 6. **Bookkeeping** -- advance the tick counter, compute the state hash
//!
//! Request operations (`apply_damage`, `take_over`, ...) run between ticks,
//! validate synchronously and return a [`NodeError`] on rejection.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use slotmap::SecondaryMap;

use crate::background::{NodeFlights, SingleFlight};
use crate::collab::{Collaborators, GatewayError, LogEntry, LogKind, LootRequest, NodeUpdate, UpdateKind};
use crate::construction::{ConstructionChange, ConstructionLevel};
use crate::core_use::{ActiveCycle, CoreUse, CoreUseOutcome, CycleContext};
use crate::dirty::DirtyTracker;
use crate::error::NodeError;
use crate::event::{Event, EventBus};
use crate::fixed::{Fixed64, Ticks, fixed64_to_f64};
use crate::graph::{ConnectionGraph, GraphChange, MAX_WEIGHT};
use crate::id::*;
use crate::node::{Gauge, Node, NodeSnapshot, NodeTuning, Position};
use crate::orphan::OrphanDetector;
use crate::persist::{NodeRecord, PropertyKey, PropertyValue};
use crate::pump::{self, PumpCandidate, PumpParams};
use crate::registry::{NodeTypeDef, Registry};
use crate::reinforce::{ReinforceGate, ReinforceParams, ReinforcePhase, ReinforceTransition, Reinforcement};
use crate::rng::SimRng;
use crate::sim::{SimState, StateHash, TickReport};
use crate::tuning::Tuning;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Parameters for [`Engine::deploy`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    pub node_type: NodeTypeId,
    pub owner: OwnerId,
    pub zone: ZoneId,
    pub position: Position,
    /// Spawn fully built (bases, admin placement) instead of at level 0.
    pub fully_constructed: bool,
    pub actor: Option<OwnerId>,
}

impl DeployRequest {
    pub fn new(node_type: NodeTypeId, owner: OwnerId) -> Self {
        Self {
            node_type,
            owner,
            zone: ZoneId(0),
            position: Position::default(),
            fully_constructed: false,
            actor: None,
        }
    }

    pub fn in_zone(mut self, zone: ZoneId) -> Self {
        self.zone = zone;
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn built(mut self) -> Self {
        self.fully_constructed = true;
        self
    }

    pub fn by(mut self, actor: OwnerId) -> Self {
        self.actor = Some(actor);
        self
    }
}

/// What [`Engine::apply_damage`] did to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    Damaged,
    /// The hit started reinforcement; the node cannot die until `end`.
    Reinforced { end: DateTime<Utc> },
    /// The node was destroyed and removed.
    Killed,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The node-network simulation engine.
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) tuning: Tuning,
    pump_params: PumpParams,
    reinforce_params: ReinforceParams,
    pub(crate) collab: Collaborators,

    pub(crate) graph: ConnectionGraph,

    // -- Per-node state (keyed by NodeId) --
    pub(crate) nodes: SecondaryMap<NodeId, Node>,
    flights: SecondaryMap<NodeId, NodeFlights>,

    /// Active-cycle behaviour per node type.
    active_cycles: HashMap<NodeTypeId, Box<dyn ActiveCycle>>,

    /// Typed event bus for simulation events.
    pub event_bus: EventBus,

    pub(crate) rng: SimRng,
    pub sim_state: SimState,
    last_state_hash: u64,

    pub(crate) orphans: OrphanDetector,
    pub(crate) dirty: DirtyTracker,

    // -- Outbox, flushed in post-tick --
    pending_logs: Vec<LogEntry>,
    pending_updates: BTreeMap<NodeId, UpdateKind>,
    pending_removed: Vec<(OwnerId, NodeUpdate)>,
    /// Nodes whose last save job failed; written by the job itself.
    pub(crate) failed_saves: Arc<Mutex<Vec<NodeId>>>,
    /// Loot that could not be placed; retried in post-tick.
    failed_loot: Arc<Mutex<Vec<LootRequest>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tick", &self.sim_state.tick)
            .field("nodes", &self.nodes.len())
            .field("connections", &self.graph.connection_count())
            .field("last_state_hash", &self.last_state_hash)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine for an empty world.
    pub fn new(registry: Registry, tuning: Tuning, collab: Collaborators) -> Self {
        Self::with_detector(registry, tuning, collab, OrphanDetector::loaded())
    }

    pub(crate) fn with_detector(
        registry: Registry,
        tuning: Tuning,
        collab: Collaborators,
        orphans: OrphanDetector,
    ) -> Self {
        Self {
            pump_params: PumpParams::from_tuning(&tuning),
            reinforce_params: ReinforceParams::from_tuning(&tuning),
            rng: SimRng::new(tuning.rng_seed),
            registry,
            tuning,
            collab,
            graph: ConnectionGraph::new(),
            nodes: SecondaryMap::new(),
            flights: SecondaryMap::new(),
            active_cycles: HashMap::new(),
            event_bus: EventBus::default(),
            sim_state: SimState::new(),
            last_state_hash: 0,
            orphans,
            dirty: DirtyTracker::new(),
            pending_logs: Vec::new(),
            pending_updates: BTreeMap::new(),
            pending_removed: Vec::new(),
            failed_saves: Arc::new(Mutex::new(Vec::new())),
            failed_loot: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register the active-cycle behaviour for a node type.
    pub fn register_active_cycle(&mut self, node_type: NodeTypeId, behaviour: Box<dyn ActiveCycle>) {
        self.active_cycles.insert(node_type, behaviour);
    }

    /// Every node is in place; the next tick re-evaluates every network's
    /// orphan state.
    pub fn mark_all_loaded(&mut self) {
        tracing::info!(nodes = self.nodes.len(), "all nodes loaded");
        self.orphans.mark_all_loaded();
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    pub(crate) fn build_node(
        &mut self,
        def: &NodeTypeDef,
        node_type: NodeTypeId,
        owner: OwnerId,
        zone: ZoneId,
        position: Position,
        fully_constructed: bool,
    ) -> Node {
        let tuning = NodeTuning::resolve(def, &self.tuning);
        let construction = if fully_constructed || !def.class.has_construction_level() {
            ConstructionLevel::fully_constructed(def.construction_max)
        } else {
            ConstructionLevel::new(def.construction_max)
        };
        let core_use = def.class.consumes_energy().then(|| {
            let (min, max) = self.tuning.delayed_start_window();
            CoreUse::new(self.rng.duration_between(min, max))
        });
        let now = self.collab.clock.now();

        Node {
            node_type,
            class: def.class,
            owner,
            position,
            zone,
            construction,
            core: Gauge::empty(def.core_max),
            armor: Gauge::full(def.armor_max),
            online: true,
            orphaned: false,
            reinforcement: Reinforcement::new(tuning.reinforce_counter_max, now, &self.reinforce_params),
            core_use,
            last_used_core: Fixed64::ZERO,
            pvp_exposed_until: None,
            tuning,
        }
    }

    pub(crate) fn insert_node(&mut self, id: NodeId, node: Node) {
        self.nodes.insert(id, node);
        self.flights.insert(id, NodeFlights::default());
    }

    /// Place a new node. It joins orphan detection on the next tick.
    pub fn deploy(&mut self, request: DeployRequest) -> NodeId {
        let def = self.registry.get_or_fallback(request.node_type);
        let id = self.graph.add_node(request.node_type);
        let node = self.build_node(
            &def,
            request.node_type,
            request.owner,
            request.zone,
            request.position,
            request.fully_constructed,
        );
        self.insert_node(id, node);

        tracing::info!(node = ?id, node_type = %def.name, owner = request.owner.0, "node deployed");
        self.push_log(id, LogKind::Deployed, request.actor, None);
        self.event_bus.emit(Event::NodeDeployed {
            node: id,
            node_type: request.node_type,
            owner: request.owner,
            tick: self.sim_state.tick,
        });
        self.orphans.touch(id);
        self.dirty.mark_node(id);
        self.queue_update(id, UpdateKind::Details);
        id
    }

    /// Administrative removal: no loot, no log entry.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), NodeError> {
        self.node_ref(id)?;
        tracing::info!(node = ?id, "node removed");
        self.remove_node_state(id);
        Ok(())
    }

    /// Purge a node from every per-node map, the graph and storage.
    fn remove_node_state(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.flights.remove(id);
        self.dirty.purge(id);
        self.pending_updates.remove(&id);
        self.graph.remove_node(id);

        self.pending_removed.push((
            node.owner,
            NodeUpdate {
                kind: UpdateKind::Removed,
                snapshot: node.snapshot(id),
                zone: node.zone,
            },
        ));
        let gateway = Arc::clone(&self.collab.gateway);
        self.collab
            .spawner
            .spawn("forget-node", Box::new(move || gateway.remove_node(id)));
        self.event_bus.emit(Event::NodeRemoved {
            node: id,
            tick: self.sim_state.tick,
        });
        Some(node)
    }

    /// Deconstruction side effects. Runs at most once per node.
    pub(crate) fn deconstruct(&mut self, id: NodeId, progress: f64) {
        let Some(flights) = self.flights.get(id) else {
            return;
        };
        if !flights.deconstruct.fire() {
            return;
        }
        let Some(node) = self.nodes.get(id) else {
            return;
        };

        let capsule = node.tuning.capsule_item;
        let request = LootRequest {
            node: id,
            node_type: node.node_type,
            owner: node.owner,
            zone: node.zone,
            position: node.position,
            capsule_item: capsule,
            progress: progress.clamp(0.0, 1.0),
        };
        self.spawn_loot(request);

        tracing::info!(node = ?id, "node deconstructed");
        self.push_log(id, LogKind::Deconstructed, None, Some(capsule));
        self.event_bus.emit(Event::Deconstructed {
            node: id,
            tick: self.sim_state.tick,
        });
        self.remove_node_state(id);
    }

    /// Place loot in the background. A failed or panicking job queues the
    /// request again for the next post-tick.
    fn spawn_loot(&self, request: LootRequest) {
        let loot = Arc::clone(&self.collab.loot);
        let failed_loot = Arc::clone(&self.failed_loot);
        self.collab.spawner.spawn(
            "loot",
            Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(|| loot.create_loot(&request)))
                    .unwrap_or_else(|_| Err(GatewayError::Other("loot factory panicked".into())));
                match result {
                    Ok(dropped) => {
                        tracing::debug!(node = ?request.node, items = dropped.items.len(), "loot placed");
                        Ok(())
                    }
                    Err(err) => {
                        if let Ok(mut failed) = failed_loot.lock() {
                            failed.push(request);
                        }
                        Err(err)
                    }
                }
            }),
        );
    }

    fn retry_loot(&mut self) {
        let failed: Vec<LootRequest> = match self.failed_loot.lock() {
            Ok(mut failed) => std::mem::take(&mut *failed),
            Err(_) => Vec::new(),
        };
        for request in failed {
            tracing::warn!(node = ?request.node, "retrying loot placement");
            self.spawn_loot(request);
        }
    }

    fn kill(&mut self, id: NodeId, actor: Option<OwnerId>) {
        tracing::info!(node = ?id, actor = ?actor, "node killed");
        self.push_log(id, LogKind::Killed, actor, None);
        self.event_bus.emit(Event::Killed {
            node: id,
            actor,
            tick: self.sim_state.tick,
        });
        self.remove_node_state(id);
    }

    // -----------------------------------------------------------------------
    // Request operations
    // -----------------------------------------------------------------------

    /// Charge construction points. Reaching zero while tearing down (or
    /// `force`) deconstructs and removes the node.
    ///
    /// Nodes without a construction level reject non-forced charges as
    /// [`NodeError::ConstructionLevelMaxReached`].
    pub fn modify_construction_level(
        &mut self,
        id: NodeId,
        amount: i32,
        force: bool,
    ) -> Result<ConstructionChange, NodeError> {
        let node = self.nodes.get_mut(id).ok_or(NodeError::NodeNotFound(id))?;
        if !node.class.has_construction_level() && !force {
            return Err(NodeError::ConstructionLevelMaxReached);
        }
        let progress = node.construction.progress();
        let change = node.construction.modify(amount, force)?;
        self.dirty.mark_node(id);

        match change {
            ConstructionChange::Changed => self.queue_update(id, UpdateKind::Status),
            ConstructionChange::FullyConstructed => {
                tracing::info!(node = ?id, "node fully constructed");
                self.push_log(id, LogKind::Constructed, None, None);
                self.event_bus.emit(Event::Constructed {
                    node: id,
                    tick: self.sim_state.tick,
                });
                self.queue_update(id, UpdateKind::Details);
            }
            ConstructionChange::Deconstructed => self.deconstruct(id, progress),
        }
        Ok(change)
    }

    /// Switch a node on or off.
    ///
    /// Owner requests to go online are refused while an offline-when-
    /// reinforced node is reinforced, and (with `check_network_has_base`)
    /// while its network has no base. Server-forced changes skip all checks.
    pub fn set_online_status(
        &mut self,
        id: NodeId,
        state: bool,
        check_network_has_base: bool,
        forced_by_server: bool,
    ) -> Result<(), NodeError> {
        let node = self.node_ref(id)?;
        if state && !forced_by_server {
            if node.tuning.offline_when_reinforced && node.is_reinforced() {
                return Err(NodeError::NotPossibleDuringReinforce);
            }
            if check_network_has_base && !self.network_has_base(id) {
                return Err(NodeError::NoBaseInNetwork);
            }
        }
        self.apply_online(id, state);
        Ok(())
    }

    /// Transfer the node's whole network to `new_owner`. Clears orphan flags;
    /// the next tick re-evaluates them.
    ///
    /// Refused while any node of the network is reinforced. Returns the
    /// nodes that were transferred.
    pub fn take_over(&mut self, id: NodeId, new_owner: OwnerId) -> Result<Vec<NodeId>, NodeError> {
        self.node_ref(id)?;
        let network = self.graph.network(id);
        if network
            .iter()
            .any(|&m| self.nodes.get(m).is_some_and(Node::is_reinforced))
        {
            return Err(NodeError::NetworkHasReinforcedNode);
        }

        let tick = self.sim_state.tick;
        for &member in &network {
            let Some(node) = self.nodes.get_mut(member) else {
                continue;
            };
            let previous = node.owner;
            node.owner = new_owner;
            node.orphaned = false;
            let zone = node.zone;
            let snapshot = node.snapshot(member);
            self.dirty.mark_node(member);
            self.orphans.touch(member);

            if previous != new_owner {
                self.pending_removed.push((
                    previous,
                    NodeUpdate {
                        kind: UpdateKind::Removed,
                        snapshot,
                        zone,
                    },
                ));
                self.event_bus.emit(Event::OwnerChanged {
                    node: member,
                    previous,
                    owner: new_owner,
                    tick,
                });
            }
            tracing::info!(node = ?member, previous = previous.0, owner = new_owner.0, "node taken over");
            self.push_log(member, LogKind::TakeOver, Some(new_owner), None);
            self.queue_update(member, UpdateKind::Details);
        }
        Ok(network)
    }

    /// Set the daily reinforcement offset hour on every node of the network.
    pub fn set_reinforce_offset(&mut self, id: NodeId, hour: u8) -> Result<(), NodeError> {
        self.node_ref(id)?;
        let network = self.graph.network(id);
        if network
            .iter()
            .any(|&m| self.nodes.get(m).is_some_and(Node::is_reinforced))
        {
            return Err(NodeError::NotPossibleDuringReinforce);
        }
        if hour > 23 {
            return Err(NodeError::InvalidOffset(hour));
        }
        for member in network {
            if let Some(node) = self.nodes.get_mut(member) {
                node.reinforcement.set_offset_hour(hour);
                self.dirty.mark_node(member);
            }
        }
        tracing::debug!(node = ?id, hour, "reinforce offset set");
        Ok(())
    }

    /// Push the node's current state to its owner now.
    pub fn send_node_update(&mut self, id: NodeId, kind: UpdateKind) -> Result<(), NodeError> {
        let node = self.node_ref(id)?;
        let owner = node.owner;
        let update = NodeUpdate {
            kind,
            snapshot: node.snapshot(id),
            zone: node.zone,
        };
        let flight = self.flights.get(id).map(|f| Arc::clone(&f.notify));
        if !self.send_update(owner, update, flight.as_ref()) {
            self.queue_update(id, kind);
        }
        Ok(())
    }

    /// Reduce armor, possibly starting reinforcement or killing the node.
    ///
    /// The reinforcement check runs first: a hit that drops a Normal node
    /// below the threshold reinforces it even if armor reached zero.
    pub fn apply_damage(
        &mut self,
        id: NodeId,
        amount: Fixed64,
        actor: Option<OwnerId>,
    ) -> Result<DamageOutcome, NodeError> {
        let node = self.nodes.get_mut(id).ok_or(NodeError::NodeNotFound(id))?;
        node.armor.take(amount);
        let gate = ReinforceGate {
            armor_ratio: node.armor.ratio(),
            reinforceable: node.class.is_reinforceable(),
            fully_constructed: node.is_fully_constructed(),
            orphaned: node.orphaned,
        };
        let enter = node.reinforcement.should_enter(&gate, &self.reinforce_params);
        let killable = node.armor.is_empty() && node.can_be_killed();
        self.dirty.mark_node(id);

        if enter {
            let end = self.enter_reinforce(id).ok_or(NodeError::NodeNotFound(id))?;
            return Ok(DamageOutcome::Reinforced { end });
        }
        if killable {
            self.kill(id, actor);
            return Ok(DamageOutcome::Killed);
        }
        self.queue_update(id, UpdateKind::Status);
        Ok(DamageOutcome::Damaged)
    }

    /// Restore armor. Returns the amount actually added.
    pub fn repair(&mut self, id: NodeId, amount: Fixed64) -> Result<Fixed64, NodeError> {
        let node = self.nodes.get_mut(id).ok_or(NodeError::NodeNotFound(id))?;
        let added = node.armor.add(amount);
        self.dirty.mark_node(id);
        self.queue_update(id, UpdateKind::Status);
        Ok(added)
    }

    /// Load core energy into a node (players refuelling a base or pump).
    /// Returns the amount accepted; the rest does not fit.
    pub fn insert_core(&mut self, id: NodeId, amount: Fixed64) -> Result<Fixed64, NodeError> {
        let node = self.nodes.get_mut(id).ok_or(NodeError::NodeNotFound(id))?;
        if !node.class.accepts_energy() {
            return Ok(Fixed64::ZERO);
        }
        let added = node.core.add(amount);
        self.dirty.mark_node(id);
        self.queue_update(id, UpdateKind::Status);
        Ok(added)
    }

    pub fn connect(&mut self, source: NodeId, target: NodeId, weight: f64) -> Result<ConnectionId, NodeError> {
        let weight = checked_weight(weight)?;
        let connection = self.graph.add_connection(source, target, weight)?;
        tracing::debug!(connection = ?connection, source = ?source, target = ?target, "connected");
        Ok(connection)
    }

    pub fn disconnect(&mut self, connection: ConnectionId) -> Result<(), NodeError> {
        self.graph.remove_connection(connection)?;
        tracing::debug!(connection = ?connection, "disconnected");
        Ok(())
    }

    pub fn set_connection_weight(&mut self, connection: ConnectionId, weight: f64) -> Result<(), NodeError> {
        let weight = checked_weight(weight)?;
        self.graph.set_weight(connection, weight)?;
        Ok(())
    }

    /// Force a consuming node into WarmUp. No-op for other classes.
    pub fn to_warm_up(&mut self, id: NodeId) -> Result<(), NodeError> {
        let tick = self.sim_state.tick;
        let node = self.nodes.get_mut(id).ok_or(NodeError::NodeNotFound(id))?;
        let cycle = node.tuning.core_use_cycle;
        if let Some(core_use) = node.core_use.as_mut() {
            core_use.to_warm_up(cycle);
            self.event_bus.emit(Event::CorePhaseChanged {
                node: id,
                phase: core_use.phase(),
                tick,
            });
        }
        Ok(())
    }

    /// Force a consuming node into Active. No-op for other classes.
    pub fn to_active(&mut self, id: NodeId) -> Result<(), NodeError> {
        let tick = self.sim_state.tick;
        let node = self.nodes.get_mut(id).ok_or(NodeError::NodeNotFound(id))?;
        let cycle = node.tuning.core_use_cycle;
        if let Some(core_use) = node.core_use.as_mut() {
            core_use.to_active(cycle);
            self.event_bus.emit(Event::CorePhaseChanged {
                node: id,
                phase: core_use.phase(),
                tick,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal state transitions
    // -----------------------------------------------------------------------

    /// Enter reinforcement, adopting the end time of the closest reinforced
    /// node in the same network. Returns the end time.
    fn enter_reinforce(&mut self, id: NodeId) -> Option<DateTime<Utc>> {
        let now = self.collab.clock.now();
        let adopted = self
            .graph
            .network(id)
            .into_iter()
            .filter(|&m| m != id)
            .filter_map(|m| self.nodes.get(m).and_then(|n| n.reinforcement.reinforce_end()))
            .find(|end| *end > now);

        let node = self.nodes.get_mut(id)?;
        let transition = node.reinforcement.enter(now, adopted, &self.reinforce_params);
        let end = node.reinforcement.reinforce_end()?;
        let go_offline = node.tuning.offline_when_reinforced && node.online;
        self.dirty.mark_node(id);
        self.on_reinforce_transition(id, transition);
        if go_offline {
            self.apply_online(id, false);
        }
        Some(end)
    }

    fn on_reinforce_transition(&mut self, id: NodeId, transition: ReinforceTransition) {
        let tick = self.sim_state.tick;
        match transition {
            ReinforceTransition::Started { end, adopted } => {
                tracing::info!(node = ?id, %end, adopted, "reinforcement started");
                self.push_log(id, LogKind::ReinforceStart, None, None);
                self.event_bus.emit(Event::ReinforceStarted { node: id, end, tick });
                self.queue_update(id, UpdateKind::Status);
            }
            ReinforceTransition::Ended => {
                tracing::info!(node = ?id, "reinforcement ended");
                self.push_log(id, LogKind::ReinforceEnd, None, None);
                self.event_bus.emit(Event::ReinforceEnded { node: id, tick });
                self.queue_update(id, UpdateKind::Status);
            }
            ReinforceTransition::VulnerableStarted { end } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.pvp_exposed_until = Some(end);
                }
                tracing::info!(node = ?id, %end, "node vulnerable");
                self.push_log(id, LogKind::VulnerableStart, None, None);
                self.event_bus.emit(Event::VulnerableStarted { node: id, end, tick });
                self.queue_update(id, UpdateKind::Status);
            }
            ReinforceTransition::VulnerableEnded => {
                tracing::info!(node = ?id, "vulnerability ended");
                self.push_log(id, LogKind::VulnerableEnd, None, None);
                self.event_bus.emit(Event::VulnerableEnded { node: id, tick });
                self.queue_update(id, UpdateKind::Status);
            }
            ReinforceTransition::CounterIncreased { counter } => {
                tracing::debug!(node = ?id, counter, "reinforce counter increased");
            }
        }
    }

    /// Set the online flag without validation. Returns whether it changed.
    fn apply_online(&mut self, id: NodeId, state: bool) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.online == state {
            return false;
        }
        node.online = state;
        self.dirty.mark_node(id);

        tracing::debug!(node = ?id, online = state, "online status changed");
        let kind = if state { LogKind::Online } else { LogKind::Offline };
        self.push_log(id, kind, None, None);
        self.event_bus.emit(Event::OnlineChanged {
            node: id,
            online: state,
            tick: self.sim_state.tick,
        });
        self.queue_update(id, UpdateKind::Status);
        true
    }

    fn set_orphaned(&mut self, id: NodeId, orphaned: bool) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.orphaned == orphaned {
            return;
        }
        node.orphaned = orphaned;
        let cancelled = orphaned && node.reinforcement.cancel();
        self.dirty.mark_node(id);
        let tick = self.sim_state.tick;

        if orphaned {
            tracing::info!(node = ?id, "node orphaned");
            self.push_log(id, LogKind::GotOrphaned, None, None);
            self.event_bus.emit(Event::Orphaned { node: id, tick });
            self.apply_online(id, false);
            if cancelled {
                self.on_reinforce_transition(id, ReinforceTransition::Ended);
            }
        } else {
            tracing::info!(node = ?id, "node connected to a base");
            self.push_log(id, LogKind::GotConnected, None, None);
            self.event_bus.emit(Event::Reconnected { node: id, tick });
        }
        self.queue_update(id, UpdateKind::Status);
    }

    fn push_log(&mut self, id: NodeId, kind: LogKind, actor: Option<OwnerId>, material: Option<ItemTypeId>) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        self.pending_logs.push(LogEntry {
            kind,
            node: id,
            node_type: node.node_type,
            owner: node.owner,
            actor,
            zone: node.zone,
            material,
            at: self.collab.clock.now(),
        });
    }

    /// Queue a notification for post-tick. Details supersede Status.
    fn queue_update(&mut self, id: NodeId, kind: UpdateKind) {
        self.pending_updates
            .entry(id)
            .and_modify(|queued| {
                if kind == UpdateKind::Details {
                    *queued = kind;
                }
            })
            .or_insert(kind);
    }

    /// Hand an update to the notifier. `false` if the node's notify flight
    /// is still busy.
    fn send_update(&self, owner: OwnerId, update: NodeUpdate, flight: Option<&Arc<SingleFlight>>) -> bool {
        let guard = match flight {
            Some(flight) => match flight.try_acquire() {
                Some(guard) => Some(guard),
                None => return false,
            },
            None => None,
        };
        let notifier = Arc::clone(&self.collab.notifier);
        self.collab.spawner.spawn(
            "notify",
            Box::new(move || {
                let _guard = guard;
                notifier.notify(owner, &update)
            }),
        );
        true
    }

    fn network_has_base(&self, id: NodeId) -> bool {
        self.graph
            .network(id)
            .iter()
            .any(|&m| self.nodes.get(m).is_some_and(|n| n.class.is_base()))
    }

    fn node_ref(&self, id: NodeId) -> Result<&Node, NodeError> {
        self.nodes.get(id).ok_or(NodeError::NodeNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Tick pipeline
    // -----------------------------------------------------------------------

    /// Run one tick covering `dt` of simulated time.
    pub fn update(&mut self, dt: Duration) -> TickReport {
        let mut report = TickReport {
            tick: self.sim_state.tick,
            ..TickReport::default()
        };
        self.phase_pre_tick(&mut report);
        self.phase_pump(&mut report);
        self.phase_core_use(dt, &mut report);
        self.phase_reinforce(dt, &mut report);
        self.phase_post_tick(&mut report);
        self.phase_bookkeeping(dt, &mut report);
        report
    }

    /// Phase 1: drain topology changes and update orphan state.
    fn phase_pre_tick(&mut self, report: &mut TickReport) {
        let tick = self.sim_state.tick;
        let changes = self.graph.drain_changes();
        report.graph_changes = changes.len();

        for change in &changes {
            self.orphans.observe(change);
            match *change {
                GraphChange::ConnectionAdded {
                    connection,
                    source,
                    target,
                } => {
                    self.dirty.mark_weight(connection);
                    self.event_bus.emit(Event::ConnectionAdded {
                        connection,
                        source,
                        target,
                        tick,
                    });
                }
                GraphChange::ConnectionRemoved {
                    connection,
                    source,
                    target,
                } => {
                    self.event_bus.emit(Event::ConnectionRemoved {
                        connection,
                        source,
                        target,
                        tick,
                    });
                }
                GraphChange::WeightChanged { connection, .. } => self.dirty.mark_weight(connection),
            }
        }

        if !self.orphans.has_pending_work() {
            return;
        }
        let nodes = &self.nodes;
        let evaluated = self
            .orphans
            .evaluate(&self.graph, |n| nodes.get(n).is_some_and(|node| node.class.is_base()));
        for (id, orphaned) in evaluated {
            self.set_orphaned(id, orphaned);
        }
    }

    /// Phase 2: core pump.
    fn phase_pump(&mut self, report: &mut TickReport) {
        let tick = self.sim_state.tick;
        let sources: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.class.pumps_energy())
            .map(|(id, _)| id)
            .collect();

        for id in sources {
            let Some(source) = self.nodes.get(id) else {
                continue;
            };
            if !source.online || !source.is_fully_constructed() {
                continue;
            }
            let outs = self.graph.out_connections(id);
            if outs.is_empty() {
                continue;
            }
            let candidates: Vec<PumpCandidate> = outs
                .iter()
                .filter_map(|&connection| {
                    let data = self.graph.get_connection(connection)?;
                    let target = self.nodes.get(data.target)?;
                    if !target.class.accepts_energy() || target.is_deconstructing() {
                        return None;
                    }
                    Some(PumpCandidate {
                        connection,
                        target: data.target,
                        weight: data.weight,
                        need: target.core.free(),
                    })
                })
                .collect();
            let core_transferred = source.tuning.core_transferred;
            let efficiency = source.tuning.transfer_efficiency;

            let Some(source) = self.nodes.get_mut(id) else {
                continue;
            };
            let outcome = pump::distribute(
                &mut source.core,
                core_transferred,
                efficiency,
                &candidates,
                &self.pump_params,
            );
            source.last_used_core = outcome.drawn;
            if outcome.transfers.is_empty() {
                continue;
            }

            self.dirty.mark_node(id);
            for transfer in outcome.transfers {
                if let Some(target) = self.nodes.get_mut(transfer.target) {
                    target.core.add(transfer.effective);
                }
                self.dirty.mark_node(transfer.target);
                self.event_bus.emit(Event::CoreTransferred {
                    connection: transfer.connection,
                    source: id,
                    target: transfer.target,
                    raw: transfer.raw,
                    effective: transfer.effective,
                    tick,
                });
                report.transfers += 1;
            }
        }
    }

    /// Phase 3: core-use state machines and active cycles.
    fn phase_core_use(&mut self, dt: Duration, report: &mut TickReport) {
        let tick = self.sim_state.tick;
        let consumers: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.core_use.is_some())
            .map(|(id, _)| id)
            .collect();

        for id in consumers {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            let params = node.tuning.core_use_params();
            let behaviour = self.active_cycles.get(&node.node_type);
            let Some(core_use) = node.core_use.as_mut() else {
                continue;
            };
            let outcome = core_use.update(dt, &mut node.core, &params, || {
                behaviour
                    .and_then(|b| b.demand(id))
                    .unwrap_or(params.static_demand)
            });
            let phase = core_use.phase();
            let eligible = node.online && node.is_fully_constructed();
            let ctx = CycleContext {
                node: id,
                node_type: node.node_type,
                owner: node.owner,
                zone: node.zone,
                consumed: Fixed64::ZERO,
                tick,
            };

            match outcome {
                CoreUseOutcome::Idle => {}
                CoreUseOutcome::EnteredActive | CoreUseOutcome::EnteredWarmUp => {
                    tracing::debug!(node = ?id, phase = ?phase, "core use phase changed");
                    self.event_bus.emit(Event::CorePhaseChanged { node: id, phase, tick });
                }
                CoreUseOutcome::Cycle { consumed } => {
                    self.dirty.mark_node(id);
                    if eligible {
                        if let Some(behaviour) = self.active_cycles.get_mut(&ctx.node_type) {
                            behaviour.run(&CycleContext { consumed, ..ctx });
                        }
                        report.active_cycles += 1;
                    }
                }
            }
        }
    }

    /// Phase 4: periodic reinforcement checks.
    fn phase_reinforce(&mut self, dt: Duration, report: &mut TickReport) {
        let now = self.collab.clock.now();
        let ids: Vec<NodeId> = self.nodes.keys().collect();
        for id in ids {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            let Some(transition) = node.reinforcement.update(dt, now, &self.reinforce_params) else {
                continue;
            };
            report.reinforce_transitions += 1;
            self.dirty.mark_node(id);
            self.on_reinforce_transition(id, transition);
        }
    }

    /// Phase 5: deliver events and dispatch background work.
    fn phase_post_tick(&mut self, report: &mut TickReport) {
        self.event_bus.deliver();
        self.dispatch_logs();
        self.dispatch_updates();
        self.retry_loot();
        report.saves_dispatched = self.dispatch_saves(false);
    }

    /// Phase 6: tick counter and state hash.
    fn phase_bookkeeping(&mut self, dt: Duration, report: &mut TickReport) {
        self.sim_state.advance(dt);
        self.last_state_hash = self.compute_state_hash();
        report.state_hash = self.last_state_hash;
    }

    /// Dispatch everything outstanding now, ignoring the save interval.
    pub fn flush(&mut self) -> usize {
        self.dispatch_logs();
        self.dispatch_updates();
        self.retry_loot();
        self.dispatch_saves(true)
    }

    fn dispatch_logs(&mut self) {
        if self.pending_logs.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.pending_logs);
        let sink = Arc::clone(&self.collab.log);
        self.collab.spawner.spawn(
            "structure-log",
            Box::new(move || {
                for entry in &entries {
                    sink.append(entry)?;
                }
                Ok(())
            }),
        );
    }

    fn dispatch_updates(&mut self) {
        for (owner, update) in std::mem::take(&mut self.pending_removed) {
            self.send_update(owner, update, None);
        }

        let queued = std::mem::take(&mut self.pending_updates);
        for (id, kind) in queued {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let owner = node.owner;
            let update = NodeUpdate {
                kind,
                snapshot: node.snapshot(id),
                zone: node.zone,
            };
            let flight = self.flights.get(id).map(|f| Arc::clone(&f.notify));
            if !self.send_update(owner, update, flight.as_ref()) {
                tracing::warn!(node = ?id, "notification still in flight, retrying next tick");
                self.pending_updates.insert(id, kind);
            }
        }
    }

    /// Write dirty nodes whose save interval elapsed (or all, if `force`).
    fn dispatch_saves(&mut self, force: bool) -> usize {
        let tick = self.sim_state.tick;
        let failed: Vec<NodeId> = match self.failed_saves.lock() {
            Ok(mut failed) => std::mem::take(&mut *failed),
            Err(_) => Vec::new(),
        };
        for id in failed {
            if self.nodes.contains_key(id) {
                self.dirty.mark_node(id);
            }
        }

        let due = if force {
            self.dirty.take_all()
        } else {
            self.dirty.take_due(tick, self.tuning.save_interval_ticks)
        };

        let mut dispatched = 0;
        for id in due {
            let (Some(node), Some(flights)) = (self.nodes.get(id), self.flights.get(id)) else {
                continue;
            };
            let Some(guard) = flights.save.try_acquire() else {
                tracing::warn!(node = ?id, "save still in flight, retrying next interval");
                self.dirty.mark_node(id);
                continue;
            };
            let properties = NodeRecord::capture(node).to_properties();
            let gateway = Arc::clone(&self.collab.gateway);
            let failed_saves = Arc::clone(&self.failed_saves);
            self.collab.spawner.spawn(
                "save-node",
                Box::new(move || {
                    let _guard = guard;
                    let result = gateway.update(id, &properties);
                    if result.is_err() {
                        if let Ok(mut failed) = failed_saves.lock() {
                            failed.push(id);
                        }
                    }
                    result
                }),
            );
            self.dirty.record_saved(id, tick);
            dispatched += 1;
        }

        for connection in self.dirty.take_weights() {
            let Some(data) = self.graph.get_connection(connection) else {
                continue;
            };
            let source = data.source;
            let weight = PropertyValue::Real(fixed64_to_f64(data.weight));
            let gateway = Arc::clone(&self.collab.gateway);
            self.collab.spawner.spawn(
                "save-weight",
                Box::new(move || gateway.save_property(source, PropertyKey::ConnectionWeight(connection), weight)),
            );
        }

        dispatched
    }

    fn compute_state_hash(&self) -> u64 {
        let mut hasher = StateHash::new();
        hasher.write_u64(self.sim_state.tick);
        hasher.write_u64(self.rng.state());
        for (id, node) in &self.nodes {
            hasher.write_u64(node_key(id));
            hasher.write_u64(node.owner.0);
            hasher.write_fixed64(node.core.current());
            hasher.write_fixed64(node.armor.current());
            hasher.write_fixed64(node.last_used_core);
            hasher.write_i64(i64::from(node.construction.current()));
            hasher.write_bool(node.online);
            hasher.write_bool(node.orphaned);
            hasher.write_u32(node.reinforcement.counter());
            match node.reinforcement.phase() {
                ReinforcePhase::Normal => hasher.write_u32(0),
                ReinforcePhase::Reinforced { end } => {
                    hasher.write_u32(1);
                    hasher.write_i64(end.timestamp_millis());
                }
                ReinforcePhase::Vulnerable { end } => {
                    hasher.write_u32(2);
                    hasher.write_i64(end.timestamp_millis());
                }
            }
        }
        for (connection, data) in self.graph.connections() {
            hasher.write_u64(slotmap::Key::data(&connection).as_ffi());
            hasher.write_fixed64(data.weight);
        }
        hasher.finish()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn snapshot_node(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.nodes.get(id).map(|n| n.snapshot(id))
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys()
    }

    pub fn is_reinforced(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(Node::is_reinforced)
    }

    pub fn is_vulnerable(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(Node::is_vulnerable)
    }

    pub fn is_orphaned(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.orphaned)
    }

    pub fn is_online(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.online)
    }

    pub fn can_be_killed(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(Node::can_be_killed)
    }

    pub fn is_pvp_exposed(&self, id: NodeId) -> bool {
        let now = self.collab.clock.now();
        self.nodes.get(id).is_some_and(|n| n.is_pvp_exposed(now))
    }

    pub fn reinforce_end(&self, id: NodeId) -> Option<DateTime<Utc>> {
        self.nodes.get(id).and_then(|n| n.reinforcement.reinforce_end())
    }

    /// Per-cycle consumption: the active-cycle behaviour's dynamic demand,
    /// or the type's static demand.
    pub fn core_demand(&self, id: NodeId) -> Option<Fixed64> {
        let node = self.nodes.get(id)?;
        let dynamic = self
            .active_cycles
            .get(&node.node_type)
            .and_then(|b| b.demand(id));
        Some(dynamic.unwrap_or(node.tuning.core_demand))
    }

    pub fn kick_start_ratio(&self, id: NodeId) -> Option<Fixed64> {
        self.nodes.get(id).map(|n| n.tuning.kick_start_ratio)
    }

    pub fn core_minimum(&self, id: NodeId) -> Option<Fixed64> {
        self.nodes.get(id).map(|n| n.tuning.core_minimum)
    }

    /// Out-connections whose target accepts energy.
    pub fn out_connections(&self, id: NodeId) -> Vec<ConnectionId> {
        self.graph
            .out_connections(id)
            .iter()
            .copied()
            .filter(|&c| {
                self.graph
                    .get_connection(c)
                    .and_then(|d| self.nodes.get(d.target))
                    .is_some_and(|t| t.class.accepts_energy())
            })
            .collect()
    }

    /// In-connections; empty when the node itself does not accept energy.
    pub fn in_connections(&self, id: NodeId) -> Vec<ConnectionId> {
        match self.nodes.get(id) {
            Some(node) if node.class.accepts_energy() => self.graph.in_connections(id).to_vec(),
            _ => Vec::new(),
        }
    }

    /// The node's network in breadth-first order.
    pub fn network(&self, id: NodeId) -> Vec<NodeId> {
        self.graph.network(id)
    }

    pub fn graph(&self) -> &ConnectionGraph {
        &self.graph
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn tick(&self) -> Ticks {
        self.sim_state.tick
    }

    pub fn state_hash(&self) -> u64 {
        self.last_state_hash
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.collab.clock.now()
    }
}

fn checked_weight(weight: f64) -> Result<Fixed64, NodeError> {
    if !weight.is_finite() || !(0.0..=MAX_WEIGHT).contains(&weight) {
        return Err(NodeError::InvalidWeight(weight));
    }
    Fixed64::checked_from_num(weight).ok_or(NodeError::InvalidWeight(weight))
}

// ===========================================================================
// Tests
// ===========================================================================
