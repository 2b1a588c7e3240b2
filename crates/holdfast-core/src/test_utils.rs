//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::background::InlineSpawner;
use crate::clock::ManualClock;
use crate::collab::*;
use crate::core_use::{ActiveCycle, CycleContext};
use crate::engine::{DamageOutcome, DeployRequest, Engine};
use crate::fixed::{Fixed64, fixed64_to_f64};
use crate::id::*;
use crate::persist::{InMemoryGateway, PersistenceGateway, PropertyKey, PropertyValue};
use crate::registry::{NodeClass, NodeTypeDef, Registry, RegistryBuilder};
use crate::tuning::Tuning;

// ===========================================================================
// Constants & fixed-point helpers
// ===========================================================================

pub const RED: OwnerId = OwnerId(1);
pub const BLUE: OwnerId = OwnerId(2);

/// One simulation tick.
pub const TICK: Duration = Duration::from_secs(1);
/// One reinforcement check interval at default tuning.
pub const CHECK: Duration = Duration::from_secs(10);

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Equality within fixed-point rounding.
pub fn approx_eq(actual: Fixed64, expected: f64) -> bool {
    (fixed64_to_f64(actual) - expected).abs() < 1e-6
}

/// 2024-03-10 12:00:00 UTC.
pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_710_072_000, 0).unwrap_or_default()
}

// ===========================================================================
// Registry
// ===========================================================================

/// Ids of the node types in [`test_registry`].
#[derive(Debug, Clone, Copy)]
pub struct TestTypes {
    pub base: NodeTypeId,
    pub pump: NodeTypeId,
    /// A pump at 0.8 transfer efficiency.
    pub lossy_pump: NodeTypeId,
    pub relay: NodeTypeId,
    /// A relay with a single reinforcement charge.
    pub single_charge_relay: NodeTypeId,
    pub factory: NodeTypeId,
    pub turret: NodeTypeId,
    pub wall: NodeTypeId,
}

pub fn test_registry() -> (Registry, TestTypes) {
    let mut b = RegistryBuilder::new();
    let base = b.register(NodeTypeDef::new("base", NodeClass::Base)).unwrap();
    let pump = b.register(NodeTypeDef::new("core_pump", NodeClass::CorePump)).unwrap();
    let lossy_pump = b
        .register(NodeTypeDef {
            transfer_efficiency: fixed(0.8),
            ..NodeTypeDef::new("lossy_pump", NodeClass::CorePump)
        })
        .unwrap();
    let relay = b.register(NodeTypeDef::new("relay", NodeClass::Relay)).unwrap();
    let single_charge_relay = b
        .register(NodeTypeDef {
            reinforce_counter_max: 1,
            ..NodeTypeDef::new("outpost_relay", NodeClass::Relay)
        })
        .unwrap();
    let factory = b
        .register(NodeTypeDef {
            capsule_item: ItemTypeId(7),
            ..NodeTypeDef::new("refinery", NodeClass::Production)
        })
        .unwrap();
    let turret = b.register(NodeTypeDef::new("turret", NodeClass::Turret)).unwrap();
    let wall = b.register(NodeTypeDef::new("wall", NodeClass::Wall)).unwrap();
    (
        b.build(),
        TestTypes {
            base,
            pump,
            lossy_pump,
            relay,
            single_charge_relay,
            factory,
            turret,
            wall,
        },
    )
}

// ===========================================================================
// Recording collaborators
// ===========================================================================

#[derive(Debug, Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLog {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<LogKind> {
        self.entries().into_iter().map(|e| e.kind).collect()
    }

    pub fn kinds_for(&self, node: NodeId) -> Vec<LogKind> {
        self.entries()
            .into_iter()
            .filter(|e| e.node == node)
            .map(|e| e.kind)
            .collect()
    }
}

impl LogSink for RecordingLog {
    fn append(&self, entry: &LogEntry) -> Result<(), GatewayError> {
        self.entries
            .lock()
            .map_err(|_| GatewayError::Other("log poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<(OwnerId, NodeUpdate)>>,
}

impl RecordingNotifier {
    pub fn updates(&self) -> Vec<(OwnerId, NodeUpdate)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.clear();
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, owner: OwnerId, update: &NodeUpdate) -> Result<(), GatewayError> {
        self.updates
            .lock()
            .map_err(|_| GatewayError::Other("notifier poisoned".into()))?
            .push((owner, update.clone()));
        Ok(())
    }
}

/// Records placed loot. Can be told to fail the next few placements.
#[derive(Debug, Default)]
pub struct RecordingLoot {
    requests: Mutex<Vec<LootRequest>>,
    failures: AtomicUsize,
}

impl RecordingLoot {
    pub fn requests(&self) -> Vec<LootRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl LootFactory for RecordingLoot {
    fn create_loot(&self, request: &LootRequest) -> Result<LootDrop, GatewayError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Unavailable("loot service down".into()));
        }
        self.requests
            .lock()
            .map_err(|_| GatewayError::Other("loot poisoned".into()))?
            .push(request.clone());
        CapsuleOnlyLoot.create_loot(request)
    }
}

/// A gateway that is always down.
#[derive(Debug, Default)]
pub struct FailingGateway;

impl PersistenceGateway for FailingGateway {
    fn load_property(&self, _node: NodeId, _key: PropertyKey) -> Result<Option<PropertyValue>, GatewayError> {
        Err(GatewayError::Unavailable("database offline".into()))
    }

    fn save_property(&self, _node: NodeId, _key: PropertyKey, _value: PropertyValue) -> Result<(), GatewayError> {
        Err(GatewayError::Unavailable("database offline".into()))
    }
}

/// Counts its runs; optionally reports a fixed dynamic demand.
#[derive(Debug)]
pub struct CountingCycle {
    demand: Option<Fixed64>,
    runs: Arc<AtomicUsize>,
}

impl CountingCycle {
    pub fn new(demand: Option<Fixed64>) -> Self {
        Self {
            demand,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn runs(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }
}

impl ActiveCycle for CountingCycle {
    fn demand(&self, _node: NodeId) -> Option<Fixed64> {
        self.demand
    }

    fn run(&mut self, _ctx: &CycleContext) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

// ===========================================================================
// Test world
// ===========================================================================

/// An engine wired to recording collaborators, a manual clock and inline
/// background work.
#[derive(Debug)]
pub struct TestWorld {
    pub engine: Engine,
    pub types: TestTypes,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<InMemoryGateway>,
    pub log: Arc<RecordingLog>,
    pub notifier: Arc<RecordingNotifier>,
    pub loot: Arc<RecordingLoot>,
    collab: Collaborators,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::build(Tuning::default(), Arc::new(InMemoryGateway::new()), None)
    }

    pub fn with_tuning(tuning: Tuning) -> Self {
        Self::build(tuning, Arc::new(InMemoryGateway::new()), None)
    }

    /// Every persistence call fails.
    pub fn with_failing_gateway() -> Self {
        Self::build(
            Tuning::default(),
            Arc::new(InMemoryGateway::new()),
            Some(Arc::new(FailingGateway)),
        )
    }

    fn build(tuning: Tuning, gateway: Arc<InMemoryGateway>, override_gateway: Option<Arc<dyn PersistenceGateway>>) -> Self {
        let (registry, types) = test_registry();
        let clock = Arc::new(ManualClock::new(start_time()));
        let log = Arc::new(RecordingLog::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let loot = Arc::new(RecordingLoot::default());
        let store: Arc<dyn PersistenceGateway> = match override_gateway {
            Some(failing) => failing,
            None => gateway.clone(),
        };
        let collab = Collaborators {
            gateway: store,
            notifier: notifier.clone(),
            loot: loot.clone(),
            log: log.clone(),
            clock: clock.clone(),
            spawner: Arc::new(InlineSpawner),
        };
        Self {
            engine: Engine::new(registry, tuning, collab.clone()),
            types,
            clock,
            gateway,
            log,
            notifier,
            loot,
            collab,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collab.clone()
    }

    /// Snapshot this world and restore it into a new engine that shares
    /// the gateway and clock. Orphan detection is still paused.
    pub fn restart(&self) -> TestWorld {
        let bytes = self.engine.save_snapshot().unwrap();
        self.restart_from(&bytes)
    }

    pub fn restart_from(&self, bytes: &[u8]) -> TestWorld {
        let log = Arc::new(RecordingLog::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let loot = Arc::new(RecordingLoot::default());
        let collab = Collaborators {
            gateway: self.collab.gateway.clone(),
            notifier: notifier.clone(),
            loot: loot.clone(),
            log: log.clone(),
            clock: self.clock.clone(),
            spawner: Arc::new(InlineSpawner),
        };
        let engine = Engine::from_snapshot(
            bytes,
            self.engine.registry().clone(),
            self.engine.tuning().clone(),
            collab.clone(),
        )
        .unwrap();
        TestWorld {
            engine,
            types: self.types,
            clock: self.clock.clone(),
            gateway: self.gateway.clone(),
            log,
            notifier,
            loot,
            collab,
        }
    }

    /// Deploy at construction level 0.
    pub fn deploy(&mut self, node_type: NodeTypeId, owner: OwnerId) -> NodeId {
        self.engine.deploy(DeployRequest::new(node_type, owner))
    }

    pub fn deploy_built(&mut self, node_type: NodeTypeId, owner: OwnerId) -> NodeId {
        self.engine.deploy(DeployRequest::new(node_type, owner).built())
    }

    /// A base and a built relay, connected at weight 1, owned by [`RED`].
    pub fn base_and_relay(&mut self) -> (NodeId, NodeId) {
        let base = self.deploy_built(self.types.base, RED);
        let relay = self.deploy_built(self.types.relay, RED);
        self.engine.connect(base, relay, 1.0).unwrap();
        (base, relay)
    }

    pub fn set_core(&mut self, node: NodeId, value: f64) {
        if let Some(n) = self.engine.nodes.get_mut(node) {
            n.core.set(fixed(value));
            self.engine.dirty.mark_node(node);
        }
    }

    pub fn core(&self, node: NodeId) -> Fixed64 {
        self.engine
            .node(node)
            .map(|n| n.core.current())
            .unwrap_or(Fixed64::ZERO)
    }

    pub fn damage(&mut self, node: NodeId, amount: f64) -> DamageOutcome {
        self.engine.apply_damage(node, fixed(amount), None).unwrap()
    }

    pub fn damage_by(&mut self, node: NodeId, amount: f64, actor: OwnerId) -> DamageOutcome {
        self.engine.apply_damage(node, fixed(amount), Some(actor)).unwrap()
    }

    /// Run one-second ticks, advancing the clock alongside.
    pub fn run_for(&mut self, duration: Duration) {
        for _ in 0..duration.as_secs() {
            self.clock.advance(chrono::TimeDelta::seconds(1));
            self.engine.update(TICK);
        }
    }

    pub fn log_kinds_for(&self, node: NodeId) -> Vec<LogKind> {
        self.log.kinds_for(node)
    }

    pub fn failed_saves_pending(&self) -> bool {
        self.engine
            .failed_saves
            .lock()
            .map(|f| !f.is_empty())
            .unwrap_or(false)
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}
