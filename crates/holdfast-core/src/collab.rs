//! External collaborators the engine talks to.
//!
//! Everything here is a trait object behind an `Arc` so that background jobs
//! can carry a handle off the tick loop.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::background::{InlineSpawner, TaskSpawner};
use crate::clock::{Clock, SystemClock};
use crate::id::*;
use crate::node::{NodeSnapshot, Position};
use crate::persist::{InMemoryGateway, PersistenceGateway};

/// Failures reported by a collaborator. Never surfaced to request callers;
/// the engine logs them and retries on the next schedule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored value for {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Short status line (online, armor, reinforcement).
    Status,
    /// Full node details for management views.
    Details,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub kind: UpdateKind,
    pub snapshot: NodeSnapshot,
    pub zone: ZoneId,
}

/// Broadcasts node updates to the owner's viewers and managers.
pub trait Notifier: Send + Sync + Debug {
    fn notify(&self, owner: OwnerId, update: &NodeUpdate) -> Result<(), GatewayError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _owner: OwnerId, _update: &NodeUpdate) -> Result<(), GatewayError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loot
// ---------------------------------------------------------------------------

/// What a deconstructed node leaves behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootRequest {
    pub node: NodeId,
    pub node_type: NodeTypeId,
    pub owner: OwnerId,
    pub zone: ZoneId,
    pub position: Position,
    pub capsule_item: ItemTypeId,
    /// Construction progress in `[0, 1]`; scales the materials returned.
    pub progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LootDrop {
    pub items: Vec<(ItemTypeId, u32)>,
}

/// Generates and places the loot container for a deconstructed node.
pub trait LootFactory: Send + Sync + Debug {
    fn create_loot(&self, request: &LootRequest) -> Result<LootDrop, GatewayError>;
}

/// Drops only the capsule item.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapsuleOnlyLoot;

impl LootFactory for CapsuleOnlyLoot {
    fn create_loot(&self, request: &LootRequest) -> Result<LootDrop, GatewayError> {
        Ok(LootDrop {
            items: vec![(request.capsule_item, 1)],
        })
    }
}

// ---------------------------------------------------------------------------
// Domain log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    Deployed,
    Constructed,
    Deconstructed,
    Killed,
    Online,
    Offline,
    TakeOver,
    ReinforceStart,
    ReinforceEnd,
    GotOrphaned,
    GotConnected,
    VulnerableStart,
    VulnerableEnd,
}

/// One entry in the owner-facing structure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub node: NodeId,
    pub node_type: NodeTypeId,
    pub owner: OwnerId,
    /// Who caused the entry, when it was a player.
    pub actor: Option<OwnerId>,
    pub zone: ZoneId,
    /// Item involved (the deconstruction capsule).
    pub material: Option<ItemTypeId>,
    pub at: DateTime<Utc>,
}

pub trait LogSink: Send + Sync + Debug {
    fn append(&self, entry: &LogEntry) -> Result<(), GatewayError>;
}

/// Writes domain log entries to the diagnostics log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, entry: &LogEntry) -> Result<(), GatewayError> {
        tracing::info!(
            kind = ?entry.kind,
            node = ?entry.node,
            owner = entry.owner.0,
            zone = entry.zone.0,
            "structure log"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Everything the engine needs from the outside world.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub loot: Arc<dyn LootFactory>,
    pub log: Arc<dyn LogSink>,
    pub clock: Arc<dyn Clock>,
    pub spawner: Arc<dyn TaskSpawner>,
}

impl Collaborators {
    /// In-memory persistence, no notifications, tracing log, system clock,
    /// inline background work.
    pub fn standalone() -> Self {
        Self {
            gateway: Arc::new(InMemoryGateway::new()),
            notifier: Arc::new(NullNotifier),
            loot: Arc::new(CapsuleOnlyLoot),
            log: Arc::new(TracingLogSink),
            clock: Arc::new(SystemClock),
            spawner: Arc::new(InlineSpawner),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PersistenceGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
