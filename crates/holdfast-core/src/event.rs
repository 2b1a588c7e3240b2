//! Typed simulation events with per-kind ring buffers.
//!
//! Events are emitted while the tick runs (pump, core use, reinforcement,
//! request operations) and delivered in batch during post-tick. Each event
//! kind has its own [`EventBuffer`], allocated on first use.
//!
//! Event kinds can be suppressed via [`EventBus::suppress`]; suppressed
//! events are never buffered. Pump transfers are the high-volume kind a
//! headless server usually suppresses.

use chrono::{DateTime, Utc};

use crate::core_use::CorePhase;
use crate::fixed::{Fixed64, Ticks};
use crate::id::*;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A simulation event. All events carry the tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // -- Lifecycle --
    NodeDeployed {
        node: NodeId,
        node_type: NodeTypeId,
        owner: OwnerId,
        tick: Ticks,
    },
    NodeRemoved {
        node: NodeId,
        tick: Ticks,
    },
    Constructed {
        node: NodeId,
        tick: Ticks,
    },
    Deconstructed {
        node: NodeId,
        tick: Ticks,
    },
    Killed {
        node: NodeId,
        actor: Option<OwnerId>,
        tick: Ticks,
    },
    OnlineChanged {
        node: NodeId,
        online: bool,
        tick: Ticks,
    },
    OwnerChanged {
        node: NodeId,
        previous: OwnerId,
        owner: OwnerId,
        tick: Ticks,
    },

    // -- Topology --
    ConnectionAdded {
        connection: ConnectionId,
        source: NodeId,
        target: NodeId,
        tick: Ticks,
    },
    ConnectionRemoved {
        connection: ConnectionId,
        source: NodeId,
        target: NodeId,
        tick: Ticks,
    },
    Orphaned {
        node: NodeId,
        tick: Ticks,
    },
    Reconnected {
        node: NodeId,
        tick: Ticks,
    },

    // -- Energy --
    CoreTransferred {
        connection: ConnectionId,
        source: NodeId,
        target: NodeId,
        /// Amount drawn from the source.
        raw: Fixed64,
        /// Amount received by the target after efficiency.
        effective: Fixed64,
        tick: Ticks,
    },
    CorePhaseChanged {
        node: NodeId,
        phase: CorePhase,
        tick: Ticks,
    },

    // -- Siege --
    ReinforceStarted {
        node: NodeId,
        end: DateTime<Utc>,
        tick: Ticks,
    },
    ReinforceEnded {
        node: NodeId,
        tick: Ticks,
    },
    VulnerableStarted {
        node: NodeId,
        end: DateTime<Utc>,
        tick: Ticks,
    },
    VulnerableEnded {
        node: NodeId,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for suppression and subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeDeployed,
    NodeRemoved,
    Constructed,
    Deconstructed,
    Killed,
    OnlineChanged,
    OwnerChanged,
    ConnectionAdded,
    ConnectionRemoved,
    Orphaned,
    Reconnected,
    CoreTransferred,
    CorePhaseChanged,
    ReinforceStarted,
    ReinforceEnded,
    VulnerableStarted,
    VulnerableEnded,
}

const EVENT_KIND_COUNT: usize = 17;

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NodeDeployed { .. } => EventKind::NodeDeployed,
            Event::NodeRemoved { .. } => EventKind::NodeRemoved,
            Event::Constructed { .. } => EventKind::Constructed,
            Event::Deconstructed { .. } => EventKind::Deconstructed,
            Event::Killed { .. } => EventKind::Killed,
            Event::OnlineChanged { .. } => EventKind::OnlineChanged,
            Event::OwnerChanged { .. } => EventKind::OwnerChanged,
            Event::ConnectionAdded { .. } => EventKind::ConnectionAdded,
            Event::ConnectionRemoved { .. } => EventKind::ConnectionRemoved,
            Event::Orphaned { .. } => EventKind::Orphaned,
            Event::Reconnected { .. } => EventKind::Reconnected,
            Event::CoreTransferred { .. } => EventKind::CoreTransferred,
            Event::CorePhaseChanged { .. } => EventKind::CorePhaseChanged,
            Event::ReinforceStarted { .. } => EventKind::ReinforceStarted,
            Event::ReinforceEnded { .. } => EventKind::ReinforceEnded,
            Event::VulnerableStarted { .. } => EventKind::VulnerableStarted,
            Event::VulnerableEnded { .. } => EventKind::VulnerableEnded,
        }
    }
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer; when full, the oldest event is dropped.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Option<Event>>,
    /// Next write position.
    head: usize,
    len: usize,
    total_written: u64,
}

impl EventBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn push(&mut self, event: Event) {
        let capacity = self.capacity();
        self.events[self.head] = Some(event);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Events dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity() as u64)
    }

    /// Events from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        let capacity = self.capacity();
        let start = if self.len < capacity { 0 } else { self.head };
        (0..self.len).filter_map(move |i| self.events[(start + i) % capacity].as_ref())
    }

    pub fn clear(&mut self) {
        for slot in &mut self.events {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A read-only event listener.
pub type PassiveListener = Box<dyn FnMut(&Event)>;

/// Optional predicate that filters events for a listener.
pub type EventFilter = Box<dyn Fn(&Event) -> bool>;

struct Listener {
    callback: PassiveListener,
    filter: Option<EventFilter>,
}

/// One ring buffer per event kind, listener lists, and suppression flags.
pub struct EventBus {
    buffers: [Option<EventBuffer>; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    listeners: [Vec<Listener>; EVENT_KIND_COUNT],
    default_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffers", &self.buffers)
            .field("suppressed", &self.suppressed)
            .field("default_capacity", &self.default_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Create a bus with the given buffer capacity per event kind.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buffers: Default::default(),
            suppressed: [false; EVENT_KIND_COUNT],
            listeners: std::array::from_fn(|_| Vec::new()),
            default_capacity,
        }
    }

    /// Stop recording an event kind. Its buffer is released.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.buffers[kind.index()] = None;
    }

    pub fn unsuppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = false;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Buffer an event until the next delivery. No-op if suppressed.
    pub fn emit(&mut self, event: Event) {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return;
        }
        let capacity = self.default_capacity;
        self.buffers[idx]
            .get_or_insert_with(|| EventBuffer::new(capacity))
            .push(event);
    }

    /// Listeners are called in registration order.
    pub fn on_passive(&mut self, kind: EventKind, listener: PassiveListener) {
        self.listeners[kind.index()].push(Listener {
            callback: listener,
            filter: None,
        });
    }

    pub fn on_passive_filtered(
        &mut self,
        kind: EventKind,
        filter: EventFilter,
        listener: PassiveListener,
    ) {
        self.listeners[kind.index()].push(Listener {
            callback: listener,
            filter: Some(filter),
        });
    }

    /// Hand every buffered event to its listeners, oldest first, then clear
    /// the buffers. Kinds are delivered in [`EventKind`] declaration order.
    pub fn deliver(&mut self) {
        for idx in 0..EVENT_KIND_COUNT {
            let Some(buffer) = self.buffers[idx].as_mut() else {
                continue;
            };
            if buffer.is_empty() {
                continue;
            }
            let events: Vec<Event> = buffer.iter().cloned().collect();
            buffer.clear();

            for listener in &mut self.listeners[idx] {
                for event in &events {
                    if listener.filter.as_ref().is_some_and(|f| !f(event)) {
                        continue;
                    }
                    (listener.callback)(event);
                }
            }
        }
    }

    /// Events currently buffered for a kind, oldest first.
    pub fn buffered(&self, kind: EventKind) -> Vec<Event> {
        self.buffers[kind.index()]
            .as_ref()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffers.iter().flatten().map(EventBuffer::len).sum()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
