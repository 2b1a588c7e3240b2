//! Background work dispatch.
//!
//! Persistence writes, domain log writes, notifications and loot generation
//! run as jobs handed to a [`TaskSpawner`]. A failing or panicking job is
//! logged at its boundary and never reaches the tick loop.
//!
//! Per-node [`SingleFlight`] guards keep at most one job of a kind in flight
//! for a node; [`OneShot`] marks work that may happen only once in a node's
//! life (deconstruction).

use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::collab::GatewayError;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() -> Result<(), GatewayError> + Send + 'static>;

/// Runs [`Job`]s somewhere off (or on) the tick loop.
pub trait TaskSpawner: Send + Sync + Debug {
    fn spawn(&self, name: &'static str, job: Job);
}

/// Run a job, containing its failures.
pub fn run_job(name: &'static str, job: Job) {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(job = name, error = %err, "background job failed"),
        Err(_) => tracing::error!(job = name, "background job panicked"),
    }
}

/// Runs jobs immediately on the calling thread. Deterministic; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineSpawner;

impl TaskSpawner for InlineSpawner {
    fn spawn(&self, name: &'static str, job: Job) {
        run_job(name, job);
    }
}

/// Runs jobs on the global rayon pool.
#[cfg(feature = "parallel")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonSpawner;

#[cfg(feature = "parallel")]
impl TaskSpawner for RayonSpawner {
    fn spawn(&self, name: &'static str, job: Job) {
        rayon::spawn(move || run_job(name, job));
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// At most one holder at a time. Acquisition never blocks.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `None` if a flight is already running.
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                flight: Arc::clone(self),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases its [`SingleFlight`] on drop, including on unwind.
#[derive(Debug)]
pub struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}

/// Fires exactly once.
#[derive(Debug, Default)]
pub struct OneShot {
    fired: AtomicBool,
}

impl OneShot {
    /// `true` for the first caller only.
    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// The guards kept for every live node.
#[derive(Debug, Default)]
pub struct NodeFlights {
    pub save: Arc<SingleFlight>,
    pub notify: Arc<SingleFlight>,
    pub deconstruct: OneShot,
}
