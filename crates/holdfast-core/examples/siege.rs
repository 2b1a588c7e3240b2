//! Siege example: a base feeds a pump and a refinery, then comes under
//! attack.
//!
//! Builds a small network, lets energy flow for a minute, damages the
//! refinery into reinforcement, and fast-forwards the clock past the end of
//! the reinforcement window.
//!
//! Run with: `RUST_LOG=holdfast_core=debug cargo run -p holdfast-core --example siege`

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use holdfast_core::clock::{Clock, ManualClock, SystemClock};
use holdfast_core::collab::Collaborators;
use holdfast_core::engine::{DeployRequest, Engine};
use holdfast_core::fixed::{Fixed64, fixed64_to_f64};
use holdfast_core::id::OwnerId;
use holdfast_core::registry::{NodeClass, NodeTypeDef, RegistryBuilder};
use holdfast_core::tuning::Tuning;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- Step 1: Node types ---

    let mut builder = RegistryBuilder::new();
    let base_type = builder.register(NodeTypeDef::new("base", NodeClass::Base))?;
    let pump_type = builder.register(NodeTypeDef {
        transfer_efficiency: Fixed64::from_num(0.9),
        ..NodeTypeDef::new("core_pump", NodeClass::CorePump)
    })?;
    let refinery_type = builder.register(NodeTypeDef::new("refinery", NodeClass::Production))?;
    let registry = builder.build();

    // --- Step 2: Engine with a controllable clock ---

    let clock = Arc::new(ManualClock::new(SystemClock.now()));
    let collab = Collaborators::standalone().with_clock(clock.clone());
    let mut engine = Engine::new(registry, Tuning::default(), collab);

    let owner = OwnerId(1);
    let base = engine.deploy(DeployRequest::new(base_type, owner).built());
    let pump = engine.deploy(DeployRequest::new(pump_type, owner).built());
    let refinery = engine.deploy(DeployRequest::new(refinery_type, owner).built());
    engine.connect(base, pump, 1.0)?;
    engine.connect(pump, refinery, 1.0)?;

    // Refuel the base so energy starts flowing right away.
    engine.insert_core(base, Fixed64::from_num(1000))?;
    for _ in 0..60 {
        clock.advance(TimeDelta::seconds(1));
        engine.update(Duration::from_secs(1));
    }
    let stored = engine.node(refinery).map(|n| fixed64_to_f64(n.core.current()));
    println!("refinery core after 60 s: {stored:?}");

    // --- Step 3: Attack ---

    let outcome = engine.apply_damage(refinery, Fixed64::from_num(600), Some(OwnerId(2)))?;
    println!("damage outcome: {outcome:?}");
    println!("refinery online: {}", engine.is_online(refinery));

    if let Some(end) = engine.reinforce_end(refinery) {
        clock.set(end + TimeDelta::seconds(1));
        engine.update(Duration::from_secs(10));
    }
    println!(
        "after the window: reinforced={} counter={:?}",
        engine.is_reinforced(refinery),
        engine.node(refinery).map(|n| n.reinforcement.counter())
    );

    engine.flush();
    Ok(())
}
