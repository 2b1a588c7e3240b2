//! End-to-end scenarios for the node network: energy distribution,
//! construction, reinforcement with network adoption, and orphan handling.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use chrono::TimeDelta;
use holdfast_core::clock::ManualClock;
use holdfast_core::collab::Collaborators;
use holdfast_core::engine::{DamageOutcome, DeployRequest, Engine};
use holdfast_core::error::NodeError;
use holdfast_core::event::{Event, EventKind};
use holdfast_core::fixed::Fixed64;
use holdfast_core::id::{NodeId, NodeTypeId};
use holdfast_core::registry::{NodeClass, NodeTypeDef, RegistryBuilder};
use holdfast_core::reinforce::ReinforcePhase;
use holdfast_core::test_utils::*;
use holdfast_core::tuning::Tuning;
use proptest::prelude::*;

/// A base, a pump at 0.8 efficiency, and relays that hold 100 core.
struct PumpWorld {
    engine: Engine,
    pump: NodeId,
    small_relay: NodeTypeId,
}

fn pump_world() -> PumpWorld {
    let mut b = RegistryBuilder::new();
    let base_type = b.register(NodeTypeDef::new("base", NodeClass::Base)).unwrap();
    let pump_type = b
        .register(NodeTypeDef {
            transfer_efficiency: fixed(0.8),
            ..NodeTypeDef::new("pump", NodeClass::CorePump)
        })
        .unwrap();
    let small_relay = b
        .register(NodeTypeDef {
            core_max: fixed(100.0),
            ..NodeTypeDef::new("small_relay", NodeClass::Relay)
        })
        .unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let mut engine = Engine::new(
        b.build(),
        Tuning::default(),
        Collaborators::standalone().with_clock(clock),
    );
    let base = engine.deploy(DeployRequest::new(base_type, RED).built());
    let pump = engine.deploy(DeployRequest::new(pump_type, RED).built());
    engine.connect(base, pump, 0.0).unwrap();
    PumpWorld {
        engine,
        pump,
        small_relay,
    }
}

fn record_transfers(engine: &mut Engine) -> Rc<RefCell<Vec<Event>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    engine.event_bus.on_passive(
        EventKind::CoreTransferred,
        Box::new(move |e| sink.borrow_mut().push(e.clone())),
    );
    seen
}

fn raw_and_effective(events: &[Event], target: NodeId) -> Option<(Fixed64, Fixed64)> {
    events.iter().find_map(|e| match e {
        Event::CoreTransferred {
            target: t,
            raw,
            effective,
            ..
        } if *t == target => Some((*raw, *effective)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// A: weighted split with efficiency loss
// ---------------------------------------------------------------------------

#[test]
fn weighted_split_draws_raw_amount_from_source() {
    let mut w = pump_world();
    let pump = w.pump;
    let heavy = w.engine.deploy(DeployRequest::new(w.small_relay, RED).built());
    let light = w.engine.deploy(DeployRequest::new(w.small_relay, RED).built());
    w.engine.connect(pump, heavy, 3.0).unwrap();
    w.engine.connect(pump, light, 1.0).unwrap();
    w.engine.insert_core(pump, fixed(100.0)).unwrap();
    let transfers = record_transfers(&mut w.engine);

    w.engine.update(TICK);

    let events = transfers.borrow();
    let (raw_heavy, eff_heavy) = raw_and_effective(&events, heavy).unwrap();
    let (raw_light, eff_light) = raw_and_effective(&events, light).unwrap();
    assert!(approx_eq(raw_heavy, 37.5));
    assert!(approx_eq(raw_light, 12.5));
    assert!(approx_eq(eff_heavy, 30.0));
    assert!(approx_eq(eff_light, 10.0));

    let pump_core = w.engine.node(pump).unwrap().core.current();
    assert_eq!(pump_core, fixed(50.0));
    assert!(approx_eq(w.engine.node(heavy).unwrap().core.current(), 30.0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pump_draws_what_it_sends(heavy in 1u32..10, light in 1u32..10, stored in 60u32..1000) {
        let mut w = pump_world();
        let pump = w.pump;
        let a = w.engine.deploy(DeployRequest::new(w.small_relay, RED).built());
        let b = w.engine.deploy(DeployRequest::new(w.small_relay, RED).built());
        w.engine.connect(pump, a, f64::from(heavy)).unwrap();
        w.engine.connect(pump, b, f64::from(light)).unwrap();
        let before = w.engine.insert_core(pump, fixed(f64::from(stored))).unwrap();
        let transfers = record_transfers(&mut w.engine);

        w.engine.update(TICK);

        let events = transfers.borrow();
        let mut raw_total = Fixed64::ZERO;
        for target in [a, b] {
            if let Some((raw, effective)) = raw_and_effective(&events, target) {
                prop_assert!(effective <= raw);
                raw_total += raw;
            }
        }
        let after = w.engine.node(pump).unwrap().core.current();
        prop_assert_eq!(before - after, raw_total);
        prop_assert!(raw_total <= fixed(50.0));
    }
}

// ---------------------------------------------------------------------------
// B: construction floor
// ---------------------------------------------------------------------------

#[test]
fn decrement_at_zero_is_rejected() {
    let mut w = TestWorld::new();
    let relay = w.deploy(w.types.relay, RED);
    assert_eq!(
        w.engine.modify_construction_level(relay, -10, false),
        Err(NodeError::ConstructionLevelMinReached)
    );
    assert_eq!(w.engine.node(relay).unwrap().construction.current(), 0);
    assert!(w.engine.contains_node(relay));
}

// ---------------------------------------------------------------------------
// C: crossing the armor threshold
// ---------------------------------------------------------------------------

#[test]
fn armor_below_half_enters_reinforcement() {
    let mut w = TestWorld::new();
    let (_, relay) = w.base_and_relay();
    w.engine.update(TICK);

    assert_eq!(w.damage(relay, 400.0), DamageOutcome::Damaged);
    assert_eq!(w.engine.node(relay).unwrap().reinforcement.counter(), 3);

    assert!(matches!(w.damage(relay, 200.0), DamageOutcome::Reinforced { .. }));
    let node = w.engine.node(relay).unwrap();
    assert!(matches!(node.reinforcement.phase(), ReinforcePhase::Reinforced { .. }));
    assert_eq!(node.reinforcement.counter(), 2);
    assert!(w.engine.is_reinforced(relay));
}

// ---------------------------------------------------------------------------
// D: network adoption of the end time
// ---------------------------------------------------------------------------

#[test]
fn later_reinforcement_adopts_network_end_time() {
    let mut w = TestWorld::new();
    let (base, a) = w.base_and_relay();
    let b = w.deploy_built(w.types.relay, RED);
    w.engine.connect(a, b, 1.0).unwrap();
    w.engine.update(TICK);
    assert_eq!(w.engine.network(base).len(), 3);

    w.damage(a, 600.0);
    let end = w.engine.reinforce_end(a).unwrap();

    w.run_for(5 * TICK);
    w.damage(b, 600.0);
    assert_eq!(w.engine.reinforce_end(b), Some(end));
}

#[test]
fn separate_networks_keep_their_own_end_times() {
    let mut w = TestWorld::new();
    let (_, a) = w.base_and_relay();
    let (_, b) = w.base_and_relay();
    w.engine.set_reinforce_offset(b, 6).unwrap();
    w.engine.update(TICK);

    w.damage(a, 600.0);
    w.run_for(5 * TICK);
    w.damage(b, 600.0);

    let end_a = w.engine.reinforce_end(a).unwrap();
    let end_b = w.engine.reinforce_end(b).unwrap();
    assert_eq!(end_b - end_a, TimeDelta::hours(6));
}

// ---------------------------------------------------------------------------
// E: orphaning
// ---------------------------------------------------------------------------

#[test]
fn cut_off_node_is_orphaned_and_offline_in_the_same_tick() {
    let mut w = TestWorld::new();
    let (base, relay) = w.base_and_relay();
    let factory = w.deploy_built(w.types.factory, RED);
    w.engine.connect(relay, factory, 1.0).unwrap();
    w.engine.update(TICK);
    assert!(w.engine.is_online(factory));
    assert!(!w.engine.is_orphaned(factory));

    let link = w.engine.graph().out_connections(base)[0];
    w.engine.disconnect(link).unwrap();
    let tick = w.engine.tick();
    w.engine.update(TICK);

    for node in [relay, factory] {
        assert!(w.engine.is_orphaned(node));
        assert!(!w.engine.is_online(node));
    }
    assert!(!w.engine.is_orphaned(base));
    assert_eq!(w.engine.tick(), tick + 1);
}

#[test]
fn removed_base_orphans_its_network() {
    let mut w = TestWorld::new();
    let (base, relay) = w.base_and_relay();
    w.engine.update(TICK);

    w.engine.remove_node(base).unwrap();
    w.engine.update(TICK);
    assert!(w.engine.is_orphaned(relay));
    assert!(!w.engine.is_online(relay));
}
