//! Engines built from data files on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use holdfast_core::clock::ManualClock;
use holdfast_core::collab::Collaborators;
use holdfast_core::engine::{DeployRequest, Engine};
use holdfast_core::test_utils::*;
use holdfast_data::{DataLoadError, load_game_data};

fn make_data_dir(suffix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("holdfast_it_{suffix}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn cleanup(dir: &Path) {
    let _ = fs::remove_dir_all(dir);
}

const NODE_TYPES: &str = r#"
[[node_types]]
name = "citadel"
class = "base"
core_max = 5000.0

[[node_types]]
name = "core_pump"
class = "core_pump"
core_transferred = 20.0
transfer_efficiency = 0.5

[[node_types]]
name = "relay"
class = "relay"
reinforce_counter_max = 1

[[node_types]]
name = "wall"
class = "wall"
armor_max = 300.0
"#;

fn engine_from(dir: &Path) -> Engine {
    let data = load_game_data(dir).unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    Engine::new(
        data.registry,
        data.tuning,
        Collaborators::standalone().with_clock(clock),
    )
}

#[test]
fn loaded_types_drive_the_pump() {
    let dir = make_data_dir("pump");
    fs::write(dir.join("node_types.toml"), NODE_TYPES).unwrap();
    let mut engine = engine_from(&dir);
    cleanup(&dir);

    let registry = engine.registry().clone();
    let id = |name: &str| registry.id_by_name(name).unwrap();

    let citadel = engine.deploy(DeployRequest::new(id("citadel"), RED).built());
    let pump = engine.deploy(DeployRequest::new(id("core_pump"), RED).built());
    let relay = engine.deploy(DeployRequest::new(id("relay"), RED).built());
    engine.connect(citadel, pump, 0.0).unwrap();
    engine.connect(pump, relay, 1.0).unwrap();
    assert_eq!(engine.insert_core(citadel, fixed(6000.0)).unwrap(), fixed(5000.0));
    engine.insert_core(pump, fixed(100.0)).unwrap();

    engine.update(TICK);

    assert!(approx_eq(engine.node(relay).unwrap().core.current(), 10.0));
    assert!(approx_eq(engine.node(pump).unwrap().last_used_core, 20.0));
}

#[test]
fn tuning_file_changes_reinforce_length() {
    let dir = make_data_dir("tuning");
    fs::write(dir.join("node_types.toml"), NODE_TYPES).unwrap();
    fs::write(dir.join("tuning.ron"), "(reinforce_length_minutes: 2880)").unwrap();
    let mut engine = engine_from(&dir);
    cleanup(&dir);

    assert_eq!(engine.tuning().reinforce_length_minutes, 2880);

    let registry = engine.registry().clone();
    let citadel = engine.deploy(DeployRequest::new(registry.id_by_name("citadel").unwrap(), RED).built());
    let relay = engine.deploy(DeployRequest::new(registry.id_by_name("relay").unwrap(), RED).built());
    engine.connect(citadel, relay, 1.0).unwrap();
    engine.update(TICK);

    engine.apply_damage(relay, fixed(600.0), None).unwrap();
    let end = engine.reinforce_end(relay).unwrap();
    assert_eq!(end - start_time(), chrono::TimeDelta::hours(36));
}

#[test]
fn missing_node_types_is_an_error() {
    let dir = make_data_dir("missing");
    let result = load_game_data(&dir);
    cleanup(&dir);
    assert!(matches!(result, Err(DataLoadError::MissingRequired { .. })));
}
