//! Loading pipeline: reads data files, validates them, builds the registry.
//!
//! Provides format detection (RON/JSON/TOML), file discovery, and the
//! deserialization helpers behind [`load_game_data`].

use holdfast_core::fixed::Fixed64;
use holdfast_core::id::ItemTypeId;
use holdfast_core::registry::{NodeTypeDef, Registry, RegistryBuilder, RegistryError};
use holdfast_core::tuning::Tuning;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::schema::NodeTypeData;

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A duplicate name was found.
    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// A value is out of range.
    #[error("invalid {field} for '{name}' in {file}: {detail}")]
    Invalid {
        file: PathBuf,
        name: String,
        field: &'static str,
        detail: String,
    },

    /// The registry rejected a definition.
    #[error("registry error in {file}: {source}")]
    Registry {
        file: PathBuf,
        #[source]
        source: RegistryError,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name (without extension).
///
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// multiple formats exist for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;

    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(DataLoadError::ConflictingFormats { a: existing, b: candidate });
            }
            found = Some(candidate);
        }
    }

    Ok(found)
}

/// Like [`find_data_file`], but returns an error if no file is found.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, detail: impl ToString) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Read a file and deserialize it according to its format (detected from extension).
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(path, e)),
    }
}

/// Deserialize a list from a file. For TOML files, extracts the array at the
/// given `toml_key` from a top-level table. For RON and JSON, deserializes
/// directly as `Vec<T>`.
pub fn deserialize_list<T: DeserializeOwned>(path: &Path, toml_key: &str) -> Result<Vec<T>, DataLoadError> {
    match detect_format(path)? {
        Format::Ron | Format::Json => deserialize_file(path),
        Format::Toml => {
            let content = std::fs::read_to_string(path)?;
            let table: toml::Value = toml::from_str(&content).map_err(|e| parse_error(path, e))?;
            let array = table
                .get(toml_key)
                .ok_or_else(|| parse_error(path, format!("missing key '{toml_key}' in TOML file")))?
                .clone();
            array.try_into().map_err(|e: toml::de::Error| parse_error(path, e))
        }
    }
}

/// Check whether a name already exists in a map, returning a `DuplicateName`
/// error if so.
pub fn check_duplicate<V>(map: &HashMap<String, V>, name: &str, file: &Path) -> Result<(), DataLoadError> {
    if map.contains_key(name) {
        Err(DataLoadError::DuplicateName {
            file: file.to_path_buf(),
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

// ===========================================================================
// Resolution
// ===========================================================================

/// Everything loaded from a data directory.
#[derive(Debug, Clone)]
pub struct GameData {
    pub registry: Registry,
    pub tuning: Tuning,
}

/// Load `node_types` (required) and `tuning` (optional) from `dir`.
pub fn load_game_data(dir: &Path) -> Result<GameData, DataLoadError> {
    let types_path = require_data_file(dir, "node_types")?;
    let types: Vec<NodeTypeData> = deserialize_list(&types_path, "node_types")?;

    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut builder = RegistryBuilder::new();
    for data in &types {
        check_duplicate(&seen, &data.name, &types_path)?;
        seen.insert(data.name.clone(), ());
        let def = resolve_node_type(data, &types_path)?;
        builder.register(def).map_err(|source| DataLoadError::Registry {
            file: types_path.clone(),
            source,
        })?;
    }
    let registry = builder.build();

    let tuning = match find_data_file(dir, "tuning")? {
        Some(path) => {
            let tuning: Tuning = deserialize_file(&path)?;
            validate_tuning(&tuning, &path)?;
            tuning
        }
        None => {
            tracing::info!(dir = %dir.display(), "no tuning file, using defaults");
            Tuning::default()
        }
    };

    tracing::info!(node_types = registry.len(), "game data loaded");
    Ok(GameData { registry, tuning })
}

fn to_fixed(value: f64, name: &str, field: &'static str, file: &Path) -> Result<Fixed64, DataLoadError> {
    let invalid = |detail: &str| DataLoadError::Invalid {
        file: file.to_path_buf(),
        name: name.to_string(),
        field,
        detail: detail.to_string(),
    };
    if !value.is_finite() || value < 0.0 {
        return Err(invalid("must be a non-negative number"));
    }
    Fixed64::checked_from_num(value).ok_or_else(|| invalid("out of range"))
}

/// Apply the data file's overrides on top of the class defaults.
fn resolve_node_type(data: &NodeTypeData, file: &Path) -> Result<NodeTypeDef, DataLoadError> {
    let mut def = NodeTypeDef::new(&data.name, data.class.into());
    let fixed = |value: f64, field| to_fixed(value, &data.name, field, file);

    if let Some(v) = data.construction_max {
        def.construction_max = v;
    }
    if let Some(v) = data.armor_max {
        def.armor_max = fixed(v, "armor_max")?;
    }
    if let Some(v) = data.core_max {
        def.core_max = fixed(v, "core_max")?;
    }
    if let Some(v) = data.core_transferred {
        def.core_transferred = fixed(v, "core_transferred")?;
    }
    if let Some(v) = data.transfer_efficiency {
        def.transfer_efficiency = fixed(v, "transfer_efficiency")?;
    }
    if let Some(v) = data.core_minimum {
        def.core_minimum = fixed(v, "core_minimum")?;
    }
    if let Some(v) = data.core_demand {
        def.core_demand = fixed(v, "core_demand")?;
    }
    if let Some(v) = data.kick_start_ratio {
        def.kick_start_ratio = Some(fixed(v, "kick_start_ratio")?);
    }
    if let Some(v) = data.reinforce_counter_max {
        def.reinforce_counter_max = v;
    }
    if let Some(v) = data.offline_when_reinforced {
        def.offline_when_reinforced = v;
    }
    if let Some(v) = data.capsule_item {
        def.capsule_item = ItemTypeId(v);
    }
    Ok(def)
}

fn validate_tuning(tuning: &Tuning, file: &Path) -> Result<(), DataLoadError> {
    let invalid = |field: &'static str, detail: &str| DataLoadError::Invalid {
        file: file.to_path_buf(),
        name: "tuning".to_string(),
        field,
        detail: detail.to_string(),
    };
    if tuning.delayed_start_min_secs > tuning.delayed_start_max_secs {
        return Err(invalid("delayed_start_min_secs", "exceeds delayed_start_max_secs"));
    }
    if !(0.0..=1.0).contains(&tuning.kick_start_ratio) {
        return Err(invalid("kick_start_ratio", "must be within [0, 1]"));
    }
    if !(0.0..=1.0).contains(&tuning.reinforce_armor_threshold) {
        return Err(invalid("reinforce_armor_threshold", "must be within [0, 1]"));
    }
    if tuning.reinforce_check_secs == 0 || tuning.core_use_cycle_secs == 0 {
        return Err(invalid("reinforce_check_secs/core_use_cycle_secs", "must be positive"));
    }
    if tuning.reinforce_length_minutes <= 0 || tuning.vulnerable_length_minutes < 0 {
        return Err(invalid("reinforce_length_minutes", "must be positive"));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_core::registry::NodeClass;
    use std::fs;

    /// Create a temporary directory with a unique name for test isolation.
    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("holdfast_data_test_{suffix}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Clean up a test directory.
    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    const TYPES_RON: &str = r#"[
        (name: "base", class: base),
        (name: "relay", class: relay, armor_max: Some(400.0)),
    ]"#;

    // -----------------------------------------------------------------------
    // detect_format / find_data_file
    // -----------------------------------------------------------------------

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format(Path::new("node_types.ron")).unwrap(), Format::Ron);
        assert_eq!(detect_format(Path::new("node_types.toml")).unwrap(), Format::Toml);
        assert_eq!(detect_format(Path::new("node_types.json")).unwrap(), Format::Json);
    }

    #[test]
    fn detect_format_unsupported() {
        assert!(matches!(
            detect_format(Path::new("node_types.yaml")),
            Err(DataLoadError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            detect_format(Path::new("node_types")),
            Err(DataLoadError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn find_data_file_found_and_missing() {
        let dir = make_test_dir("find");
        assert_eq!(find_data_file(&dir, "node_types").unwrap(), None);
        fs::write(dir.join("node_types.json"), "[]").unwrap();
        assert_eq!(
            find_data_file(&dir, "node_types").unwrap(),
            Some(dir.join("node_types.json"))
        );
        cleanup(&dir);
    }

    #[test]
    fn find_data_file_conflict() {
        let dir = make_test_dir("find_conflict");
        fs::write(dir.join("node_types.ron"), "[]").unwrap();
        fs::write(dir.join("node_types.json"), "[]").unwrap();
        assert!(matches!(
            find_data_file(&dir, "node_types"),
            Err(DataLoadError::ConflictingFormats { .. })
        ));
        cleanup(&dir);
    }

    #[test]
    fn require_data_file_missing() {
        let dir = make_test_dir("require_missing");
        assert!(matches!(
            require_data_file(&dir, "node_types"),
            Err(DataLoadError::MissingRequired { .. })
        ));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // deserialize_list
    // -----------------------------------------------------------------------

    #[test]
    fn deserialize_list_toml() {
        let dir = make_test_dir("list_toml");
        let path = dir.join("node_types.toml");
        fs::write(
            &path,
            r#"
[[node_types]]
name = "base"
class = "base"

[[node_types]]
name = "pump"
class = "core_pump"
transfer_efficiency = 0.5
"#,
        )
        .unwrap();
        let types: Vec<NodeTypeData> = deserialize_list(&path, "node_types").unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(types[1].transfer_efficiency, Some(0.5));
        cleanup(&dir);
    }

    #[test]
    fn deserialize_list_toml_missing_key() {
        let dir = make_test_dir("list_toml_missing");
        let path = dir.join("node_types.toml");
        fs::write(&path, r#"foo = "bar""#).unwrap();
        let result: Result<Vec<NodeTypeData>, _> = deserialize_list(&path, "node_types");
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));
        cleanup(&dir);
    }

    #[test]
    fn deserialize_file_parse_error() {
        let dir = make_test_dir("deser_parse_err");
        let path = dir.join("node_types.ron");
        fs::write(&path, "this is not valid RON {{{").unwrap();
        let result: Result<Vec<NodeTypeData>, _> = deserialize_file(&path);
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // load_game_data
    // -----------------------------------------------------------------------

    #[test]
    fn load_with_default_tuning() {
        let dir = make_test_dir("load_default");
        fs::write(dir.join("node_types.ron"), TYPES_RON).unwrap();

        let data = load_game_data(&dir).unwrap();
        assert_eq!(data.registry.len(), 2);
        let relay = data.registry.id_by_name("relay").unwrap();
        let def = data.registry.get(relay).unwrap();
        assert_eq!(def.class, NodeClass::Relay);
        assert_eq!(def.armor_max, Fixed64::from_num(400));
        assert_eq!(data.tuning, Tuning::default());
        cleanup(&dir);
    }

    #[test]
    fn load_with_partial_tuning() {
        let dir = make_test_dir("load_tuning");
        fs::write(dir.join("node_types.ron"), TYPES_RON).unwrap();
        fs::write(dir.join("tuning.json"), r#"{"reinforce_length_minutes": 720, "rng_seed": 9}"#).unwrap();

        let data = load_game_data(&dir).unwrap();
        assert_eq!(data.tuning.reinforce_length_minutes, 720);
        assert_eq!(data.tuning.rng_seed, 9);
        assert_eq!(data.tuning.save_interval_ticks, Tuning::default().save_interval_ticks);
        cleanup(&dir);
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = make_test_dir("load_dup");
        fs::write(
            dir.join("node_types.json"),
            r#"[{"name": "relay", "class": "relay"}, {"name": "relay", "class": "wall"}]"#,
        )
        .unwrap();
        assert!(matches!(load_game_data(&dir), Err(DataLoadError::DuplicateName { .. })));
        cleanup(&dir);
    }

    #[test]
    fn negative_values_rejected() {
        let dir = make_test_dir("load_negative");
        fs::write(
            dir.join("node_types.json"),
            r#"[{"name": "relay", "class": "relay", "core_max": -5.0}]"#,
        )
        .unwrap();
        assert!(matches!(
            load_game_data(&dir),
            Err(DataLoadError::Invalid { field: "core_max", .. })
        ));
        cleanup(&dir);
    }

    #[test]
    fn registry_validation_surfaces() {
        let dir = make_test_dir("load_registry");
        fs::write(
            dir.join("node_types.json"),
            r#"[{"name": "pump", "class": "core_pump", "transfer_efficiency": 1.5}]"#,
        )
        .unwrap();
        assert!(matches!(load_game_data(&dir), Err(DataLoadError::Registry { .. })));
        cleanup(&dir);
    }

    #[test]
    fn inverted_delayed_start_window_rejected() {
        let dir = make_test_dir("load_bad_tuning");
        fs::write(dir.join("node_types.ron"), TYPES_RON).unwrap();
        fs::write(
            dir.join("tuning.toml"),
            "delayed_start_min_secs = 60\ndelayed_start_max_secs = 10\n",
        )
        .unwrap();
        assert!(matches!(
            load_game_data(&dir),
            Err(DataLoadError::Invalid { field: "delayed_start_min_secs", .. })
        ));
        cleanup(&dir);
    }
}
