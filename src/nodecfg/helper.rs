//! Controller-side config composition.
//!
//! `ConfigHelper` owns the six config layers and computes the effective
//! per-node config: base (by software version), firmware base (by firmware
//! version), hardware base (by hardware type), network overrides, automated
//! node overrides, manual node overrides. Later layers win; the MD5 of the
//! canonical serialization is the `configMd5` a node reports back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::merge::{config_md5, merge, merge_layers};

/// Parsed software version, ordered by the numeric fields found in the
/// version string (e.g. `RELEASE_M80_1`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwVersion {
    pub version: String,
    numbers: Vec<u64>,
}

impl SwVersion {
    pub fn new(version: impl Into<String>) -> Self {
        let version = version.into();
        let re = regex::Regex::new(r"\d+").unwrap_or_else(|_| unreachable!("static regex"));
        let numbers = re
            .find_iter(&version)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        Self { version, numbers }
    }
}

impl PartialOrd for SwVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SwVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.numbers
            .cmp(&other.numbers)
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// Where the layer files live.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub base_config_dir: PathBuf,
    pub fw_base_config_dir: PathBuf,
    pub hw_base_config_dir: PathBuf,
    pub hw_config_types_file: PathBuf,
    pub node_overrides_file: PathBuf,
    pub auto_node_overrides_file: PathBuf,
    pub network_overrides_file: PathBuf,
}

/// The layered config store.
#[derive(Debug, Default)]
pub struct ConfigHelper {
    paths: ConfigPaths,
    /// Software version -> base config.
    base_configs: BTreeMap<SwVersionKey, Value>,
    /// Firmware version -> firmware base config.
    fw_base_configs: BTreeMap<SwVersionKey, Value>,
    /// Hardware type -> (version -> config).
    hw_base_configs: BTreeMap<String, BTreeMap<SwVersionKey, Value>>,
    /// Hardware type -> board ids.
    hw_types: BTreeMap<String, Vec<String>>,
    network_overrides: Value,
    auto_node_overrides: Value,
    node_overrides: Value,
}

/// BTreeMap key wrapper so versions sort numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SwVersionKey(SwVersion);

impl ConfigHelper {
    /// Load every layer from disk. Missing override files start empty;
    /// missing base directories are tolerated with a warning (a controller
    /// can run with overrides only, e.g. in tests).
    pub fn load(paths: ConfigPaths) -> Result<Self> {
        let mut helper = Self {
            paths,
            network_overrides: Value::Object(Map::new()),
            auto_node_overrides: Value::Object(Map::new()),
            node_overrides: Value::Object(Map::new()),
            ..Default::default()
        };
        helper.reload_base_configs()?;
        helper.reload_overrides()?;
        Ok(helper)
    }

    /// Re-read base config directories.
    pub fn reload_base_configs(&mut self) -> Result<()> {
        self.base_configs = read_versioned_dir(&self.paths.base_config_dir)?;
        self.fw_base_configs = read_versioned_dir(&self.paths.fw_base_config_dir)?;
        self.hw_types = read_hw_types(&self.paths.hw_config_types_file);
        self.hw_base_configs.clear();
        for hw_type in self.hw_types.keys() {
            let dir = self.paths.hw_base_config_dir.join(hw_type);
            self.hw_base_configs
                .insert(hw_type.clone(), read_versioned_dir(&dir)?);
        }
        Ok(())
    }

    /// Re-read override files (hot reload on external writes). Stores with
    /// no backing file (empty path) keep their in-memory contents.
    pub fn reload_overrides(&mut self) -> Result<()> {
        if !self.paths.node_overrides_file.as_os_str().is_empty() {
            self.node_overrides = read_json_or_empty(&self.paths.node_overrides_file);
        }
        if !self.paths.auto_node_overrides_file.as_os_str().is_empty() {
            self.auto_node_overrides = read_json_or_empty(&self.paths.auto_node_overrides_file);
        }
        if !self.paths.network_overrides_file.as_os_str().is_empty() {
            self.network_overrides = read_json_or_empty(&self.paths.network_overrides_file);
        }
        Ok(())
    }

    /// Map a hardware board id to its config type.
    pub fn hardware_config_type(&self, hw_board_id: &str) -> Option<&str> {
        for (hw_type, board_ids) in &self.hw_types {
            if board_ids.iter().any(|b| b == hw_board_id) {
                return Some(hw_type);
            }
        }
        None
    }

    fn base_for<'a>(
        table: &'a BTreeMap<SwVersionKey, Value>,
        version: Option<&str>,
    ) -> Option<&'a Value> {
        if let Some(ver) = version {
            let key = SwVersionKey(SwVersion::new(ver));
            if let Some(exact) = table.get(&key) {
                return Some(exact);
            }
            // Fall back to the newest base at or below the node's version.
            if let Some((_, v)) = table.range(..=key).next_back() {
                return Some(v);
            }
        }
        // Unknown version: newest base.
        table.values().next_back()
    }

    /// Compute the effective config for one node.
    pub fn effective_config(
        &self,
        node_name: &str,
        sw_version: Option<&str>,
        fw_version: Option<&str>,
        hw_board_id: Option<&str>,
    ) -> Value {
        let mut layers: Vec<&Value> = Vec::new();
        if let Some(base) = Self::base_for(&self.base_configs, sw_version) {
            layers.push(base);
        }
        if let Some(fw_base) = Self::base_for(&self.fw_base_configs, fw_version) {
            layers.push(fw_base);
        }
        if let Some(hw_base) = hw_board_id
            .and_then(|id| self.hardware_config_type(id))
            .and_then(|t| self.hw_base_configs.get(t))
            .and_then(|table| Self::base_for(table, sw_version))
        {
            layers.push(hw_base);
        }
        layers.push(&self.network_overrides);
        let auto = self.auto_node_overrides.get(node_name);
        if let Some(auto) = auto {
            layers.push(auto);
        }
        let manual = self.node_overrides.get(node_name);
        if let Some(manual) = manual {
            layers.push(manual);
        }
        merge_layers(layers)
    }

    /// Effective config plus its MD5.
    pub fn effective_config_with_md5(
        &self,
        node_name: &str,
        sw_version: Option<&str>,
        fw_version: Option<&str>,
        hw_board_id: Option<&str>,
    ) -> (Value, String) {
        let cfg = self.effective_config(node_name, sw_version, fw_version, hw_board_id);
        let md5 = config_md5(&cfg);
        (cfg, md5)
    }

    // ---- Override mutation ----

    /// Replace manual node overrides wholesale. The input must be a JSON
    /// object keyed by node name.
    pub fn set_node_overrides(&mut self, overrides_json: &str) -> Result<()> {
        let parsed: Value =
            serde_json::from_str(overrides_json).context("node overrides are not valid JSON")?;
        if !parsed.is_object() {
            return Err(anyhow!("node overrides must be a JSON object keyed by node"));
        }
        self.node_overrides = parsed;
        self.persist(
            &self.paths.node_overrides_file.clone(),
            &self.node_overrides.clone(),
        )
    }

    /// Merge manual overrides for a subset of nodes.
    pub fn merge_node_overrides(&mut self, overrides_json: &str) -> Result<()> {
        let parsed: Value =
            serde_json::from_str(overrides_json).context("node overrides are not valid JSON")?;
        if !parsed.is_object() {
            return Err(anyhow!("node overrides must be a JSON object keyed by node"));
        }
        merge(&mut self.node_overrides, &parsed);
        self.persist(
            &self.paths.node_overrides_file.clone(),
            &self.node_overrides.clone(),
        )
    }

    pub fn set_network_overrides(&mut self, overrides_json: &str) -> Result<()> {
        let parsed: Value =
            serde_json::from_str(overrides_json).context("network overrides are not valid JSON")?;
        if !parsed.is_object() {
            return Err(anyhow!("network overrides must be a JSON object"));
        }
        self.network_overrides = parsed;
        self.persist(
            &self.paths.network_overrides_file.clone(),
            &self.network_overrides.clone(),
        )
    }

    /// Write automated overrides for one node (polarity, golay, channel,
    /// prefix, topology info). Merged over any existing auto overrides.
    pub fn set_auto_node_overrides(&mut self, node_name: &str, overrides: Value) -> Result<()> {
        let mut wrapper = Map::new();
        wrapper.insert(node_name.to_string(), overrides);
        merge(&mut self.auto_node_overrides, &Value::Object(wrapper));
        self.persist(
            &self.paths.auto_node_overrides_file.clone(),
            &self.auto_node_overrides.clone(),
        )
    }

    /// Rename override entries when a node is renamed.
    pub fn rename_node(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        for store in [&mut self.node_overrides, &mut self.auto_node_overrides] {
            if let Value::Object(map) = store {
                if let Some(v) = map.remove(old_name) {
                    map.insert(new_name.to_string(), v);
                }
            }
        }
        self.persist(
            &self.paths.node_overrides_file.clone(),
            &self.node_overrides.clone(),
        )?;
        self.persist(
            &self.paths.auto_node_overrides_file.clone(),
            &self.auto_node_overrides.clone(),
        )
    }

    pub fn node_overrides(&self, nodes: &[String]) -> Value {
        filter_by_nodes(&self.node_overrides, nodes)
    }

    pub fn auto_node_overrides(&self, nodes: &[String]) -> Value {
        filter_by_nodes(&self.auto_node_overrides, nodes)
    }

    pub fn network_overrides(&self) -> &Value {
        &self.network_overrides
    }

    pub fn all_node_overrides_json(&self) -> String {
        self.node_overrides.to_string()
    }

    pub fn all_network_overrides_json(&self) -> String {
        self.network_overrides.to_string()
    }

    /// Restore replicated overrides from the HA peer (no persistence paths
    /// are touched when they are unset, e.g. on a fresh backup).
    pub fn apply_replicated(&mut self, node_overrides: Option<&str>, network_overrides: Option<&str>) {
        if let Some(raw) = node_overrides {
            if let Ok(v) = serde_json::from_str::<Value>(raw) {
                self.node_overrides = v;
            }
        }
        if let Some(raw) = network_overrides {
            if let Ok(v) = serde_json::from_str::<Value>(raw) {
                self.network_overrides = v;
            }
        }
    }

    fn persist(&self, path: &Path, value: &Value) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Ok(()); // persistence disabled
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let pretty = serde_json::to_string_pretty(value)?;
        std::fs::write(path, pretty).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn filter_by_nodes(store: &Value, nodes: &[String]) -> Value {
    if nodes.is_empty() {
        return store.clone();
    }
    let mut out = Map::new();
    if let Value::Object(map) = store {
        for node in nodes {
            if let Some(v) = map.get(node) {
                out.insert(node.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn read_versioned_dir(dir: &Path) -> Result<BTreeMap<SwVersionKey, Value>> {
    let mut out = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            warn!("base config directory {} not readable, skipping", dir.display());
            return Ok(out);
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) if parsed.is_object() => {
                out.insert(SwVersionKey(SwVersion::new(stem)), parsed);
            }
            Ok(_) => warn!("base config {} is not a JSON object, skipping", path.display()),
            Err(e) => warn!("base config {} failed to parse: {}", path.display(), e),
        }
    }
    info!("Loaded {} base config(s) from {}", out.len(), dir.display());
    Ok(out)
}

fn read_hw_types(path: &Path) -> BTreeMap<String, Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<BTreeMap<String, Vec<String>>>(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!("hardware types file {} failed to parse: {}", path.display(), e);
                BTreeMap::new()
            }
        },
        Err(_) => BTreeMap::new(),
    }
}

fn read_json_or_empty(path: &Path) -> Value {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(v) if v.is_object() => v,
            _ => {
                warn!("override file {} is not a JSON object, starting empty", path.display());
                Value::Object(Map::new())
            }
        },
        Err(_) => Value::Object(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn helper_with_layers(tmp: &TempDir) -> ConfigHelper {
        let base_dir = tmp.path().join("base_versions");
        std::fs::create_dir_all(&base_dir).unwrap();
        std::fs::write(
            base_dir.join("RELEASE_M80.json"),
            json!({
                "radioParamsBase": {"fwParams": {"laMaxMcs": 12, "txPower": 28}},
                "sysParams": {"managedConfig": true}
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            base_dir.join("RELEASE_M81.json"),
            json!({
                "radioParamsBase": {"fwParams": {"laMaxMcs": 12, "txPower": 30}},
                "sysParams": {"managedConfig": true}
            })
            .to_string(),
        )
        .unwrap();

        let hw_dir = tmp.path().join("hw_versions");
        std::fs::create_dir_all(hw_dir.join("NXP")).unwrap();
        std::fs::write(
            hw_dir.join("NXP").join("RELEASE_M80.json"),
            json!({"envParams": {"DPDK_ENABLED": "1"}}).to_string(),
        )
        .unwrap();
        std::fs::write(
            hw_dir.join("hw_types.json"),
            json!({"NXP": ["NXP_LS1048A_PUMA"]}).to_string(),
        )
        .unwrap();

        let paths = ConfigPaths {
            base_config_dir: base_dir,
            fw_base_config_dir: tmp.path().join("fw_versions"),
            hw_base_config_dir: hw_dir.clone(),
            hw_config_types_file: hw_dir.join("hw_types.json"),
            node_overrides_file: tmp.path().join("node_config_overrides.json"),
            auto_node_overrides_file: tmp.path().join("auto_node_config_overrides.json"),
            network_overrides_file: tmp.path().join("network_config_overrides.json"),
        };
        ConfigHelper::load(paths).unwrap()
    }

    #[test]
    fn test_layer_precedence() {
        let tmp = TempDir::new().unwrap();
        let mut helper = helper_with_layers(&tmp);
        helper
            .set_network_overrides(&json!({"radioParamsBase": {"fwParams": {"txPower": 20}}}).to_string())
            .unwrap();
        helper
            .set_node_overrides(
                &json!({"node-1": {"radioParamsBase": {"fwParams": {"laMaxMcs": 10}}}}).to_string(),
            )
            .unwrap();

        let cfg = helper.effective_config("node-1", Some("RELEASE_M80"), None, None);
        // Manual override wins over network override over base.
        assert_eq!(
            cfg.pointer("/radioParamsBase/fwParams/laMaxMcs"),
            Some(&json!(10))
        );
        assert_eq!(
            cfg.pointer("/radioParamsBase/fwParams/txPower"),
            Some(&json!(20))
        );
        // A node with no overrides sees the network layer.
        let cfg = helper.effective_config("node-2", Some("RELEASE_M80"), None, None);
        assert_eq!(
            cfg.pointer("/radioParamsBase/fwParams/laMaxMcs"),
            Some(&json!(12))
        );
    }

    #[test]
    fn test_base_version_selection() {
        let tmp = TempDir::new().unwrap();
        let helper = helper_with_layers(&tmp);
        // Exact match.
        let cfg = helper.effective_config("n", Some("RELEASE_M80"), None, None);
        assert_eq!(cfg.pointer("/radioParamsBase/fwParams/txPower"), Some(&json!(28)));
        // Newer node than any base: newest base at or below.
        let cfg = helper.effective_config("n", Some("RELEASE_M82"), None, None);
        assert_eq!(cfg.pointer("/radioParamsBase/fwParams/txPower"), Some(&json!(30)));
        // Unknown version: newest base.
        let cfg = helper.effective_config("n", None, None, None);
        assert_eq!(cfg.pointer("/radioParamsBase/fwParams/txPower"), Some(&json!(30)));
    }

    #[test]
    fn test_hw_base_layer_applied_by_board_id() {
        let tmp = TempDir::new().unwrap();
        let helper = helper_with_layers(&tmp);
        let cfg =
            helper.effective_config("n", Some("RELEASE_M80"), None, Some("NXP_LS1048A_PUMA"));
        assert_eq!(cfg.pointer("/envParams/DPDK_ENABLED"), Some(&json!("1")));
        let cfg = helper.effective_config("n", Some("RELEASE_M80"), None, Some("UNKNOWN_BOARD"));
        assert_eq!(cfg.pointer("/envParams/DPDK_ENABLED"), None);
    }

    #[test]
    fn test_md5_changes_with_overrides() {
        let tmp = TempDir::new().unwrap();
        let mut helper = helper_with_layers(&tmp);
        let (_, md5_before) =
            helper.effective_config_with_md5("node-1", Some("RELEASE_M80"), None, None);
        helper
            .set_node_overrides(
                &json!({"node-1": {"radioParamsBase": {"fwParams": {"laMaxMcs": 10}}}}).to_string(),
            )
            .unwrap();
        let (_, md5_after) =
            helper.effective_config_with_md5("node-1", Some("RELEASE_M80"), None, None);
        assert_ne!(md5_before, md5_after);
    }

    #[test]
    fn test_overrides_persist_and_reload() {
        let tmp = TempDir::new().unwrap();
        let mut helper = helper_with_layers(&tmp);
        helper
            .set_node_overrides(&json!({"node-1": {"sysParams": {"x": 1}}}).to_string())
            .unwrap();
        // A fresh helper over the same paths sees the persisted overrides.
        let helper2 = helper_with_layers(&tmp);
        assert_eq!(
            helper2.node_overrides(&["node-1".to_string()]),
            json!({"node-1": {"sysParams": {"x": 1}}})
        );
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut helper = helper_with_layers(&tmp);
        assert!(helper.set_node_overrides("not json").is_err());
        assert!(helper.set_node_overrides("[1,2,3]").is_err());
    }

    #[test]
    fn test_sw_version_ordering() {
        assert!(SwVersion::new("RELEASE_M81") > SwVersion::new("RELEASE_M80"));
        assert!(SwVersion::new("RELEASE_M80_1") > SwVersion::new("RELEASE_M80"));
        assert!(SwVersion::new("RELEASE_M100") > SwVersion::new("RELEASE_M81"));
    }
}
