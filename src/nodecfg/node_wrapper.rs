//! Minion-side node config state.
//!
//! Holds the currently applied config JSON and its MD5. When a config
//! change schedules a reboot or minion restart, the previously reported MD5
//! is kept until the restart actually happens, so the controller does not
//! see the new hash before the node has acted on it.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::info;

use super::merge::config_md5;

#[derive(Debug)]
pub struct NodeConfigWrapper {
    config_file: PathBuf,
    config: Value,
    config_md5: String,
    /// MD5 of the config before the most recent set.
    last_md5: String,
    /// MD5 to report while a restart-triggering change is pending.
    previous_md5: Option<String>,
}

impl NodeConfigWrapper {
    /// Load the node config file; a missing file starts empty (the
    /// controller will push a config on first contact).
    pub fn load(config_file: impl Into<PathBuf>) -> Self {
        let config_file = config_file.into();
        let config = std::fs::read_to_string(&config_file)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .filter(|v| v.is_object())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let md5 = config_md5(&config);
        Self {
            config_file,
            config,
            last_md5: md5.clone(),
            config_md5: md5,
            previous_md5: None,
        }
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn config_json(&self) -> String {
        self.config.to_string()
    }

    /// The MD5 to report in status reports.
    pub fn reported_md5(&self) -> &str {
        self.previous_md5.as_deref().unwrap_or(&self.config_md5)
    }

    /// The MD5 of the actually applied config.
    pub fn current_md5(&self) -> &str {
        &self.config_md5
    }

    /// Report the MD5 from before the most recent set until restart (or
    /// clear the latch).
    pub fn use_previous_config_md5(&mut self, enable: bool) {
        if enable {
            if self.previous_md5.is_none() {
                self.previous_md5 = Some(self.last_md5.clone());
            }
        } else {
            self.previous_md5 = None;
        }
    }

    /// Apply and persist a new config. Returns the old config for diffing.
    pub fn set_node_config(&mut self, config_json: &str) -> Result<Value> {
        let parsed: Value =
            serde_json::from_str(config_json).context("node config is not valid JSON")?;
        if !parsed.is_object() {
            anyhow::bail!("node config must be a JSON object");
        }
        let old = std::mem::replace(&mut self.config, parsed);
        self.last_md5 = std::mem::take(&mut self.config_md5);
        self.config_md5 = config_md5(&self.config);
        if !self.config_file.as_os_str().is_empty() {
            if let Some(parent) = self.config_file.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&self.config_file, serde_json::to_string_pretty(&self.config)?)
                .with_context(|| format!("writing {}", self.config_file.display()))?;
            info!("Wrote node config to {}", self.config_file.display());
        }
        Ok(old)
    }
}
