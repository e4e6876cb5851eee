use std::fs::{create_dir_all, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_DIR_ENV: &str = "DROMID_CONFIG_DIR";

pub fn default_config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| concat!("/etc/", env!("CARGO_PKG_NAME")).into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue_num: u16,
    pub workers: usize,
    pub prompt_queue_capacity: usize,
    pub rules_file: PathBuf,
    /// Always merged with `rules_file`; rules added from it are never persisted back.
    pub blocklist_file: PathBuf,
    pub temp_rules_file: PathBuf,
    pub dns_log_file: PathBuf,
    pub prompt_command: String,
    pub display: String,
    pub localhost_refresh_secs: u64,
    pub poll_interval_ms: u64,
}

impl Config {
    /// Defaults with every file placed under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Config {
            queue_num: 0,
            workers: 4,
            prompt_queue_capacity: 1024,
            rules_file: dir.join("rules"),
            blocklist_file: dir.join("blocklist"),
            temp_rules_file: dir.join("rules.tmp"),
            dns_log_file: dir.join("hosts"),
            prompt_command: "dromi-prompt".into(),
            display: ":0".into(),
            localhost_refresh_secs: 5,
            poll_interval_ms: 1000,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn localhost_refresh(&self) -> Duration {
        Duration::from_secs(self.localhost_refresh_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::in_dir(&default_config_dir())
    }
}

/// Reads `<dir>/config.json`; fields it leaves out fall back to defaults
/// rooted at `dir`. A missing file yields the defaults.
pub fn load(dir: &Path) -> Result<Config> {
    create_dir_all(dir).with_context(|| format!("creating config directory {}", dir.display()))?;
    let path = dir.join("config.json");
    let f = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::in_dir(dir)),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    let partial: serde_json::Value =
        serde_json::from_reader(f).with_context(|| format!("parsing {}", path.display()))?;
    let mut merged = serde_json::to_value(Config::in_dir(dir))?;
    if let (Some(base), serde_json::Value::Object(overrides)) = (merged.as_object_mut(), partial) {
        base.extend(overrides);
    }
    serde_json::from_value(merged).with_context(|| format!("parsing {}", path.display()))
}
