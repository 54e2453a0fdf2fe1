// src/config.rs

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Errors, NyxError};
use crate::watch::{Watch, DEFAULT_STOP_TIMEOUT};

fn default_polling_interval() -> u64 {
    5
}

fn default_restart_window() -> u64 {
    10
}

fn default_restart_limit() -> u32 {
    5
}

/// Global supervisor settings plus the declared watches, as read from the
/// configuration file.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SupervisorConfig {
    /// Seconds between poll ticks. Clamped to a minimum of 1.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,

    /// Width of the sliding window the restart budget is counted in, in
    /// seconds.
    #[serde(default = "default_restart_window")]
    pub restart_window: u64,

    /// Restarts allowed within `restart_window` before a watch is marked
    /// failed.
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,

    /// Declared services, keyed by watch name.
    #[serde(default)]
    pub watches: HashMap<String, WatchConfig>,
}

/// Raw per-watch settings exactly as they appear in the file; turned into
/// validated [`Watch`] records by [`SupervisorConfig::build_watches`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct WatchConfig {
    pub start: Vec<String>,
    pub stop: Option<Vec<String>>,
    pub dir: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub pid_file: Option<String>,
    pub log_file: Option<String>,
    pub error_file: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub http_check: Option<String>,
    pub http_check_port: Option<u16>,
    pub port_check: Option<u16>,
    pub max_cpu: Option<u32>,
    pub max_memory: Option<u64>,
    pub stop_timeout: Option<u64>,
    pub startup_delay: Option<u64>,
}

impl SupervisorConfig {
    /// Loads and deserializes the TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, NyxError> {
        let content = fs::read_to_string(path).map_err(|err| {
            NyxError::new(
                Errors::Config,
                format!("failed to read {}: {}", path.display(), err),
            )
        })?;

        let parsed: SupervisorConfig = toml::from_str(&content)?;
        Ok(parsed)
    }

    /// Produces the validated watch set for one configuration generation.
    /// Identifiers are assigned in name order so an unchanged file yields
    /// identical ids across reloads.
    pub fn build_watches(&self) -> Result<Vec<Watch>, NyxError> {
        let mut names: Vec<&String> = self.watches.keys().collect();
        names.sort();

        let mut watches = Vec::with_capacity(names.len());

        for (idx, name) in names.iter().enumerate() {
            let raw = &self.watches[*name];

            let watch = Watch {
                id: idx as i32 + 1,
                name: (*name).clone(),
                start: raw.start.clone(),
                stop: raw.stop.clone(),
                dir: raw.dir.clone(),
                uid: raw.uid.clone(),
                gid: raw.gid.clone(),
                pid_file: raw.pid_file.clone(),
                log_file: raw.log_file.clone(),
                error_file: raw.error_file.clone(),
                env: raw.env.clone(),
                http_check: raw.http_check.clone(),
                http_check_port: raw.http_check_port,
                port_check: raw.port_check,
                max_cpu: raw.max_cpu,
                max_memory: raw.max_memory,
                stop_timeout: raw.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
                startup_delay: raw.startup_delay.unwrap_or(0),
            };

            watch.validate()?;
            watches.push(watch);
        }

        Ok(watches)
    }
}
