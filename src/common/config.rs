/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::message::table::{ParamTable, Value};

/// Configuration for the luahive runtime
///
/// This struct contains the host-level configurable values, loaded from
/// TOML files in XDG-compliant directories. They seed the per-agent
/// configuration tables (see [`AgentConfiguration`]) and size a few
/// internal mechanisms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct RuntimeConfig {
    /// Seed values for per-agent configuration tables
    pub defaults: DefaultsConfig,
    /// Limits and capacity configuration
    pub limits: LimitsConfig,
}

/// Seed values copied into each new agent's configuration table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Idle threshold in seconds for the replication decision
    pub lua_start_new_thread_time: f64,
    /// Log every send and receive when true
    pub log_messages: bool,
    /// Log replication decisions when true
    pub log_replication: bool,
}

/// Limits and capacity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Instruction interval at which scripted workers poll the
    /// interrupt flag
    pub hook_instruction_interval: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            lua_start_new_thread_time: 0.01,
            log_messages: false,
            log_replication: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            hook_instruction_interval: 10_000,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from XDG-compliant locations
    ///
    /// This function attempts to load `luahive/config.toml` from the
    /// XDG configuration search path. If no configuration file is
    /// found, returns the default configuration. If a configuration
    /// file exists but is malformed, logs an error and uses defaults.
    pub fn load() -> Self {
        use tracing::{error, info};

        let xdg_dirs = match xdg::BaseDirectories::with_prefix("luahive") {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Failed to initialize XDG directories: {}", e);
                return Self::default();
            }
        };

        let config_path = xdg_dirs.find_config_file("config.toml");

        if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            match std::fs::read_to_string(&path) {
                Ok(config_str) => match toml::from_str::<Self>(&config_str) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Failed to parse configuration file {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    error!("Failed to read configuration file {}: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }
}

lazy_static! {
    /// Global configuration instance loaded from XDG-compliant locations
    pub static ref CONFIG: RuntimeConfig = RuntimeConfig::load();
}

/// Name of the sub-table that holds the runtime-interpreted
/// configuration values.
pub const INTERNAL: &str = "internal";
/// Seconds of non-idle time after which a busy scripted worker may
/// replicate.
pub const LUA_START_NEW_THREAD_TIME: &str = "luaStartNewThreadTime";
/// When true, every send and receive for the agent is logged.
pub const LOG_MESSAGES: &str = "logMessages";
/// When true, every replication decision for the agent is logged.
pub const LOG_REPLICATION: &str = "logReplication";

/// Stores one agent's configuration table.
///
/// The table is readable and replaceable from scripts via `getconfig`
/// and `setconfig`; the runtime reads its own knobs from the reserved
/// `internal` sub-table. Key names are part of the external contract.
#[derive(Debug)]
pub struct AgentConfiguration {
    table: Mutex<ParamTable>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        let mut table = ParamTable::default();
        let internal = table.sub_table_mut(INTERNAL);
        internal.set(LUA_START_NEW_THREAD_TIME, CONFIG.defaults.lua_start_new_thread_time);
        internal.set(LOG_MESSAGES, CONFIG.defaults.log_messages);
        internal.set(LOG_REPLICATION, CONFIG.defaults.log_replication);
        Self { table: Mutex::new(table) }
    }
}

impl AgentConfiguration {
    /// Creates a configuration seeded from the host [`CONFIG`] defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the whole configuration table, including the internal
    /// sub-table.
    pub fn table(&self) -> ParamTable {
        self.table.lock().clone()
    }

    /// Replaces the configuration table, including the internal
    /// sub-table.
    pub fn set_table(&self, table: ParamTable) {
        *self.table.lock() = table;
    }

    fn internal_value(&self, key: &str) -> Option<Value> {
        let table = self.table.lock();
        table.sub_table(INTERNAL).and_then(|internal| internal.get_value(key).cloned())
    }

    /// The idle threshold in seconds used by the replication decision.
    pub fn idle_threshold(&self) -> f64 {
        match self.internal_value(LUA_START_NEW_THREAD_TIME) {
            Some(Value::Num(seconds)) => seconds,
            Some(Value::Int(seconds)) => seconds as f64,
            _ => CONFIG.defaults.lua_start_new_thread_time,
        }
    }

    /// Whether sends and receives should be logged for this agent.
    pub fn log_messages(&self) -> bool {
        matches!(self.internal_value(LOG_MESSAGES), Some(Value::Bool(true)))
    }

    /// Whether replication decisions should be logged for this agent.
    pub fn log_replication(&self) -> bool {
        matches!(self.internal_value(LOG_REPLICATION), Some(Value::Bool(true)))
    }
}
