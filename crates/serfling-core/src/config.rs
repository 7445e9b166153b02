//! Configuration resolution for serfling.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/serfling/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`SERFLING_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete serfling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Options forwarded to `serf agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path to the `serf` binary.
    pub serf: PathBuf,
    /// Node name (`-node`). Serf falls back to the hostname when unset.
    pub node: Option<String>,
    pub rpc_addr: String,
    pub bind: Option<String>,
    pub iface: Option<String>,
    pub advertise: Option<String>,
    pub config_file: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub discover: Option<String>,
    pub join: Option<String>,
    pub snapshot: Option<PathBuf>,
    pub encrypt: Option<String>,
    pub profile: Option<String>,
    pub protocol: Option<u8>,
    pub replay: bool,
    /// Initial tags (`-tag k=v`).
    pub tags: BTreeMap<String, String>,
    pub tags_file: Option<PathBuf>,
    /// Extra `-event-handler` invocations appended after the relay's own.
    pub event_handlers: Vec<String>,
    pub log_level: String,
    /// File receiving the agent's stdout/stderr. Discarded when unset.
    pub log_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            serf: PathBuf::from("serf"),
            node: None,
            rpc_addr: "127.0.0.1:7373".to_string(),
            bind: None,
            iface: None,
            advertise: None,
            config_file: None,
            config_dir: None,
            discover: None,
            join: None,
            snapshot: None,
            encrypt: None,
            profile: None,
            protocol: None,
            replay: false,
            tags: BTreeMap::new(),
            tags_file: None,
            event_handlers: Vec::new(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Event relay dispatch policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Handle each query on its own task instead of on the accept loop.
    pub async_query: bool,
    /// Dispatch each non-query event on its own task instead of the
    /// sequential queue.
    pub parallel_events: bool,
    /// Idle timeout for reading one frame (seconds).
    pub read_timeout_secs: u64,
    /// Shut the relay down on the first hook or responder failure.
    pub propagate_handler_errors: bool,
    /// Upper bound on concurrently running query and parallel-event
    /// handlers. `None` means unbounded.
    pub max_concurrent_handlers: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            async_query: true,
            parallel_events: false,
            read_timeout_secs: 5,
            propagate_handler_errors: false,
            max_concurrent_handlers: Some(64),
        }
    }
}

impl RelayConfig {
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Agent process supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds to wait after SIGINT before sending SIGKILL.
    pub stop_timeout_secs: u64,
    /// Path to the `serfling-event-handler` helper. Defaults to the binary
    /// installed next to the running executable.
    pub event_handler: Option<PathBuf>,
    /// Kill the agent when the supervisor is dropped while still running.
    pub kill_on_drop: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
            event_handler: None,
            kill_on_drop: true,
        }
    }
}

impl SupervisorConfig {
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|path| path.exists());
    let mut config = resolve_files(global.as_deref(), explicit)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("serfling").join("settings.json"))
}

pub fn load_config_file(path: &Path) -> Result<Config> {
    let layer = read_layer(path)?;
    Config::deserialize(&layer).map_err(|e| invalid_file(path, &e))
}

/// Resolve the global and explicit files over the built-in defaults.
///
/// Each file only overrides the keys it sets. Objects (including `tags`)
/// merge key by key; any other value, arrays included, replaces the one
/// beneath it.
pub fn resolve_files(global: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut merged = Value::Object(Map::new());

    if let Some(path) = global {
        debug!(path = %path.display(), "Loading global config");
        merge_layer(&mut merged, read_layer(path)?);
    }
    if let Some(path) = explicit {
        debug!(path = %path.display(), "Loading config file");
        merge_layer(&mut merged, read_layer(path)?);
    }

    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Read one config file, checking that it is a valid configuration on its own.
fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let layer: Value = serde_json::from_str(&content).map_err(|e| invalid_file(path, &e))?;
    Config::deserialize(&layer).map_err(|e| invalid_file(path, &e))?;
    Ok(layer)
}

fn invalid_file(path: &Path, err: &serde_json::Error) -> Error {
    Error::Config(format!("Failed to parse config file {}: {}", path.display(), err))
}

fn merge_layer(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_layer(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `SERFLING_*` overrides using `lookup` to read variables.
pub fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SERFLING_SERF_BIN") {
        config.agent.serf = PathBuf::from(val);
    }
    if let Some(val) = lookup("SERFLING_NODE") {
        config.agent.node = Some(val);
    }
    if let Some(val) = lookup("SERFLING_RPC_ADDR") {
        config.agent.rpc_addr = val;
    }
    if let Some(val) = lookup("SERFLING_BIND") {
        config.agent.bind = Some(val);
    }
    if let Some(val) = lookup("SERFLING_LOG_LEVEL") {
        config.agent.log_level = val;
    }
    if let Some(val) = lookup("SERFLING_ASYNC_QUERY")
        && let Ok(flag) = val.parse()
    {
        config.relay.async_query = flag;
    }
    if let Some(val) = lookup("SERFLING_PARALLEL_EVENTS")
        && let Ok(flag) = val.parse()
    {
        config.relay.parallel_events = flag;
    }
    if let Some(val) = lookup("SERFLING_STOP_TIMEOUT")
        && let Ok(secs) = val.parse()
    {
        config.supervisor.stop_timeout_secs = secs;
    }
    if let Some(val) = lookup("SERFLING_EVENT_HANDLER") {
        config.supervisor.event_handler = Some(PathBuf::from(val));
    }
}
