use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::cache::CacheConfig;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Process-wide runtime configuration, initialised from the config file on first use
/// by `RuntimeConfig::from_toml`
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the state machine stores, the session tracker and the watermark
    pub state_dir: PathBuf,
    /// Records per file before a durable slot switches to its other file
    pub rotation_threshold: u64,
    /// Applied entries between two checkpoints
    pub flush_every: u64,
    pub in_flight_cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            state_dir: PathBuf::from("data/state"),
            rotation_threshold: 1000,
            flush_every: 100,
            in_flight_cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Member id, a random one is picked when absent
    pub member_id: Option<uuid::Uuid>,
    pub log_dir: PathBuf,
    pub entries_per_segment: u64,
    pub metrics_addr: String,
    /// Interval of the demo proposer in milliseconds, 0 disables it
    pub propose_interval_ms: u64,
    pub engine: EngineConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            member_id: None,
            log_dir: PathBuf::from("data/log"),
            entries_per_segment: crate::storage::log::DEFAULT_ENTRIES_PER_SEGMENT,
            metrics_addr: "0.0.0.0:4010".to_string(),
            propose_interval_ms: 1000,
            engine: EngineConfig::default(),
        }
    }

    /// Reads the config file, falling back to defaults when it is missing or malformed.
    /// The result also becomes the process-wide instance.
    pub fn from_toml(path: &str) -> Self {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<RuntimeConfig>(&contents) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Something went wrong parsing the runtime config file, {:?}", e);
                    RuntimeConfig::new()
                }
            },
            Err(e) => {
                warn!("Something went wrong reading the runtime config file, {:?}", e);
                RuntimeConfig::new()
            }
        };
        *instance().lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
        config
    }
}
