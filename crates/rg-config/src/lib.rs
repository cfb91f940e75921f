//! RelayGate Configuration
//!
//! TOML-based configuration for the gateway binary. Every section is
//! optional; an empty file runs an in-memory gateway with no processors.
//!
//! ```toml
//! [engine]
//! default_max_concurrent_msgs = 4
//! redelivery = { max_redeliveries = 3, delay_ms = 3000 }
//!
//! [store]
//! kind = "sqlite"
//! url = "sqlite://relaygate.db?mode=rwc"
//!
//! [[processors]]
//! id = "sms-out"
//! priority = 10
//! kind = "log"
//!
//! [[processors.acceptors]]
//! type = "exact_match"
//! field = "to"
//! expression = "123"
//! ```
//!
//! Environment overrides applied by `load()`:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `RG_STORE_KIND` | `store.kind` |
//! | `RG_STORE_URL` | `store.url` |
//! | `RG_LOG_JSON` | `logging.json` |

mod error;
mod rules;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rg_common::Direction;
use rg_router::{normalize_id, EngineConfig, RedeliveryPolicy, RetrySchedulerConfig, DEFAULT_PRIORITY};
use serde::Deserialize;
use tracing::debug;

pub use error::{ConfigError, Result};
pub use rules::{AcceptorConfig, ActionConfig};

pub const ENV_STORE_KIND: &str = "RG_STORE_KIND";
pub const ENV_STORE_URL: &str = "RG_STORE_URL";
pub const ENV_LOG_JSON: &str = "RG_LOG_JSON";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub engine: EngineSection,
    pub retry: RetrySection,
    pub store: StoreSection,
    pub processors: Vec<ProcessorSection>,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub redelivery: RedeliverySection,
    pub default_max_concurrent_msgs: usize,
    pub receiver_direction: DirectionConfig,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            redelivery: RedeliverySection::default(),
            default_max_concurrent_msgs: rg_router::DEFAULT_MAX_CONCURRENT_MSGS,
            receiver_direction: DirectionConfig::ToConnections,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            redelivery: RedeliveryPolicy {
                max_redeliveries: self.redelivery.max_redeliveries,
                delay: Duration::from_millis(self.redelivery.delay_ms),
            },
            default_max_concurrent_msgs: self.default_max_concurrent_msgs,
            receiver_direction: self.receiver_direction.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedeliverySection {
    pub max_redeliveries: u32,
    pub delay_ms: u64,
}

impl Default for RedeliverySection {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionConfig {
    ToConnections,
    ToApplications,
}

impl From<DirectionConfig> for Direction {
    fn from(direction: DirectionConfig) -> Self {
        match direction {
            DirectionConfig::ToConnections => Direction::ToConnections,
            DirectionConfig::ToApplications => Direction::ToApplications,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub retry_unroutable: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 60_000,
            interval_ms: 60_000,
            retry_unroutable: false,
        }
    }
}

impl RetrySection {
    pub fn to_scheduler_config(&self) -> RetrySchedulerConfig {
        RetrySchedulerConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            interval: Duration::from_millis(self.interval_ms),
            retry_unroutable: self.retry_unroutable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
    Postgres,
    Mysql,
    Mongo,
}

impl StoreKind {
    pub fn needs_url(self) -> bool {
        self != StoreKind::Memory
    }
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "sqlite" => Ok(StoreKind::Sqlite),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            "mysql" => Ok(StoreKind::Mysql),
            "mongo" | "mongodb" => Ok(StoreKind::Mongo),
            other => Err(ConfigError::invalid_value(
                "store",
                "store",
                "kind",
                format!("unknown kind '{}', use memory, sqlite, postgres, mysql or mongo", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub kind: StoreKind,
    pub url: Option<String>,
    /// MongoDB database name
    pub database: String,
    pub max_connections: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: None,
            database: "relaygate".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Logs each message
    #[default]
    Log,
    /// Records messages in memory
    Fake,
    /// Fails every message
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorSection {
    pub id: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub kind: ProcessorKind,
    pub max_concurrent_msgs: Option<usize>,
    #[serde(default)]
    pub acceptors: Vec<AcceptorConfig>,
    #[serde(default)]
    pub pre_processing_actions: Vec<ActionConfig>,
    #[serde(default)]
    pub post_processing_actions: Vec<ActionConfig>,
    /// Applied to replies and receipts the processor emits
    #[serde(default)]
    pub post_receiving_actions: Vec<ActionConfig>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// JSON log lines instead of human-readable output
    pub json: bool,
}

impl GatewayConfig {
    /// Read a TOML file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut config: GatewayConfig = toml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;

        debug!(
            path = %path.display(),
            processors = config.processors.len(),
            store = ?config.store.kind,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        let mut config = GatewayConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(kind) = lookup(ENV_STORE_KIND) {
            self.store.kind = kind.parse()?;
        }
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = Some(url);
        }
        if let Some(json) = lookup(ENV_LOG_JSON) {
            self.logging.json = matches!(json.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Checks:
    /// - store URL present for database-backed stores
    /// - processor ids non-empty and unique after normalization
    /// - concurrency limits at least 1
    /// - every acceptor and action builds
    pub fn validate(&self) -> Result<()> {
        if self.store.kind.needs_url() && self.store.url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::missing_field("store", format!("{:?}", self.store.kind), "url"));
        }
        if self.engine.default_max_concurrent_msgs == 0 {
            return Err(ConfigError::invalid_value(
                "engine",
                "engine",
                "default_max_concurrent_msgs",
                "must be at least 1",
            ));
        }

        let mut seen = HashSet::new();
        for processor in &self.processors {
            let id = normalize_id(&processor.id)
                .map_err(|_| ConfigError::missing_field("processor", processor.id.clone(), "id"))?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateProcessor { id });
            }
            if processor.max_concurrent_msgs == Some(0) {
                return Err(ConfigError::invalid_value(
                    "processor",
                    id,
                    "max_concurrent_msgs",
                    "must be at least 1",
                ));
            }
            for acceptor in &processor.acceptors {
                acceptor.build().map_err(|e| ConfigError::rule(id.clone(), e))?;
            }
            let actions = processor
                .pre_processing_actions
                .iter()
                .chain(&processor.post_processing_actions)
                .chain(&processor.post_receiving_actions);
            for action in actions {
                action.build().map_err(|e| ConfigError::rule(id.clone(), e))?;
            }
        }
        Ok(())
    }
}

impl FromStr for GatewayConfig {
    type Err = ConfigError;

    /// Parse and validate without environment overrides
    fn from_str(s: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
