//! Daemon configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `BUSMIRROR_*` environment variables (`__` separates nested keys, e.g.
//! `BUSMIRROR_BROKER__WORKER_THREADS=4`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use busmirror_bus::ConnectionConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, SourcePolicy};
use crate::manager::BrokerManagerConfig;
use crate::relation::RelationRule;

pub const ENV_PREFIX: &str = "BUSMIRROR_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(Box<figment::Error>),

    #[error("Unknown formatter '{formatter}' for member {member}")]
    UnknownFormatter { member: String, formatter: String },

    #[error("Invalid entity {name}: {reason}")]
    InvalidEntity { name: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub broker: BrokerSection,
    pub connection: ConnectionSection,
    #[serde(rename = "entity")]
    pub entities: Vec<EntityConfig>,
    #[serde(rename = "relation")]
    pub relations: Vec<RelationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub worker_threads: usize,
    pub watch_wait_ms: u64,
    pub owner_wait_ms: u64,
    pub add_signal_delay_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            worker_threads: 10,
            watch_wait_ms: 500,
            owner_wait_ms: 1000,
            add_signal_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub pump_sleep_ms: u64,
    pub name_lookup_attempts: u32,
    pub name_lookup_interval_ms: u64,
    pub guard_unit_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            pump_sleep_ms: 20,
            name_lookup_attempts: 15,
            name_lookup_interval_ms: 1000,
            guard_unit_ms: 1,
        }
    }
}

impl ConnectionSection {
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            pump_sleep: Duration::from_millis(self.pump_sleep_ms),
            name_lookup_attempts: self.name_lookup_attempts,
            name_lookup_interval: Duration::from_millis(self.name_lookup_interval_ms),
            guard_unit: Duration::from_millis(self.guard_unit_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Cached,
    Lazy,
    ShortTimeCached,
}

/// One `[[entity]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Refreshed by a broker; otherwise the query runs on demand under the
    /// entity's policy
    #[serde(default = "default_true")]
    pub scheduled: bool,
    /// Broker interval, 0 runs once
    #[serde(default)]
    pub refresh_secs: u64,
    #[serde(default = "default_true")]
    pub watch: bool,
    pub query: QueryConfig,
}

fn default_true() -> bool {
    true
}

impl EntityConfig {
    pub fn source_policy(&self) -> ConfigResult<SourcePolicy> {
        match self.policy {
            PolicyKind::Cached => Ok(SourcePolicy::Cached),
            PolicyKind::Lazy => Ok(SourcePolicy::Lazy),
            PolicyKind::ShortTimeCached => self
                .ttl_secs
                .map(|ttl| SourcePolicy::ShortTimeCached(Duration::from_secs(ttl)))
                .ok_or_else(|| ConfigError::InvalidEntity {
                    name: self.name.clone(),
                    reason: "short_time_cached requires ttl_secs".to_string(),
                }),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuerySource {
    FindObject {
        path: String,
        #[serde(default)]
        depth: u32,
        #[serde(default)]
        service: Option<String>,
        /// Overrides the interfaces taken from the field table
        #[serde(default)]
        interfaces: Vec<String>,
    },
    GetObject {
        service: String,
        path: String,
    },
    IntrospectService {
        service: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(flatten)]
    pub source: QuerySource,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

/// One `property -> member` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub interface: String,
    pub property: String,
    /// Defaults to the property name
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub formatters: Vec<String>,
}

impl FieldConfig {
    pub fn member_name(&self) -> &str {
        self.member.as_deref().unwrap_or(&self.property)
    }
}

/// One `[[relation]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationConfig {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub rules: Vec<RelationRule>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl DaemonConfig {
    /// Defaults, then `path` when given, then the environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(DaemonConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Defaults overlaid with TOML text, without the environment
    pub fn parse(content: &str) -> ConfigResult<Self> {
        Self::extract(Figment::from(Serialized::defaults(DaemonConfig::default())).merge(Toml::string(content)))
    }

    fn extract(figment: Figment) -> ConfigResult<Self> {
        let config: DaemonConfig = figment
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))?;
        tracing::debug!(
            entities = config.entities.len(),
            relations = config.relations.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn manager_config(&self) -> BrokerManagerConfig {
        BrokerManagerConfig {
            worker_threads: self.broker.worker_threads.max(1),
            watch_wait: Duration::from_millis(self.broker.watch_wait_ms),
            owner_wait: Duration::from_millis(self.broker.owner_wait_ms),
            add_signal_delay: Duration::from_millis(self.broker.add_signal_delay_ms),
            connection: self.connection.to_connection_config(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
