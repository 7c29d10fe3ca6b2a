//! Unified configuration for Shardline.
//!
//! This module provides centralized configuration management with support for:
//! - Default values (the news site layout: auth, news feed, three article shards)
//! - Configuration files (TOML format)
//! - Environment variable overrides (prefix: `SHARDLINE__`)
//!
//! Configuration is read once at startup; nothing here is re-read at runtime.
//!
//! # Environment Variables
//!
//! - `SHARDLINE__ENVIRONMENT=prod` - Suffix appended to physical database names
//! - `SHARDLINE__DB_USER`, `SHARDLINE__DB_PASSWORD`, `SHARDLINE__DB_HOST`,
//!   `SHARDLINE__DB_PORT` - Credentials shared by every database
//! - `SHARDLINE__DATABASES__ARTICLES_A_DB__HOST=10.0.0.7` - Per-database override
//! - `SHARDLINE__LOGGING__LEVEL=debug`
//! - `SHARDLINE__LOGGING__JSON=true`
//!
//! # Example
//!
//! ```ignore
//! use shardline_storage::config::ShardlineConfig;
//!
//! let config = ShardlineConfig::load(Some("shardline.toml")).unwrap();
//! config.validate().unwrap();
//! println!("Shards: {:?}", config.sharding.shards);
//! ```

use crate::sharding::{ExplicitMappingStrategy, ModuloStrategy, ShardingStrategy};
use serde::{Deserialize, Serialize};
use shardline_core::{ShardError, ShardId, ShardingKey};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Role of the database holding users, sessions and other auth records.
pub const AUTH_ROLE: &str = "auth";
/// Role of the non-sharded content-metadata database (topics, counters).
pub const METADATA_ROLE: &str = "metadata";
/// Roles that must be configured for the process to start.
pub const REQUIRED_ROLES: [&str; 2] = [AUTH_ROLE, METADATA_ROLE];

const ENV_PREFIX: &str = "SHARDLINE__";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Required database role '{0}' is not configured")]
    MissingRole(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Shard(#[from] ShardError),
}

/// Root configuration for Shardline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardlineConfig {
    /// Deployment environment; appended to physical database names (`auth_db_prod`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Connection descriptors keyed by database alias
    pub databases: BTreeMap<String, DatabaseConfig>,
    /// Well-known roles mapped to database aliases
    pub roles: BTreeMap<String, String>,
    /// Shard set and strategy for sharded entity types
    pub sharding: ShardingConfig,
    /// Routers in priority order
    pub routers: Vec<RouterConfig>,
    /// Sequential key counter location
    pub sequence: SequenceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ShardlineConfig {
    fn default() -> Self {
        let databases = [
            ("default", "auth_db"),
            ("news_feed_db", "news_feed_db"),
            ("articles_a_db", "articles_a_db"),
            ("articles_b_db", "articles_b_db"),
            ("articles_c_db", "articles_c_db"),
        ]
        .into_iter()
        .map(|(alias, name)| (alias.to_string(), DatabaseConfig::memory(name)))
        .collect();

        let roles = [(AUTH_ROLE, "default"), (METADATA_ROLE, "news_feed_db")]
            .into_iter()
            .map(|(role, alias)| (role.to_string(), alias.to_string()))
            .collect();

        Self {
            environment: None,
            databases,
            roles,
            sharding: ShardingConfig::default(),
            routers: vec![
                RouterConfig::fixed_role("auth", &["users", "auth", "sessions"], AUTH_ROLE),
                RouterConfig::fixed_role("news_feed", &["news_feed"], METADATA_ROLE),
                RouterConfig::sharded("articles", &["articles"]),
            ],
            sequence: SequenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ShardlineConfig {
    /// Loads configuration from an optional file path with environment variable overrides.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (SHARDLINE__*)
    /// 2. Configuration file (if provided)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            } else {
                tracing::warn!(path = file_path, "Configuration file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    /// Applies overrides from a lookup keyed by the variable name without prefix.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("ENVIRONMENT") {
            self.environment = if val.is_empty() { None } else { Some(val) };
        }

        // Shared credentials first, per-database values win over them
        let shared_user = lookup("DB_USER");
        let shared_password = lookup("DB_PASSWORD");
        let shared_host = lookup("DB_HOST");
        let shared_port = lookup("DB_PORT").and_then(|v| v.parse().ok());

        for (alias, db) in self.databases.iter_mut() {
            if let Some(v) = &shared_user {
                db.user = v.clone();
            }
            if let Some(v) = &shared_password {
                db.password = v.clone();
            }
            if let Some(v) = &shared_host {
                db.host = v.clone();
            }
            if let Some(v) = shared_port {
                db.port = v;
            }

            let section = format!("DATABASES__{}__", alias.to_uppercase());
            if let Some(v) = lookup(&format!("{}ENGINE", section)) {
                db.engine = v;
            }
            if let Some(v) = lookup(&format!("{}HOST", section)) {
                db.host = v;
            }
            if let Some(v) = lookup(&format!("{}PORT", section)).and_then(|v| v.parse().ok()) {
                db.port = v;
            }
            if let Some(v) = lookup(&format!("{}USER", section)) {
                db.user = v;
            }
            if let Some(v) = lookup(&format!("{}PASSWORD", section)) {
                db.password = v;
            }
            if let Some(v) = lookup(&format!("{}NAME", section)) {
                db.name = v;
            }
        }

        if let Some(val) = lookup("LOGGING__LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("LOGGING__JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Checks cross-references so that a bad configuration fails at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for role in REQUIRED_ROLES {
            if !self.roles.contains_key(role) {
                return Err(ConfigError::MissingRole(role.to_string()));
            }
        }
        for (role, alias) in &self.roles {
            self.require_database(alias, &format!("role '{}'", role))?;
        }

        if self.sharding.shards.is_empty() {
            return Err(ConfigError::Shard(ShardError::Configuration(
                "shard set is empty".to_string(),
            )));
        }
        let mut seen = BTreeSet::new();
        for shard in &self.sharding.shards {
            if !seen.insert(shard) {
                return Err(ConfigError::Invalid(format!("shard '{}' is listed twice", shard)));
            }
            self.require_database(shard, "shard set")?;
        }

        // Explicit tables are checked for membership and capacity here
        self.sharding.build_strategy()?;

        let mut names = BTreeSet::new();
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for router in &self.routers {
            for entity_type in &router.entity_types {
                if let Some(previous) = owners.insert(entity_type, &router.name) {
                    if previous != router.name {
                        return Err(ConfigError::Invalid(format!(
                            "entity type '{}' is owned by both '{}' and '{}'",
                            entity_type, previous, router.name
                        )));
                    }
                }
            }
            if !names.insert(router.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "router '{}' is defined twice",
                    router.name
                )));
            }
            if router.entity_types.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "router '{}' owns no entity types",
                    router.name
                )));
            }
            let targets = [router.role.is_some(), router.database.is_some(), router.sharded]
                .iter()
                .filter(|t| **t)
                .count();
            if targets != 1 {
                return Err(ConfigError::Invalid(format!(
                    "router '{}' must set exactly one of `role`, `database` or `sharded`",
                    router.name
                )));
            }
            if let Some(role) = &router.role {
                self.alias_for_role(role)?;
            }
            if let Some(alias) = &router.database {
                self.require_database(alias, &format!("router '{}'", router.name))?;
            }
        }

        self.sequence_database()?;
        Ok(())
    }

    /// Returns the database alias a role points at.
    pub fn alias_for_role(&self, role: &str) -> Result<&str, ConfigError> {
        self.roles
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingRole(role.to_string()))
    }

    /// Returns the database alias holding the sequential key counter.
    pub fn sequence_database(&self) -> Result<&str, ConfigError> {
        match (&self.sequence.database, &self.sequence.role) {
            (Some(alias), _) => {
                self.require_database(alias, "sequence")?;
                Ok(alias.as_str())
            }
            (None, Some(role)) => self.alias_for_role(role),
            (None, None) => self.alias_for_role(METADATA_ROLE),
        }
    }

    /// Serializes the configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    fn require_database(&self, alias: &str, referenced_by: &str) -> Result<(), ConfigError> {
        if self.databases.contains_key(alias) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "database '{}' referenced by {} is not configured",
                alias, referenced_by
            )))
        }
    }
}

/// Connection descriptor for one physical database.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Driver engine (`memory`, `mysql`, ...)
    pub engine: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Database name before the environment suffix
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: "memory".to_string(),
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            name: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// An in-memory database descriptor.
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the database name with the environment suffix applied.
    pub fn physical_name(&self, environment: Option<&str>) -> String {
        match environment {
            Some(env) if !env.is_empty() => format!("{}_{}", self.name, env),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("name", &self.name)
            .finish()
    }
}

/// Shard set and strategy for sharded entity types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Ordered shard set; order decides modulo placement and the default shard
    pub shards: Vec<String>,
    /// Active strategy
    pub strategy: StrategyConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shards: vec![
                "articles_a_db".to_string(),
                "articles_b_db".to_string(),
                "articles_c_db".to_string(),
            ],
            strategy: StrategyConfig::Modulo,
        }
    }
}

impl ShardingConfig {
    /// Returns the ordered shard set.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| ShardId::new(s.as_str())).collect()
    }

    /// Builds the sharding strategy from the config.
    pub fn build_strategy(&self) -> Result<Arc<dyn ShardingStrategy>, ShardError> {
        let shards = self.shard_ids();
        match &self.strategy {
            StrategyConfig::Modulo => Ok(Arc::new(ModuloStrategy::new(shards)?)),
            StrategyConfig::Explicit {
                max_keys_per_shard,
                mapping,
            } => {
                let assignments = mapping
                    .iter()
                    .map(|m| (m.key.clone(), ShardId::new(m.shard.as_str())))
                    .collect();
                Ok(Arc::new(ExplicitMappingStrategy::new(
                    shards,
                    assignments,
                    *max_keys_per_shard,
                )?))
            }
        }
    }
}

/// Supported sharding strategy types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// `key mod shard_count`
    Modulo,
    /// Explicit key -> shard table
    Explicit {
        #[serde(default = "default_max_keys_per_shard")]
        max_keys_per_shard: usize,
        #[serde(default)]
        mapping: Vec<MappingEntry>,
    },
}

fn default_max_keys_per_shard() -> usize {
    1
}

/// One pre-assigned key in an explicit mapping table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingEntry {
    pub key: ShardingKey,
    pub shard: String,
}

/// One router in the chain.
///
/// Exactly one of `role`, `database` and `sharded` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    pub name: String,
    pub entity_types: Vec<String>,
    /// Fixed database, by role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Fixed database, by alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Spread over the shard set with the configured strategy
    #[serde(default)]
    pub sharded: bool,
}

impl RouterConfig {
    /// A router pinned to the database of a role.
    pub fn fixed_role(name: &str, entity_types: &[&str], role: &str) -> Self {
        Self {
            name: name.to_string(),
            entity_types: entity_types.iter().map(|t| t.to_string()).collect(),
            role: Some(role.to_string()),
            database: None,
            sharded: false,
        }
    }

    /// A router over the shard set.
    pub fn sharded(name: &str, entity_types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            entity_types: entity_types.iter().map(|t| t.to_string()).collect(),
            role: None,
            database: None,
            sharded: true,
        }
    }
}

/// Location of the sequential key counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Database alias; takes precedence over `role`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Database role (defaults to the metadata role)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Counter name prefix; one counter per entity type is kept under it
    pub counter: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            database: None,
            role: Some(METADATA_ROLE.to_string()),
            counter: "last_id".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Use JSON format for log output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
