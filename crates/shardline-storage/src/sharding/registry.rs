//! Shard registry: the authoritative list of databases and shards.

use crate::config::{ConfigError, DatabaseConfig, ShardlineConfig};
use super::chain::RouterChain;
use super::router::{DatabaseRouter, EntityRouter, Placement};
use super::strategy::ShardingStrategy;
use shardline_core::{ShardError, ShardId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Static view of every configured database, built once at startup.
///
/// Construction validates the whole configuration, so a registry that exists
/// has every required role, a non-empty shard set and a working strategy.
pub struct ShardRegistry {
    environment: Option<String>,
    databases: BTreeMap<ShardId, DatabaseConfig>,
    roles: BTreeMap<String, ShardId>,
    shards: Vec<ShardId>,
    strategy: Arc<dyn ShardingStrategy>,
}

impl fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("environment", &self.environment)
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .field("roles", &self.roles)
            .field("shards", &self.shards)
            .field("strategy", &self.strategy.describe())
            .finish()
    }
}

impl ShardRegistry {
    /// Builds the registry from configuration, failing fast on any gap.
    pub fn from_config(config: &ShardlineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let databases = config
            .databases
            .iter()
            .map(|(alias, db)| (ShardId::new(alias.as_str()), db.clone()))
            .collect();
        let roles = config
            .roles
            .iter()
            .map(|(role, alias)| (role.clone(), ShardId::new(alias.as_str())))
            .collect();
        let strategy = config.sharding.build_strategy()?;

        tracing::debug!(strategy = %strategy.describe(), "Built sharding strategy");

        Ok(Self {
            environment: config.environment.clone(),
            databases,
            roles,
            shards: config.sharding.shard_ids(),
            strategy,
        })
    }

    /// Returns the ordered shard set.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Returns the active sharding strategy.
    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        &self.strategy
    }

    /// Returns the database alias serving a role.
    pub fn role_database(&self, role: &str) -> Result<&ShardId, ShardError> {
        self.roles.get(role).ok_or_else(|| {
            ShardError::Configuration(format!("database role '{}' is not configured", role))
        })
    }

    /// Returns the connection parameters for a role.
    pub fn database_for_role(&self, role: &str) -> Result<&DatabaseConfig, ShardError> {
        let alias = self.role_database(role)?;
        self.database(alias)
    }

    /// Returns the connection parameters for a database alias.
    pub fn database(&self, alias: &ShardId) -> Result<&DatabaseConfig, ShardError> {
        self.databases
            .get(alias)
            .ok_or_else(|| ShardError::UnknownShard(alias.clone()))
    }

    /// Returns every configured database alias in sorted order.
    pub fn aliases(&self) -> Vec<ShardId> {
        self.databases.keys().cloned().collect()
    }

    /// Iterates over every configured database.
    pub fn databases(&self) -> impl Iterator<Item = (&ShardId, &DatabaseConfig)> {
        self.databases.iter()
    }

    /// Returns the physical database name for an alias (environment suffix applied).
    pub fn physical_name(&self, alias: &ShardId) -> Result<String, ShardError> {
        Ok(self.database(alias)?.physical_name(self.environment.as_deref()))
    }

    /// Returns the deployment environment, if any.
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Builds the router chain in configured order.
    ///
    /// Every sharded router shares this registry's strategy instance, so a
    /// key registered through one is visible to all.
    pub fn build_chain(&self, config: &ShardlineConfig) -> Result<RouterChain, ShardError> {
        let mut routers: Vec<Arc<dyn DatabaseRouter>> = Vec::with_capacity(config.routers.len());
        for router in &config.routers {
            let placement = if router.sharded {
                Placement::Sharded(Arc::clone(&self.strategy))
            } else if let Some(role) = &router.role {
                Placement::Fixed(self.role_database(role)?.clone())
            } else if let Some(alias) = &router.database {
                let shard = ShardId::new(alias.as_str());
                self.database(&shard)?;
                Placement::Fixed(shard)
            } else {
                return Err(ShardError::Configuration(format!(
                    "router '{}' has no target",
                    router.name
                )));
            };
            routers.push(Arc::new(EntityRouter::new(
                router.name.as_str(),
                router.entity_types.iter().map(String::as_str),
                placement,
            )));
        }

        let chain = RouterChain::new(routers)?;
        Ok(match self.roles.get(crate::config::AUTH_ROLE) {
            Some(default) => chain.with_default_database(default.clone()),
            None => chain,
        })
    }
}
