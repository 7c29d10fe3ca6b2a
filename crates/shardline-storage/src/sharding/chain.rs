//! Priority-ordered router chain.
//!
//! Every read, write and schema check passes through the chain. Routers are
//! consulted in order and the first one that does not abstain decides.

use super::router::DatabaseRouter;
use super::strategy::ShardingStrategy;
use shardline_core::{
    EntityType, Hints, Result, RoutingDecision, ShardError, ShardId, ShardingKey,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Chain-of-responsibility dispatcher over [`DatabaseRouter`]s.
///
/// Construction rejects overlapping ownership, so for any entity type exactly
/// one router (or none) gives a non-abstaining answer.
#[derive(Debug, Clone)]
pub struct RouterChain {
    routers: Vec<Arc<dyn DatabaseRouter>>,
    default_database: Option<ShardId>,
}

impl RouterChain {
    /// Creates a chain from routers in priority order.
    pub fn new(routers: Vec<Arc<dyn DatabaseRouter>>) -> Result<Self> {
        let mut owners: BTreeMap<EntityType, String> = BTreeMap::new();
        for router in &routers {
            for entity_type in router.owned_types() {
                if let Some(previous) = owners.insert(entity_type.clone(), router.name().to_string())
                {
                    return Err(ShardError::Configuration(format!(
                        "entity type {} is owned by both '{}' and '{}'",
                        entity_type,
                        previous,
                        router.name()
                    )));
                }
            }
        }

        Ok(Self {
            routers,
            default_database: None,
        })
    }

    /// Sets the database used when no router claims an entity type.
    pub fn with_default_database(mut self, shard: impl Into<ShardId>) -> Self {
        self.default_database = Some(shard.into());
        self
    }

    /// Returns the routers in priority order.
    pub fn routers(&self) -> &[Arc<dyn DatabaseRouter>] {
        &self.routers
    }

    /// Returns the fallback database, if configured.
    pub fn default_database(&self) -> Option<&ShardId> {
        self.default_database.as_ref()
    }

    /// Returns the router that owns an entity type.
    pub fn owner(&self, entity_type: &EntityType) -> Option<&Arc<dyn DatabaseRouter>> {
        self.routers.iter().find(|r| r.owns(entity_type))
    }

    /// Resolves the database for a read; `None` if no router claims the type.
    pub fn resolve_for_read(
        &self,
        entity_type: &EntityType,
        hints: &Hints,
    ) -> Result<Option<ShardId>> {
        self.resolve(entity_type, |router| router.route_for_read(entity_type, hints))
    }

    /// Resolves the database for a write; `None` if no router claims the type.
    pub fn resolve_for_write(
        &self,
        entity_type: &EntityType,
        hints: &Hints,
    ) -> Result<Option<ShardId>> {
        self.resolve(entity_type, |router| router.route_for_write(entity_type, hints))
    }

    /// Like [`RouterChain::resolve_for_read`], falling back to the default database.
    pub fn database_for_read(&self, entity_type: &EntityType, hints: &Hints) -> Result<ShardId> {
        let resolved = self.resolve_for_read(entity_type, hints)?;
        self.or_default(entity_type, resolved)
    }

    /// Like [`RouterChain::resolve_for_write`], falling back to the default database.
    pub fn database_for_write(&self, entity_type: &EntityType, hints: &Hints) -> Result<ShardId> {
        let resolved = self.resolve_for_write(entity_type, hints)?;
        self.or_default(entity_type, resolved)
    }

    /// First non-abstaining schema answer; `None` if every router abstains.
    pub fn allow_schema_operation(
        &self,
        shard: &ShardId,
        entity_type: &EntityType,
    ) -> Option<bool> {
        self.routers
            .iter()
            .find_map(|router| router.allow_schema_operation(shard, entity_type).as_option())
    }

    /// Returns true if any router allows the two types to reference each other.
    pub fn relation_allowed(&self, type_a: &EntityType, type_b: &EntityType) -> bool {
        self.routers
            .iter()
            .any(|router| router.relation_allowed(type_a, type_b))
    }

    /// Returns the databases an entity type may live on.
    ///
    /// Callers that need every record of a sharded type iterate this list and
    /// merge the per-shard results themselves.
    pub fn shards_for(&self, entity_type: &EntityType) -> Option<&[ShardId]> {
        self.owner(entity_type).map(|router| router.shards())
    }

    /// Returns the strategy of the router owning a sharded entity type.
    pub fn strategy_for(&self, entity_type: &EntityType) -> Option<&Arc<dyn ShardingStrategy>> {
        self.owner(entity_type).and_then(|router| router.strategy())
    }

    /// Assigns a new sharding key of `entity_type` to a shard.
    pub fn register_key(
        &self,
        entity_type: &EntityType,
        key: ShardingKey,
        shard: ShardId,
    ) -> Result<()> {
        self.registration_strategy(entity_type)?
            .register_key(key, shard)
    }

    /// Like [`Self::strategy_for`], but an unowned or unsharded type is an error.
    pub fn registration_strategy(
        &self,
        entity_type: &EntityType,
    ) -> Result<&Arc<dyn ShardingStrategy>> {
        let router = self
            .owner(entity_type)
            .ok_or_else(|| ShardError::NoRoute(entity_type.clone()))?;
        router.strategy().ok_or_else(|| {
            ShardError::Configuration(format!(
                "router '{}' does not shard {}",
                router.name(),
                entity_type
            ))
        })
    }

    /// For each database, the entity types whose schema may be created there.
    ///
    /// Only types some router claims are listed.
    pub fn schema_plan(&self, databases: &[ShardId]) -> BTreeMap<ShardId, Vec<EntityType>> {
        let mut plan: BTreeMap<ShardId, Vec<EntityType>> =
            databases.iter().map(|db| (db.clone(), Vec::new())).collect();
        for router in &self.routers {
            for entity_type in router.owned_types() {
                for db in databases {
                    if self.allow_schema_operation(db, &entity_type) == Some(true) {
                        if let Some(types) = plan.get_mut(db) {
                            types.push(entity_type.clone());
                        }
                    }
                }
            }
        }
        plan
    }

    fn resolve<F>(&self, entity_type: &EntityType, mut route: F) -> Result<Option<ShardId>>
    where
        F: FnMut(&dyn DatabaseRouter) -> Result<RoutingDecision>,
    {
        for router in &self.routers {
            match route(router.as_ref())? {
                RoutingDecision::Owned(shard) => return Ok(Some(shard)),
                RoutingDecision::Denied => {
                    return Err(ShardError::Denied {
                        router: router.name().to_string(),
                        entity_type: entity_type.clone(),
                    })
                }
                RoutingDecision::NotApplicable => continue,
            }
        }
        Ok(None)
    }

    fn or_default(&self, entity_type: &EntityType, resolved: Option<ShardId>) -> Result<ShardId> {
        match resolved {
            Some(shard) => Ok(shard),
            None => self
                .default_database
                .clone()
                .ok_or_else(|| ShardError::NoRoute(entity_type.clone())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
