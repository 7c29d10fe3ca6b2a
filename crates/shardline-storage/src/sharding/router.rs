//! Per-entity-type database routing.
//!
//! A router owns a set of entity types and answers, for each of them, which
//! physical database serves reads, writes and schema. Types it does not own
//! get an abstaining answer so the next router in the chain can decide.

use super::strategy::ShardingStrategy;
use shardline_core::{
    EntityType, Hints, Result, RoutingDecision, SchemaDecision, ShardError, ShardId,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Routing policy consulted for every data access.
///
/// Implementations answer [`RoutingDecision::NotApplicable`] and
/// [`SchemaDecision::Abstain`] for entity types they do not own.
pub trait DatabaseRouter: Send + Sync + fmt::Debug {
    /// Router name used in logs and errors.
    fn name(&self) -> &str;

    /// Returns true if this router owns the entity type.
    fn owns(&self, entity_type: &EntityType) -> bool;

    /// Selects the database for a read.
    fn route_for_read(&self, entity_type: &EntityType, hints: &Hints) -> Result<RoutingDecision>;

    /// Selects the database for a write.
    fn route_for_write(&self, entity_type: &EntityType, hints: &Hints)
        -> Result<RoutingDecision>;

    /// Decides whether schema for `entity_type` may be created on `shard`.
    fn allow_schema_operation(&self, shard: &ShardId, entity_type: &EntityType) -> SchemaDecision;

    /// Returns true if records of the two types may reference each other.
    fn relation_allowed(&self, type_a: &EntityType, type_b: &EntityType) -> bool {
        self.owns(type_a) || self.owns(type_b)
    }

    /// Returns the databases this router may select.
    fn shards(&self) -> &[ShardId];

    /// Returns the owned entity types.
    fn owned_types(&self) -> Vec<EntityType>;

    /// Returns the sharding strategy, if this router is shard-aware.
    fn strategy(&self) -> Option<&Arc<dyn ShardingStrategy>> {
        None
    }
}

/// Where an [`EntityRouter`] places its entity types.
#[derive(Clone)]
pub enum Placement {
    /// A single fixed database (auth, content metadata).
    Fixed(ShardId),
    /// An ordered shard set with a strategy; the first shard is the default.
    Sharded(Arc<dyn ShardingStrategy>),
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Fixed(shard) => f.debug_tuple("Fixed").field(shard).finish(),
            Placement::Sharded(strategy) => {
                f.debug_tuple("Sharded").field(&strategy.describe()).finish()
            }
        }
    }
}

/// The standard router: a set of owned entity types plus a placement.
///
/// Reads and writes use identical logic, so a key always resolves to the
/// same database in both directions.
///
/// # Example
///
/// ```
/// use shardline_storage::sharding::{EntityRouter, DatabaseRouter, ModuloStrategy};
/// use shardline_core::{EntityType, Hints, RoutingDecision, ShardId};
/// use std::sync::Arc;
///
/// let strategy = ModuloStrategy::new(vec!["A".into(), "B".into(), "C".into()]).unwrap();
/// let router = EntityRouter::sharded("articles", ["articles"], Arc::new(strategy));
///
/// let decision = router.route_for_write(&EntityType::new("articles"), &Hints::with_key(22i64)).unwrap();
/// assert_eq!(decision, RoutingDecision::Owned(ShardId::new("B")));
/// ```
#[derive(Debug, Clone)]
pub struct EntityRouter {
    name: String,
    entity_types: BTreeSet<EntityType>,
    placement: Placement,
}

impl EntityRouter {
    /// Creates a router with an explicit placement.
    pub fn new<I, T>(name: impl Into<String>, entity_types: I, placement: Placement) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        Self {
            name: name.into(),
            entity_types: entity_types.into_iter().map(Into::into).collect(),
            placement,
        }
    }

    /// Creates a router that sends every owned type to one database.
    pub fn fixed<I, T>(name: impl Into<String>, entity_types: I, shard: impl Into<ShardId>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        Self::new(name, entity_types, Placement::Fixed(shard.into()))
    }

    /// Creates a router that spreads owned types over a strategy's shard set.
    pub fn sharded<I, T>(
        name: impl Into<String>,
        entity_types: I,
        strategy: Arc<dyn ShardingStrategy>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        Self::new(name, entity_types, Placement::Sharded(strategy))
    }

    /// Returns the placement.
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    fn route(&self, entity_type: &EntityType, hints: &Hints) -> Result<RoutingDecision> {
        if !self.owns(entity_type) {
            return Ok(RoutingDecision::NotApplicable);
        }
        let shard = self.select(hints)?;
        tracing::debug!(
            router = %self.name,
            entity_type = %entity_type,
            shard = %shard,
            "Routed operation"
        );
        Ok(RoutingDecision::Owned(shard))
    }

    fn select(&self, hints: &Hints) -> Result<ShardId> {
        match &self.placement {
            Placement::Fixed(shard) => Ok(shard.clone()),
            Placement::Sharded(strategy) => match hints.sharding_key() {
                Some(key) => strategy.get_shard(key),
                // Key-less operations (bulk/admin) land on the first shard.
                None => strategy.shards().first().cloned().ok_or_else(|| {
                    ShardError::Configuration(format!("router '{}' has no shards", self.name))
                }),
            },
        }
    }
}

impl DatabaseRouter for EntityRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn owns(&self, entity_type: &EntityType) -> bool {
        self.entity_types.contains(entity_type)
    }

    fn route_for_read(&self, entity_type: &EntityType, hints: &Hints) -> Result<RoutingDecision> {
        self.route(entity_type, hints)
    }

    fn route_for_write(
        &self,
        entity_type: &EntityType,
        hints: &Hints,
    ) -> Result<RoutingDecision> {
        self.route(entity_type, hints)
    }

    fn allow_schema_operation(&self, shard: &ShardId, entity_type: &EntityType) -> SchemaDecision {
        if !self.owns(entity_type) {
            return SchemaDecision::Abstain;
        }
        SchemaDecision::from(self.shards().contains(shard))
    }

    fn shards(&self) -> &[ShardId] {
        match &self.placement {
            Placement::Fixed(shard) => std::slice::from_ref(shard),
            Placement::Sharded(strategy) => strategy.shards(),
        }
    }

    fn owned_types(&self) -> Vec<EntityType> {
        self.entity_types.iter().cloned().collect()
    }

    fn strategy(&self) -> Option<&Arc<dyn ShardingStrategy>> {
        match &self.placement {
            Placement::Sharded(strategy) => Some(strategy),
            Placement::Fixed(_) => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{ExplicitMappingStrategy, ModuloStrategy};
    use shardline_core::ShardingKey;

    fn articles_router() -> EntityRouter {
        let strategy = ModuloStrategy::new(vec![
            "articles_a_db".into(),
            "articles_b_db".into(),
            "articles_c_db".into(),
        ])
        .unwrap();
        EntityRouter::sharded("articles", ["articles"], Arc::new(strategy))
    }

    fn articles() -> EntityType {
        EntityType::new("articles")
    }

    #[test]
    fn test_fixed_router_ignores_hints() {
        let router = EntityRouter::fixed("auth", ["users", "sessions"], "default");
        let users = EntityType::new("users");

        for hints in [Hints::none(), Hints::with_key(5i64), Hints::with_key("x")] {
            assert_eq!(
                router.route_for_read(&users, &hints).unwrap(),
                RoutingDecision::Owned(ShardId::new("default"))
            );
        }
        assert_eq!(router.shards(), &[ShardId::new("default")]);
    }

    #[test]
    fn test_unowned_type_is_not_applicable() {
        let router = articles_router();
        let users = EntityType::new("users");

        assert_eq!(
            router.route_for_read(&users, &Hints::with_key(1i64)).unwrap(),
            RoutingDecision::NotApplicable
        );
        assert_eq!(
            router.route_for_write(&users, &Hints::none()).unwrap(),
            RoutingDecision::NotApplicable
        );
        assert_eq!(
            router.allow_schema_operation(&"articles_a_db".into(), &users),
            SchemaDecision::Abstain
        );
    }

    #[test]
    fn test_unowned_type_skips_key_validation() {
        let router = articles_router();
        // A key the strategy would reject is never inspected for foreign types.
        let decision = router
            .route_for_write(&EntityType::new("users"), &Hints::with_key(-5i64))
            .unwrap();
        assert_eq!(decision, RoutingDecision::NotApplicable);
    }

    #[test]
    fn test_read_and_write_agree() {
        let router = articles_router();
        for k in 0..50i64 {
            let hints = Hints::with_key(k);
            assert_eq!(
                router.route_for_read(&articles(), &hints).unwrap(),
                router.route_for_write(&articles(), &hints).unwrap()
            );
        }
    }

    #[test]
    fn test_sharded_router_default_is_first_shard() {
        let router = articles_router();
        assert_eq!(
            router.route_for_write(&articles(), &Hints::none()).unwrap(),
            RoutingDecision::Owned(ShardId::new("articles_a_db"))
        );
        assert_eq!(
            router.route_for_read(&articles(), &Hints::none()).unwrap(),
            RoutingDecision::Owned(ShardId::new("articles_a_db"))
        );
    }

    #[test]
    fn test_sharded_router_propagates_strategy_errors() {
        let router = articles_router();
        let err = router
            .route_for_write(&articles(), &Hints::with_key("tech"))
            .unwrap_err();
        assert!(matches!(err, ShardError::InvalidKey { .. }));

        let strategy = ExplicitMappingStrategy::new(
            vec!["A".into(), "B".into()],
            vec![(ShardingKey::Int(1), "A".into())],
            1,
        )
        .unwrap();
        let router = EntityRouter::sharded("topics", ["articles"], Arc::new(strategy));
        let err = router
            .route_for_read(&articles(), &Hints::with_key(9i64))
            .unwrap_err();
        assert!(matches!(err, ShardError::UnresolvedKey(_)));
    }

    #[test]
    fn test_allow_schema_operation() {
        let router = articles_router();

        for db in ["articles_a_db", "articles_b_db", "articles_c_db"] {
            assert_eq!(
                router.allow_schema_operation(&db.into(), &articles()),
                SchemaDecision::Allow
            );
        }
        for db in ["default", "news_feed_db", "some_db"] {
            assert_eq!(
                router.allow_schema_operation(&db.into(), &articles()),
                SchemaDecision::Deny
            );
        }
    }

    #[test]
    fn test_relation_allowed() {
        let router = articles_router();
        let users = EntityType::new("users");
        let other = EntityType::new("other");

        assert!(router.relation_allowed(&articles(), &users));
        assert!(router.relation_allowed(&users, &articles()));
        assert!(!router.relation_allowed(&users, &other));
    }
}
