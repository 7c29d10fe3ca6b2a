//! Process startup: configuration to a ready-to-use routing stack.
//!
//! [`Shardline::open`] validates the configuration, builds the registry and
//! router chain, opens one connection per database, creates the schema each
//! database is allowed to hold, and checks the shard placement. Any failure
//! stops startup.

use crate::config::{ConfigError, ShardlineConfig, METADATA_ROLE};
use crate::connection::{ConnectionFactory, ConnectionPool, MemoryConnectionFactory};
use crate::placement::{PlacementCheck, PlacementStore};
use crate::repository::{Entity, PersistenceError, ShardedRepository};
use crate::sequence::{CounterSequence, KeySequence};
use crate::sharding::{RouterChain, ShardRegistry};
use shardline_core::{EntityType, ShardError, ShardId, ShardingKey};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A started routing stack.
#[derive(Debug)]
pub struct Shardline {
    config: ShardlineConfig,
    registry: Arc<ShardRegistry>,
    chain: Arc<RouterChain>,
    pool: Arc<ConnectionPool>,
    placement: PlacementStore,
}

impl Shardline {
    /// Starts with the bundled `memory` engine.
    pub fn open(config: ShardlineConfig) -> Result<Self, ConfigError> {
        let factories: Vec<Arc<dyn ConnectionFactory>> = vec![Arc::new(MemoryConnectionFactory)];
        Self::open_with_factories(config, &factories)
    }

    /// Starts with the given connection factories.
    pub fn open_with_factories(
        config: ShardlineConfig,
        factories: &[Arc<dyn ConnectionFactory>],
    ) -> Result<Self, ConfigError> {
        let registry = ShardRegistry::from_config(&config)?;
        let pool = ConnectionPool::open(&registry, factories)?;
        Self::start(config, registry, Arc::new(pool))
    }

    /// Starts over already-open connections.
    ///
    /// The pool must hold a connection for every configured database.
    pub fn open_with_pool(
        config: ShardlineConfig,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self, ConfigError> {
        let registry = ShardRegistry::from_config(&config)?;
        Self::start(config, registry, pool)
    }

    /// Records the configured placement as accepted.
    ///
    /// This is the explicit step after an out-of-band data migration; a
    /// subsequent open with the same configuration succeeds.
    pub fn accept_placement(
        config: &ShardlineConfig,
        pool: &ConnectionPool,
    ) -> Result<String, ConfigError> {
        let registry = ShardRegistry::from_config(config)?;
        let store = Self::placement_store(&registry, pool)?;
        Ok(store.accept(registry.strategy().as_ref())?)
    }

    fn start(
        config: ShardlineConfig,
        registry: ShardRegistry,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self, ConfigError> {
        for alias in registry.aliases() {
            pool.get(&alias)?;
        }

        let chain = registry.build_chain(&config)?;
        let placement = Self::placement_store(&registry, &pool)?;
        // Fingerprint the configured table before registrations are replayed.
        let check = placement.check(registry.strategy().as_ref())?;
        placement.restore_keys(registry.strategy().as_ref())?;

        let shardline = Self {
            config,
            registry: Arc::new(registry),
            chain: Arc::new(chain),
            pool,
            placement,
        };
        let plan = shardline.migrate()?;

        let placement = match &check {
            PlacementCheck::Recorded(_) => "recorded",
            PlacementCheck::Unchanged(_) => "unchanged",
        };
        tracing::info!(
            databases = plan.len(),
            shards = shardline.registry.shards().len(),
            strategy = %shardline.registry.strategy().describe(),
            placement,
            "Shardline started"
        );
        Ok(shardline)
    }

    fn placement_store(
        registry: &ShardRegistry,
        pool: &ConnectionPool,
    ) -> Result<PlacementStore, ShardError> {
        let metadata = registry.role_database(METADATA_ROLE)?;
        PlacementStore::new(Arc::clone(pool.get(metadata)?))
    }

    /// Creates every collection the router chain allows on each database.
    ///
    /// Returns the plan that was applied.
    pub fn migrate(&self) -> Result<BTreeMap<ShardId, Vec<EntityType>>, ShardError> {
        let plan = self.chain.schema_plan(&self.registry.aliases());
        for (db, types) in &plan {
            let connection = self.pool.get(db)?;
            for entity_type in types {
                connection.create_collection(entity_type)?;
            }
            tracing::debug!(database = %db, collections = types.len(), "Migrated database");
        }
        Ok(plan)
    }

    /// Returns a repository for an entity type.
    ///
    /// Sequential keys come from the configured counter, one per entity type.
    pub fn repository<E: Entity>(&self) -> Result<ShardedRepository<E>, PersistenceError> {
        let alias = ShardId::new(self.config.sequence_database().map_err(|e| {
            ShardError::Configuration(e.to_string())
        })?);
        let counter = format!("{}.{}", self.config.sequence.counter, E::entity_type());
        let sequence: Arc<dyn KeySequence> =
            Arc::new(CounterSequence::new(Arc::clone(self.pool.get(&alias)?), counter));

        ShardedRepository::new(Arc::clone(&self.chain), Arc::clone(&self.pool), Some(sequence))
    }

    /// Assigns a new sharding key to a shard and persists the assignment.
    ///
    /// The assignment is stored before it becomes routable. If storing fails
    /// the key stays unresolved; if the in-memory registration then loses a
    /// race, the stored entry is removed again.
    pub fn register_key(
        &self,
        entity_type: &EntityType,
        key: ShardingKey,
        shard: ShardId,
    ) -> Result<(), ShardError> {
        let strategy = self.chain.registration_strategy(entity_type)?;
        strategy.check_registration(&key, &shard)?;
        self.placement.record_key(&key, &shard)?;

        if let Err(err) = strategy.register_key(key.clone(), shard) {
            if let Err(cleanup) = self.placement.forget_key(&key) {
                tracing::warn!(key = %key, error = %cleanup, "Failed to remove stored key registration");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Returns the loaded configuration.
    pub fn config(&self) -> &ShardlineConfig {
        &self.config
    }

    /// Returns the shard registry.
    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Returns the router chain.
    pub fn chain(&self) -> &Arc<RouterChain> {
        &self.chain
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Returns the placement store.
    pub fn placement(&self) -> &PlacementStore {
        &self.placement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MappingEntry, StrategyConfig};
    use crate::connection::{Document, MemoryConnection, ShardConnection};
    use shardline_core::{DriverError, RecordId};

    /// Metadata database whose key-registration writes fail.
    #[derive(Debug)]
    struct ReadOnlyKeys(MemoryConnection);

    impl ReadOnlyKeys {
        fn check(&self, collection: &EntityType) -> Result<(), ShardError> {
            if collection.as_str() == "shardline_keys" {
                return Err(ShardError::Driver(DriverError::new("disk full")));
            }
            Ok(())
        }
    }

    impl ShardConnection for ReadOnlyKeys {
        fn alias(&self) -> &ShardId {
            self.0.alias()
        }
        fn create_collection(&self, collection: &EntityType) -> Result<(), ShardError> {
            self.0.create_collection(collection)
        }
        fn collections(&self) -> Vec<EntityType> {
            self.0.collections()
        }
        fn insert(&self, c: &EntityType, id: &RecordId, doc: Document) -> Result<(), ShardError> {
            self.check(c)?;
            self.0.insert(c, id, doc)
        }
        fn update(&self, c: &EntityType, id: &RecordId, doc: Document) -> Result<(), ShardError> {
            self.check(c)?;
            self.0.update(c, id, doc)
        }
        fn upsert(&self, c: &EntityType, id: &RecordId, doc: Document) -> Result<bool, ShardError> {
            self.check(c)?;
            self.0.upsert(c, id, doc)
        }
        fn get(&self, c: &EntityType, id: &RecordId) -> Result<Option<Document>, ShardError> {
            self.0.get(c, id)
        }
        fn delete(&self, c: &EntityType, id: &RecordId) -> Result<bool, ShardError> {
            self.0.delete(c, id)
        }
        fn scan(&self, c: &EntityType) -> Result<Vec<(RecordId, Document)>, ShardError> {
            self.0.scan(c)
        }
        fn count(&self, c: &EntityType) -> Result<usize, ShardError> {
            self.0.count(c)
        }
        fn increment(&self, counter: &str) -> Result<u64, ShardError> {
            self.0.increment(counter)
        }
    }

    fn explicit_config(max_keys_per_shard: usize) -> ShardlineConfig {
        let mut config = ShardlineConfig::default();
        config.sharding.strategy = StrategyConfig::Explicit {
            max_keys_per_shard,
            mapping: vec![MappingEntry {
                key: 1i64.into(),
                shard: "articles_a_db".to_string(),
            }],
        };
        config
    }

    fn pool_with_metadata(
        config: &ShardlineConfig,
        metadata: Arc<dyn ShardConnection>,
    ) -> Arc<ConnectionPool> {
        let mut connections: Vec<Arc<dyn ShardConnection>> = config
            .databases
            .iter()
            .filter(|(alias, _)| alias.as_str() != metadata.alias().as_str())
            .map(|(alias, db)| {
                Arc::new(MemoryConnection::new(alias.as_str(), db.name.as_str()))
                    as Arc<dyn ShardConnection>
            })
            .collect();
        connections.push(metadata);
        Arc::new(ConnectionPool::from_connections(connections))
    }

    #[test]
    fn test_open_default_config() {
        let shardline = Shardline::open(ShardlineConfig::default()).unwrap();
        let articles = EntityType::new("articles");

        for shard in shardline.registry().shards() {
            let collections = shardline.pool().get(shard).unwrap().collections();
            assert_eq!(collections, vec![articles.clone()]);
        }
        let auth = shardline.pool().get(&"default".into()).unwrap().collections();
        assert_eq!(
            auth,
            vec![EntityType::new("auth"), EntityType::new("sessions"), EntityType::new("users")]
        );
        assert_eq!(
            shardline.placement().stored_fingerprint().unwrap().as_deref(),
            Some("modulo:articles_a_db,articles_b_db,articles_c_db")
        );
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = ShardlineConfig::default();
        config.sharding.shards.clear();
        assert!(Shardline::open(config).is_err());
    }

    #[test]
    fn test_register_key_requires_explicit_strategy() {
        let shardline = Shardline::open(ShardlineConfig::default()).unwrap();
        let err = shardline
            .register_key(&EntityType::new("articles"), 7i64.into(), "articles_a_db".into())
            .unwrap_err();
        assert!(matches!(err, ShardError::Configuration(_)));
    }

    #[test]
    fn test_register_key_is_persisted() {
        let shardline = Shardline::open(explicit_config(1)).unwrap();
        shardline
            .register_key(&EntityType::new("articles"), 2i64.into(), "articles_b_db".into())
            .unwrap();

        assert_eq!(
            shardline.placement().registered_keys().unwrap(),
            vec![(ShardingKey::Int(2), ShardId::new("articles_b_db"))]
        );
        let err = shardline
            .register_key(&EntityType::new("articles"), 3i64.into(), "articles_b_db".into())
            .unwrap_err();
        assert!(matches!(err, ShardError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_failed_key_store_leaves_key_unrouted() {
        let config = explicit_config(2);
        let metadata: Arc<dyn ShardConnection> =
            Arc::new(ReadOnlyKeys(MemoryConnection::new("news_feed_db", "news_feed_db")));
        let pool = pool_with_metadata(&config, metadata);
        let articles = EntityType::new("articles");

        let shardline = Shardline::open_with_pool(config.clone(), Arc::clone(&pool)).unwrap();
        let err = shardline
            .register_key(&articles, 2i64.into(), "articles_b_db".into())
            .unwrap_err();
        assert!(matches!(err, ShardError::Driver(e) if e.message() == "disk full"));

        let strategy = shardline.chain().strategy_for(&articles).unwrap();
        assert!(matches!(
            strategy.get_shard(&ShardingKey::Int(2)),
            Err(ShardError::UnresolvedKey(_))
        ));
        drop(shardline);

        // A restart agrees with the running process
        let restarted = Shardline::open_with_pool(config, pool).unwrap();
        let strategy = restarted.chain().strategy_for(&articles).unwrap();
        assert!(strategy.get_shard(&ShardingKey::Int(2)).is_err());
    }

    #[test]
    fn test_rejected_key_is_not_stored() {
        let shardline = Shardline::open(explicit_config(1)).unwrap();
        let articles = EntityType::new("articles");

        // Configured key, then a full shard
        assert!(matches!(
            shardline.register_key(&articles, 1i64.into(), "articles_b_db".into()),
            Err(ShardError::KeyAlreadyRegistered(_))
        ));
        assert!(matches!(
            shardline.register_key(&articles, 5i64.into(), "articles_a_db".into()),
            Err(ShardError::CapacityExceeded { .. })
        ));
        assert!(shardline.placement().registered_keys().unwrap().is_empty());
    }
}
