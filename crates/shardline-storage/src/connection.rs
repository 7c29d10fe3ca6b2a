//! Per-shard database connections.
//!
//! [`ShardConnection`] is the seam between routing and the generic database
//! driver: once a shard has been selected, every operation is a single call
//! on that shard's connection. [`MemoryConnection`] is the bundled `memory`
//! engine used by tests and the CLI demo.

use crate::config::DatabaseConfig;
use crate::sharding::ShardRegistry;
use dashmap::DashMap;
use shardline_core::{DriverError, EntityType, RecordId, Result, ShardError, ShardId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A stored record body.
pub type Document = serde_json::Value;

/// Connection to one physical database.
///
/// Every method is one blocking call against that database. Collections must
/// be created with [`ShardConnection::create_collection`] before use.
pub trait ShardConnection: Send + Sync + fmt::Debug {
    /// Alias of the database this connection serves.
    fn alias(&self) -> &ShardId;

    /// Creates a collection; a no-op if it already exists.
    fn create_collection(&self, collection: &EntityType) -> Result<()>;

    /// Returns the names of existing collections, sorted.
    fn collections(&self) -> Vec<EntityType>;

    /// Inserts a new record. Fails if the id is taken.
    fn insert(&self, collection: &EntityType, id: &RecordId, doc: Document) -> Result<()>;

    /// Replaces an existing record. Fails if the id is unknown.
    fn update(&self, collection: &EntityType, id: &RecordId, doc: Document) -> Result<()>;

    /// Inserts or replaces a record. Returns true if it was inserted.
    fn upsert(&self, collection: &EntityType, id: &RecordId, doc: Document) -> Result<bool>;

    /// Fetches one record.
    fn get(&self, collection: &EntityType, id: &RecordId) -> Result<Option<Document>>;

    /// Deletes one record. Returns true if it existed.
    fn delete(&self, collection: &EntityType, id: &RecordId) -> Result<bool>;

    /// Returns every record of a collection ordered by id.
    fn scan(&self, collection: &EntityType) -> Result<Vec<(RecordId, Document)>>;

    /// Returns the number of records in a collection.
    fn count(&self, collection: &EntityType) -> Result<usize>;

    /// Atomically increments a named counter and returns the new value.
    ///
    /// The first call on a fresh counter returns 1.
    fn increment(&self, counter: &str) -> Result<u64>;
}

// =============================================================================
// Memory Engine
// =============================================================================

/// In-memory database backed by [`DashMap`].
///
/// Collections are locked per entry, so operations on different collections
/// proceed in parallel and a counter increment is a single locked update.
pub struct MemoryConnection {
    alias: ShardId,
    name: String,
    collections: DashMap<EntityType, BTreeMap<RecordId, Document>>,
    counters: DashMap<String, u64>,
}

impl MemoryConnection {
    /// Creates an empty database.
    pub fn new(alias: impl Into<ShardId>, name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            collections: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Returns the physical database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn missing(&self, collection: &EntityType) -> ShardError {
        ShardError::Driver(DriverError::new(format!(
            "{}: collection {} does not exist",
            self.name, collection
        )))
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("alias", &self.alias)
            .field("name", &self.name)
            .field("collections", &self.collections.len())
            .finish()
    }
}

impl ShardConnection for MemoryConnection {
    fn alias(&self) -> &ShardId {
        &self.alias
    }

    fn create_collection(&self, collection: &EntityType) -> Result<()> {
        self.collections.entry(collection.clone()).or_default();
        Ok(())
    }

    fn collections(&self) -> Vec<EntityType> {
        let mut names: Vec<EntityType> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn insert(&self, collection: &EntityType, id: &RecordId, doc: Document) -> Result<()> {
        let mut records = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| self.missing(collection))?;
        if records.contains_key(id) {
            return Err(ShardError::Driver(DriverError::new(format!(
                "{}: duplicate id {} in {}",
                self.name, id, collection
            ))));
        }
        records.insert(id.clone(), doc);
        Ok(())
    }

    fn update(&self, collection: &EntityType, id: &RecordId, doc: Document) -> Result<()> {
        let mut records = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| self.missing(collection))?;
        match records.get_mut(id) {
            Some(existing) => {
                *existing = doc;
                Ok(())
            }
            None => Err(ShardError::Driver(DriverError::new(format!(
                "{}: no record {} in {}",
                self.name, id, collection
            )))),
        }
    }

    fn upsert(&self, collection: &EntityType, id: &RecordId, doc: Document) -> Result<bool> {
        let mut records = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| self.missing(collection))?;
        Ok(records.insert(id.clone(), doc).is_none())
    }

    fn get(&self, collection: &EntityType, id: &RecordId) -> Result<Option<Document>> {
        let records = self
            .collections
            .get(collection)
            .ok_or_else(|| self.missing(collection))?;
        Ok(records.get(id).cloned())
    }

    fn delete(&self, collection: &EntityType, id: &RecordId) -> Result<bool> {
        let mut records = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| self.missing(collection))?;
        Ok(records.remove(id).is_some())
    }

    fn scan(&self, collection: &EntityType) -> Result<Vec<(RecordId, Document)>> {
        let records = self
            .collections
            .get(collection)
            .ok_or_else(|| self.missing(collection))?;
        Ok(records
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }

    fn count(&self, collection: &EntityType) -> Result<usize> {
        let records = self
            .collections
            .get(collection)
            .ok_or_else(|| self.missing(collection))?;
        Ok(records.len())
    }

    fn increment(&self, counter: &str) -> Result<u64> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut value = self.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

// =============================================================================
// Factories and Pool
// =============================================================================

/// Opens connections for one engine.
pub trait ConnectionFactory: Send + Sync {
    /// Engine name matched against `DatabaseConfig::engine`.
    fn engine(&self) -> &str;

    /// Opens a connection to one configured database.
    fn open(
        &self,
        alias: &ShardId,
        config: &DatabaseConfig,
        physical_name: &str,
    ) -> Result<Arc<dyn ShardConnection>>;
}

/// Factory for the `memory` engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryConnectionFactory;

impl ConnectionFactory for MemoryConnectionFactory {
    fn engine(&self) -> &str {
        "memory"
    }

    fn open(
        &self,
        alias: &ShardId,
        _config: &DatabaseConfig,
        physical_name: &str,
    ) -> Result<Arc<dyn ShardConnection>> {
        Ok(Arc::new(MemoryConnection::new(alias.clone(), physical_name)))
    }
}

/// One open connection per configured database.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    connections: HashMap<ShardId, Arc<dyn ShardConnection>>,
}

impl ConnectionPool {
    /// Opens every database in the registry.
    ///
    /// Fails if a database names an engine no factory provides.
    pub fn open(registry: &ShardRegistry, factories: &[Arc<dyn ConnectionFactory>]) -> Result<Self> {
        let mut connections = HashMap::new();
        for (alias, config) in registry.databases() {
            let factory = factories
                .iter()
                .find(|f| f.engine() == config.engine)
                .ok_or_else(|| {
                    ShardError::Configuration(format!(
                        "database '{}' uses unsupported engine '{}'",
                        alias, config.engine
                    ))
                })?;
            let physical_name = config.physical_name(registry.environment());
            let connection = factory.open(alias, config, &physical_name)?;
            tracing::debug!(
                alias = %alias,
                engine = %config.engine,
                database = %physical_name,
                "Opened connection"
            );
            connections.insert(alias.clone(), connection);
        }
        Ok(Self { connections })
    }

    /// Builds a pool from already-open connections.
    pub fn from_connections(connections: Vec<Arc<dyn ShardConnection>>) -> Self {
        Self {
            connections: connections
                .into_iter()
                .map(|c| (c.alias().clone(), c))
                .collect(),
        }
    }

    /// Returns the connection for a database alias.
    pub fn get(&self, alias: &ShardId) -> Result<&Arc<dyn ShardConnection>> {
        self.connections
            .get(alias)
            .ok_or_else(|| ShardError::UnknownShard(alias.clone()))
    }

    /// Returns the number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connection is open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardlineConfig;
    use serde_json::json;

    fn articles() -> EntityType {
        EntityType::new("articles")
    }

    fn db() -> MemoryConnection {
        let conn = MemoryConnection::new("articles_a_db", "articles_a_db");
        conn.create_collection(&articles()).unwrap();
        conn
    }

    #[test]
    fn test_crud() {
        let conn = db();
        let id = RecordId::from(3u64);

        conn.insert(&articles(), &id, json!({"title": "first"})).unwrap();
        assert_eq!(
            conn.get(&articles(), &id).unwrap(),
            Some(json!({"title": "first"}))
        );

        conn.update(&articles(), &id, json!({"title": "edited"})).unwrap();
        assert_eq!(conn.get(&articles(), &id).unwrap().unwrap()["title"], "edited");
        assert_eq!(conn.count(&articles()).unwrap(), 1);

        assert!(conn.delete(&articles(), &id).unwrap());
        assert!(!conn.delete(&articles(), &id).unwrap());
        assert_eq!(conn.get(&articles(), &id).unwrap(), None);
    }

    #[test]
    fn test_insert_duplicate_and_update_missing() {
        let conn = db();
        let id = RecordId::new("1");
        conn.insert(&articles(), &id, json!({})).unwrap();

        assert!(matches!(
            conn.insert(&articles(), &id, json!({})),
            Err(ShardError::Driver(_))
        ));
        assert!(matches!(
            conn.update(&articles(), &RecordId::new("2"), json!({})),
            Err(ShardError::Driver(_))
        ));
    }

    #[test]
    fn test_upsert() {
        let conn = db();
        let id = RecordId::new("9");
        assert!(conn.upsert(&articles(), &id, json!({"v": 1})).unwrap());
        assert!(!conn.upsert(&articles(), &id, json!({"v": 2})).unwrap());
        assert_eq!(conn.get(&articles(), &id).unwrap().unwrap()["v"], 2);
    }

    #[test]
    fn test_missing_collection_is_driver_error() {
        let conn = MemoryConnection::new("default", "auth_db");
        let err = conn.scan(&articles()).unwrap_err();
        match err {
            ShardError::Driver(e) => assert!(e.message().contains("does not exist")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_scan_is_ordered_by_id() {
        let conn = db();
        for id in ["b", "c", "a"] {
            conn.insert(&articles(), &RecordId::new(id), json!({"id": id})).unwrap();
        }
        let ids: Vec<String> = conn
            .scan(&articles())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_increment_is_atomic() {
        let conn = Arc::new(MemoryConnection::new("news_feed_db", "news_feed_db"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| conn.increment("articles").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut values: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        values.sort_unstable();
        let expected: Vec<u64> = (1..=800).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_pool_opens_every_database() {
        let mut config = ShardlineConfig::default();
        config.environment = Some("dev".to_string());
        let registry = ShardRegistry::from_config(&config).unwrap();
        let factories: Vec<Arc<dyn ConnectionFactory>> = vec![Arc::new(MemoryConnectionFactory)];

        let pool = ConnectionPool::open(&registry, &factories).unwrap();
        assert_eq!(pool.len(), 5);
        assert_eq!(
            pool.get(&"articles_b_db".into()).unwrap().alias(),
            &ShardId::new("articles_b_db")
        );
        assert!(matches!(
            pool.get(&"missing".into()),
            Err(ShardError::UnknownShard(_))
        ));
    }

    #[test]
    fn test_pool_rejects_unknown_engine() {
        let mut config = ShardlineConfig::default();
        config.databases.get_mut("articles_c_db").unwrap().engine = "mysql".to_string();
        let registry = ShardRegistry::from_config(&config).unwrap();
        let factories: Vec<Arc<dyn ConnectionFactory>> = vec![Arc::new(MemoryConnectionFactory)];

        let err = ConnectionPool::open(&registry, &factories).unwrap_err();
        assert!(matches!(err, ShardError::Configuration(msg) if msg.contains("mysql")));
    }
}
