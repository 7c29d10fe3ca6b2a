//! Entity persistence hook.
//!
//! [`ShardedRepository`] sits between application code and the per-shard
//! connections. Every create, save, delete and read computes the record's
//! sharding key, asks the router chain for a database, and runs the operation
//! on that database's connection.
//!
//! # Example
//!
//! ```ignore
//! let shardline = Shardline::open(ShardlineConfig::default())?;
//! let articles = shardline.repository::<Article>()?;
//!
//! let article = articles.create(Article::new("Hello"))?;   // key drawn from the sequence
//! let loaded = articles.get(&article.record_id().unwrap(), article.sharding_key())?;
//! ```

use crate::connection::ConnectionPool;
use crate::sequence::KeySequence;
use crate::sharding::RouterChain;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardline_core::{EntityType, Hints, RecordId, ShardError, ShardId, ShardingKey};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the persistence hook.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error("Failed to encode or decode record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Creating a {0} record requires a sharding key")]
    MissingShardingKey(EntityType),

    #[error("{0} record has no id")]
    MissingRecordId(EntityType),

    #[error("Entity type {0} is not sharded")]
    NotSharded(EntityType),
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// How a new record gets its sharding key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// The caller sets the key (topic id, category).
    Supplied,
    /// The key is drawn from a [`KeySequence`] on creation.
    Sequential,
}

/// A record type stored through the router.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    /// Entity type tag the routers match on.
    fn entity_type() -> EntityType;

    /// How new records get their key.
    fn key_policy() -> KeyPolicy {
        KeyPolicy::Supplied
    }

    /// Primary id within a shard; `None` until assigned.
    fn record_id(&self) -> Option<RecordId>;

    /// The sharding key, if set.
    fn sharding_key(&self) -> Option<ShardingKey>;

    /// Stores a key drawn from the sequence.
    ///
    /// Only called for [`KeyPolicy::Sequential`] types, and only with keys
    /// that convert into a [`ShardingKey`] via `ShardingKey::try_from`.
    fn assign_key(&mut self, _key: u64) {}
}

/// Routes every persistence operation of one entity type.
pub struct ShardedRepository<E> {
    entity_type: EntityType,
    chain: Arc<RouterChain>,
    pool: Arc<ConnectionPool>,
    sequence: Option<Arc<dyn KeySequence>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> fmt::Debug for ShardedRepository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedRepository")
            .field("entity_type", &self.entity_type)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl<E> Clone for ShardedRepository<E> {
    fn clone(&self) -> Self {
        Self {
            entity_type: self.entity_type.clone(),
            chain: Arc::clone(&self.chain),
            pool: Arc::clone(&self.pool),
            sequence: self.sequence.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> ShardedRepository<E> {
    /// Creates a repository. Sequential-key types need a sequence.
    pub fn new(
        chain: Arc<RouterChain>,
        pool: Arc<ConnectionPool>,
        sequence: Option<Arc<dyn KeySequence>>,
    ) -> Result<Self> {
        let entity_type = E::entity_type();
        if E::key_policy() == KeyPolicy::Sequential && sequence.is_none() {
            return Err(ShardError::Configuration(format!(
                "{} uses sequential keys but no sequence is configured",
                entity_type
            ))
            .into());
        }
        Ok(Self {
            entity_type,
            chain,
            pool,
            sequence,
            _entity: PhantomData,
        })
    }

    /// Returns the entity type this repository serves.
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Returns true if a sharded router owns this type.
    pub fn is_sharded(&self) -> bool {
        self.chain.strategy_for(&self.entity_type).is_some()
    }

    /// Returns the shard a key maps to.
    pub fn shard_for_key(&self, key: &ShardingKey) -> Result<ShardId> {
        let strategy = self
            .chain
            .strategy_for(&self.entity_type)
            .ok_or_else(|| PersistenceError::NotSharded(self.entity_type.clone()))?;
        Ok(strategy.get_shard(key)?)
    }

    /// Persists a new record and returns it with its key assigned.
    pub fn create(&self, mut entity: E) -> Result<E> {
        if entity.sharding_key().is_none() {
            match (E::key_policy(), &self.sequence) {
                (KeyPolicy::Sequential, Some(sequence)) => {
                    let key = sequence.next_key()?;
                    ShardingKey::try_from(key)?;
                    entity.assign_key(key);
                }
                (KeyPolicy::Sequential, None) => {
                    return Err(ShardError::Configuration(format!(
                        "{} uses sequential keys but no sequence is configured",
                        self.entity_type
                    ))
                    .into());
                }
                (KeyPolicy::Supplied, _) if self.is_sharded() => {
                    return Err(PersistenceError::MissingShardingKey(self.entity_type.clone()));
                }
                (KeyPolicy::Supplied, _) => {}
            }
        }

        let id = self.require_id(&entity)?;
        let shard = self.write_target(&entity)?;
        let doc = serde_json::to_value(&entity)?;
        self.pool.get(&shard)?.insert(&self.entity_type, &id, doc)?;

        tracing::debug!(entity_type = %self.entity_type, id = %id, shard = %shard, "Created record");
        Ok(entity)
    }

    /// Replaces an existing record.
    pub fn save(&self, entity: &E) -> Result<()> {
        let id = self.require_id(entity)?;
        let shard = self.write_target(entity)?;
        let doc = serde_json::to_value(entity)?;
        self.pool.get(&shard)?.update(&self.entity_type, &id, doc)?;
        Ok(())
    }

    /// Deletes a record. Returns true if it existed.
    pub fn delete(&self, entity: &E) -> Result<bool> {
        let id = self.require_id(entity)?;
        let shard = self.write_target(entity)?;
        Ok(self.pool.get(&shard)?.delete(&self.entity_type, &id)?)
    }

    /// Loads one record.
    ///
    /// Without a key the read goes to the default shard only.
    pub fn get(&self, id: &RecordId, key: Option<ShardingKey>) -> Result<Option<E>> {
        let shard = self
            .chain
            .database_for_read(&self.entity_type, &Hints::from_key(key))?;
        self.pool
            .get(&shard)?
            .get(&self.entity_type, id)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(PersistenceError::from)
    }

    /// Lists records on one shard.
    ///
    /// With a key, returns the records carrying that key. Without one,
    /// returns everything on the default shard; use [`Self::scan_all`] to see
    /// every shard.
    pub fn list(&self, key: Option<ShardingKey>) -> Result<Vec<E>> {
        let hints = Hints::from_key(key);
        let shard = self.chain.database_for_read(&self.entity_type, &hints)?;
        let records = self.load_shard(&shard)?;
        Ok(match hints.sharding_key() {
            Some(key) => records
                .into_iter()
                .filter(|e| e.sharding_key().as_ref() == Some(key))
                .collect(),
            None => records,
        })
    }

    /// Reads every shard the type may live on and concatenates the results
    /// in shard order.
    pub fn scan_all(&self) -> Result<Vec<E>> {
        let mut merged = Vec::new();
        for shard in self.fan_out()? {
            merged.extend(self.load_shard(&shard)?);
        }
        Ok(merged)
    }

    /// Counts records across every shard the type may live on.
    pub fn count_all(&self) -> Result<usize> {
        let mut total = 0;
        for shard in self.fan_out()? {
            total += self.pool.get(&shard)?.count(&self.entity_type)?;
        }
        Ok(total)
    }

    fn fan_out(&self) -> Result<Vec<ShardId>> {
        match self.chain.shards_for(&self.entity_type) {
            Some(shards) => Ok(shards.to_vec()),
            None => Ok(vec![self
                .chain
                .database_for_read(&self.entity_type, &Hints::none())?]),
        }
    }

    fn load_shard(&self, shard: &ShardId) -> Result<Vec<E>> {
        self.pool
            .get(shard)?
            .scan(&self.entity_type)?
            .into_iter()
            .map(|(_, doc)| serde_json::from_value(doc).map_err(PersistenceError::from))
            .collect()
    }

    fn write_target(&self, entity: &E) -> Result<ShardId> {
        let key = entity.sharding_key();
        if key.is_none() && self.is_sharded() {
            tracing::warn!(
                entity_type = %self.entity_type,
                "Write without a sharding key, using the default shard"
            );
        }
        Ok(self
            .chain
            .database_for_write(&self.entity_type, &Hints::from_key(key))?)
    }

    fn require_id(&self, entity: &E) -> Result<RecordId> {
        entity
            .record_id()
            .ok_or_else(|| PersistenceError::MissingRecordId(self.entity_type.clone()))
    }
}
