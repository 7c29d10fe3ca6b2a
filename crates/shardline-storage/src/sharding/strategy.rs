//! Sharding strategies.
//!
//! Defines how a sharding key is mapped onto one shard of an ordered shard set.

use serde::{Deserialize, Serialize};
use shardline_core::{Result, ShardError, ShardId, ShardingKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Which algorithm a strategy implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// `key mod shard_count`
    Modulo,
    /// Precomputed key -> shard table
    Explicit,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Modulo => f.write_str("modulo"),
            StrategyKind::Explicit => f.write_str("explicit"),
        }
    }
}

/// Trait for strategies that map a sharding key to a shard.
///
/// Implementations must be deterministic - the same key must always map to
/// the same shard for as long as the shard set is unchanged. Lookups never
/// block on I/O.
pub trait ShardingStrategy: Send + Sync + fmt::Debug {
    /// Returns the shard for a key.
    fn get_shard(&self, key: &ShardingKey) -> Result<ShardId>;

    /// Returns the ordered shard set this strategy routes over.
    fn shards(&self) -> &[ShardId];

    /// Returns the algorithm identity.
    fn kind(&self) -> StrategyKind;

    /// Checks that [`Self::register_key`] would accept the assignment,
    /// without changing anything.
    fn check_registration(&self, key: &ShardingKey, _shard: &ShardId) -> Result<()> {
        Err(ShardError::Configuration(format!(
            "{} strategy does not accept key registrations (key {})",
            self.kind(),
            key
        )))
    }

    /// Assigns a brand-new key to a shard.
    ///
    /// Only strategies backed by an explicit table support this.
    fn register_key(&self, key: ShardingKey, shard: ShardId) -> Result<()> {
        self.check_registration(&key, &shard)
    }

    /// Returns a stable description of the placement function.
    ///
    /// Two strategies with the same fingerprint place every key identically.
    fn fingerprint(&self) -> String {
        let shards: Vec<&str> = self.shards().iter().map(ShardId::as_str).collect();
        format!("{}:{}", self.kind(), shards.join(","))
    }

    /// Returns a description of the strategy for debugging.
    fn describe(&self) -> String;
}

// =============================================================================
// Modulo Sharding
// =============================================================================

/// Modulo sharding: `shard_set[key % shard_set.len()]`.
///
/// Stateless and deterministic. Adding or removing a shard remaps every key,
/// so the shard set is fixed for the lifetime of the data.
///
/// # Example
///
/// ```
/// use shardline_storage::sharding::{ModuloStrategy, ShardingStrategy};
/// use shardline_core::{ShardId, ShardingKey};
///
/// let strategy = ModuloStrategy::new(vec!["A".into(), "B".into(), "C".into()]).unwrap();
/// assert_eq!(strategy.get_shard(&ShardingKey::Int(22)).unwrap(), ShardId::new("B"));
/// ```
#[derive(Debug, Clone)]
pub struct ModuloStrategy {
    shards: Vec<ShardId>,
}

impl ModuloStrategy {
    /// Creates a modulo strategy over an ordered, non-empty shard set.
    pub fn new(shards: Vec<ShardId>) -> Result<Self> {
        if shards.is_empty() {
            return Err(ShardError::Configuration(
                "modulo strategy requires at least one shard".to_string(),
            ));
        }
        Ok(Self { shards })
    }
}

impl ShardingStrategy for ModuloStrategy {
    fn get_shard(&self, key: &ShardingKey) -> Result<ShardId> {
        let value = match key {
            ShardingKey::Int(v) if *v >= 0 => *v as u64,
            ShardingKey::Int(_) => {
                return Err(ShardError::InvalidKey {
                    key: key.clone(),
                    reason: "modulo sharding requires a non-negative integer".to_string(),
                })
            }
            ShardingKey::Str(_) => {
                return Err(ShardError::InvalidKey {
                    key: key.clone(),
                    reason: "modulo sharding requires an integer key".to_string(),
                })
            }
        };
        let index = (value % self.shards.len() as u64) as usize;
        Ok(self.shards[index].clone())
    }

    fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Modulo
    }

    fn describe(&self) -> String {
        format!("ModuloStrategy(shards={})", self.shards.len())
    }
}

// =============================================================================
// Explicit-Mapping Sharding
// =============================================================================

/// Explicit-mapping sharding: a fixed table from key (e.g. topic id) to shard.
///
/// Each shard holds at most `max_keys_per_shard` keys (1:1 by default). New
/// keys enter the table only through [`ShardingStrategy::register_key`], which
/// checks uniqueness, shard membership, and capacity. Lookups take a shared
/// read lock and are safe to run concurrently.
///
/// # Example
///
/// ```
/// use shardline_storage::sharding::{ExplicitMappingStrategy, ShardingStrategy};
/// use shardline_core::{ShardId, ShardingKey};
///
/// let strategy = ExplicitMappingStrategy::new(
///     vec!["A".into(), "B".into(), "C".into()],
///     vec![(1i64.into(), "A".into()), (2i64.into(), "B".into())],
///     1,
/// ).unwrap();
/// assert_eq!(strategy.get_shard(&ShardingKey::Int(2)).unwrap(), ShardId::new("B"));
/// assert!(strategy.get_shard(&ShardingKey::Int(4)).is_err());
/// ```
pub struct ExplicitMappingStrategy {
    shards: Vec<ShardId>,
    max_keys_per_shard: usize,
    table: RwLock<HashMap<ShardingKey, ShardId>>,
}

impl ExplicitMappingStrategy {
    /// Creates a mapping strategy from initial assignments.
    ///
    /// Every initial assignment goes through the same validation as
    /// [`ShardingStrategy::register_key`].
    pub fn new(
        shards: Vec<ShardId>,
        assignments: Vec<(ShardingKey, ShardId)>,
        max_keys_per_shard: usize,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(ShardError::Configuration(
                "explicit-mapping strategy requires at least one shard".to_string(),
            ));
        }
        if max_keys_per_shard == 0 {
            return Err(ShardError::Configuration(
                "max_keys_per_shard must be > 0".to_string(),
            ));
        }

        let strategy = Self {
            shards,
            max_keys_per_shard,
            table: RwLock::new(HashMap::new()),
        };
        for (key, shard) in assignments {
            strategy.register_key(key, shard)?;
        }
        Ok(strategy)
    }

    /// Returns the number of registered keys.
    pub fn len(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no key is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total number of keys the table can hold.
    pub fn capacity(&self) -> usize {
        self.shards.len() * self.max_keys_per_shard
    }

    /// Returns a sorted copy of the current assignments.
    pub fn assignments(&self) -> Vec<(ShardingKey, ShardId)> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = table
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        entries
    }

    fn check_assignment(
        &self,
        table: &HashMap<ShardingKey, ShardId>,
        key: &ShardingKey,
        shard: &ShardId,
    ) -> Result<()> {
        if !self.shards.contains(shard) {
            return Err(ShardError::UnknownShard(shard.clone()));
        }
        if table.contains_key(key) {
            return Err(ShardError::KeyAlreadyRegistered(key.clone()));
        }
        let on_shard = table.values().filter(|s| *s == shard).count();
        if on_shard >= self.max_keys_per_shard {
            return Err(ShardError::CapacityExceeded {
                shard: shard.clone(),
                limit: self.max_keys_per_shard,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ExplicitMappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitMappingStrategy")
            .field("shards", &self.shards)
            .field("max_keys_per_shard", &self.max_keys_per_shard)
            .field("keys", &self.len())
            .finish()
    }
}

impl ShardingStrategy for ExplicitMappingStrategy {
    fn get_shard(&self, key: &ShardingKey) -> Result<ShardId> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| ShardError::UnresolvedKey(key.clone()))
    }

    fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Explicit
    }

    fn check_registration(&self, key: &ShardingKey, shard: &ShardId) -> Result<()> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        self.check_assignment(&table, key, shard)
    }

    fn register_key(&self, key: ShardingKey, shard: ShardId) -> Result<()> {
        // Checks and insert happen under one write lock.
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        self.check_assignment(&table, &key, &shard)?;

        tracing::info!(key = %key, shard = %shard, "Registered sharding key");
        table.insert(key, shard);
        Ok(())
    }

    /// Covers the key table as well as the shard set, so moving a key to
    /// another shard changes the fingerprint.
    fn fingerprint(&self) -> String {
        let shards: Vec<&str> = self.shards.iter().map(ShardId::as_str).collect();
        let table: Vec<String> = self
            .assignments()
            .into_iter()
            .map(|(key, shard)| format!("{}={}", key, shard))
            .collect();
        format!("{}:{}|{}", self.kind(), shards.join(","), table.join(","))
    }

    fn describe(&self) -> String {
        format!(
            "ExplicitMappingStrategy(shards={}, keys={}, max_keys_per_shard={})",
            self.shards.len(),
            self.len(),
            self.max_keys_per_shard
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
