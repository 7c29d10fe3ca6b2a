//! Placement records kept in the metadata database.
//!
//! Changing the shard set or the strategy moves existing keys to other shards
//! without moving their data. The active strategy's fingerprint is stored on
//! first start and every later start must present the same one; a changed
//! placement is refused until [`PlacementStore::accept`] records it, which
//! happens only after the data has been migrated out of band.
//!
//! For the explicit strategy the fingerprint includes the configured key
//! table, so moving a configured key between shards is refused like any other
//! placement change. The check runs before registered keys are replayed.
//!
//! Keys added with `register_key` are stored here too and replayed into the
//! strategy at startup.

use crate::connection::ShardConnection;
use crate::sharding::ShardingStrategy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shardline_core::{DriverError, EntityType, RecordId, Result, ShardError, ShardId, ShardingKey};
use std::sync::Arc;

const PLACEMENT_COLLECTION: &str = "shardline_placement";
const KEYS_COLLECTION: &str = "shardline_keys";
const FINGERPRINT_ID: &str = "fingerprint";

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    key: ShardingKey,
    shard: ShardId,
}

/// Outcome of comparing the active strategy with the stored placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementCheck {
    /// Nothing was stored yet; the current fingerprint was recorded.
    Recorded(String),
    /// Stored and current fingerprints agree.
    Unchanged(String),
}

/// Reader/writer for placement records in one (metadata) database.
#[derive(Debug, Clone)]
pub struct PlacementStore {
    connection: Arc<dyn ShardConnection>,
    placement: EntityType,
    keys: EntityType,
}

impl PlacementStore {
    /// Opens the store, creating its collections if needed.
    pub fn new(connection: Arc<dyn ShardConnection>) -> Result<Self> {
        let placement = EntityType::new(PLACEMENT_COLLECTION);
        let keys = EntityType::new(KEYS_COLLECTION);
        connection.create_collection(&placement)?;
        connection.create_collection(&keys)?;
        Ok(Self {
            connection,
            placement,
            keys,
        })
    }

    /// Returns the stored fingerprint, if any.
    pub fn stored_fingerprint(&self) -> Result<Option<String>> {
        let doc = self
            .connection
            .get(&self.placement, &RecordId::new(FINGERPRINT_ID))?;
        Ok(doc.and_then(|d| d["fingerprint"].as_str().map(str::to_string)))
    }

    /// Compares the strategy with the stored placement.
    ///
    /// Fails with [`ShardError::Configuration`] if the placement changed.
    pub fn check(&self, strategy: &dyn ShardingStrategy) -> Result<PlacementCheck> {
        let current = strategy.fingerprint();
        match self.stored_fingerprint()? {
            None => {
                self.write_fingerprint(&current)?;
                tracing::info!(fingerprint = %current, "Recorded shard placement");
                Ok(PlacementCheck::Recorded(current))
            }
            Some(stored) if stored == current => Ok(PlacementCheck::Unchanged(current)),
            Some(stored) => Err(ShardError::Configuration(format!(
                "placement changed from '{}' to '{}'; migrate existing data, then accept the new placement",
                stored, current
            ))),
        }
    }

    /// Records the strategy's fingerprint as the accepted placement.
    pub fn accept(&self, strategy: &dyn ShardingStrategy) -> Result<String> {
        let current = strategy.fingerprint();
        let previous = self.stored_fingerprint()?;
        self.write_fingerprint(&current)?;
        tracing::warn!(
            previous = previous.as_deref().unwrap_or("<none>"),
            current = %current,
            "Accepted new shard placement"
        );
        Ok(current)
    }

    /// Persists a registered key.
    ///
    /// Fails if the key is already stored; an existing registration is never
    /// overwritten.
    pub fn record_key(&self, key: &ShardingKey, shard: &ShardId) -> Result<()> {
        let record = KeyRecord {
            key: key.clone(),
            shard: shard.clone(),
        };
        let doc = serde_json::to_value(&record).map_err(corrupt)?;
        self.connection
            .insert(&self.keys, &RecordId::new(key_record_id(key)), doc)
    }

    /// Removes a stored registration. Returns true if it existed.
    pub fn forget_key(&self, key: &ShardingKey) -> Result<bool> {
        self.connection
            .delete(&self.keys, &RecordId::new(key_record_id(key)))
    }

    /// Returns every persisted key registration.
    pub fn registered_keys(&self) -> Result<Vec<(ShardingKey, ShardId)>> {
        self.connection
            .scan(&self.keys)?
            .into_iter()
            .map(|(_, doc)| {
                let record: KeyRecord = serde_json::from_value(doc).map_err(corrupt)?;
                Ok((record.key, record.shard))
            })
            .collect()
    }

    /// Replays persisted registrations into the strategy.
    ///
    /// Keys already routed to the same shard are skipped; a key routed
    /// elsewhere is a configuration conflict. Returns the number replayed.
    pub fn restore_keys(&self, strategy: &dyn ShardingStrategy) -> Result<usize> {
        let mut restored = 0;
        for (key, shard) in self.registered_keys()? {
            match strategy.get_shard(&key) {
                Ok(current) if current == shard => {}
                Ok(current) => {
                    return Err(ShardError::Configuration(format!(
                        "key {} is registered on {} but configured for {}",
                        key, shard, current
                    )))
                }
                Err(ShardError::UnresolvedKey(_)) => {
                    strategy.register_key(key, shard)?;
                    restored += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if restored > 0 {
            tracing::info!(keys = restored, "Restored registered sharding keys");
        }
        Ok(restored)
    }

    fn write_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.connection.upsert(
            &self.placement,
            &RecordId::new(FINGERPRINT_ID),
            json!({ "fingerprint": fingerprint }),
        )?;
        Ok(())
    }
}

fn key_record_id(key: &ShardingKey) -> String {
    match key {
        ShardingKey::Int(v) => format!("int:{}", v),
        ShardingKey::Str(s) => format!("str:{}", s),
    }
}

fn corrupt(err: serde_json::Error) -> ShardError {
    ShardError::Driver(DriverError::new(format!("corrupt placement record: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::sharding::{ExplicitMappingStrategy, ModuloStrategy};

    fn store() -> PlacementStore {
        PlacementStore::new(Arc::new(MemoryConnection::new("news_feed_db", "news_feed_db"))).unwrap()
    }

    fn modulo(shards: &[&str]) -> ModuloStrategy {
        ModuloStrategy::new(shards.iter().map(|s| ShardId::new(*s)).collect()).unwrap()
    }

    #[test]
    fn test_first_check_records_fingerprint() {
        let store = store();
        let strategy = modulo(&["A", "B", "C"]);

        assert_eq!(store.stored_fingerprint().unwrap(), None);
        assert_eq!(
            store.check(&strategy).unwrap(),
            PlacementCheck::Recorded("modulo:A,B,C".to_string())
        );
        assert_eq!(
            store.check(&strategy).unwrap(),
            PlacementCheck::Unchanged("modulo:A,B,C".to_string())
        );
    }

    #[test]
    fn test_changed_shard_count_is_refused() {
        let store = store();
        store.check(&modulo(&["A", "B", "C"])).unwrap();

        let err = store.check(&modulo(&["A", "B", "C", "D"])).unwrap_err();
        assert!(matches!(err, ShardError::Configuration(msg) if msg.contains("placement changed")));
    }

    #[test]
    fn test_changed_strategy_is_refused_until_accepted() {
        let store = store();
        store.check(&modulo(&["A", "B", "C"])).unwrap();

        let explicit = ExplicitMappingStrategy::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![(1i64.into(), "A".into())],
            1,
        )
        .unwrap();
        assert!(store.check(&explicit).is_err());

        assert_eq!(store.accept(&explicit).unwrap(), "explicit:A,B,C|1=A");
        assert!(matches!(store.check(&explicit).unwrap(), PlacementCheck::Unchanged(_)));
    }

    #[test]
    fn test_registered_keys_are_replayed() {
        let store = store();
        store.record_key(&ShardingKey::Int(4), &"B".into()).unwrap();
        store
            .record_key(&ShardingKey::Str("sports".to_string()), &"C".into())
            .unwrap();

        let strategy = ExplicitMappingStrategy::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![(1i64.into(), "A".into())],
            1,
        )
        .unwrap();
        assert_eq!(store.restore_keys(&strategy).unwrap(), 2);
        assert_eq!(strategy.get_shard(&ShardingKey::Int(4)).unwrap(), ShardId::new("B"));
        assert_eq!(
            strategy.get_shard(&ShardingKey::Str("sports".to_string())).unwrap(),
            ShardId::new("C")
        );

        // Replaying again is a no-op
        assert_eq!(store.restore_keys(&strategy).unwrap(), 0);
    }

    #[test]
    fn test_remapped_key_is_refused() {
        let store = store();
        let table = |shard: &str| {
            ExplicitMappingStrategy::new(
                vec!["A".into(), "B".into()],
                vec![(1i64.into(), shard.into())],
                1,
            )
            .unwrap()
        };
        store.check(&table("A")).unwrap();

        let err = store.check(&table("B")).unwrap_err();
        assert!(matches!(err, ShardError::Configuration(msg) if msg.contains("placement changed")));
    }

    #[test]
    fn test_record_key_never_overwrites() {
        let store = store();
        store.record_key(&ShardingKey::Int(4), &"B".into()).unwrap();

        assert!(matches!(
            store.record_key(&ShardingKey::Int(4), &"C".into()),
            Err(ShardError::Driver(_))
        ));
        assert_eq!(
            store.registered_keys().unwrap(),
            vec![(ShardingKey::Int(4), ShardId::new("B"))]
        );

        assert!(store.forget_key(&ShardingKey::Int(4)).unwrap());
        assert!(store.registered_keys().unwrap().is_empty());
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let store = store();
        store.record_key(&ShardingKey::Int(1), &"B".into()).unwrap();

        let strategy = ExplicitMappingStrategy::new(
            vec!["A".into(), "B".into()],
            vec![(1i64.into(), "A".into())],
            1,
        )
        .unwrap();
        assert!(matches!(
            store.restore_keys(&strategy),
            Err(ShardError::Configuration(_))
        ));
    }
}
