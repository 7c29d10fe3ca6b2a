//! Sequential key generation.
//!
//! New records of sequential-key entity types draw their sharding key from a
//! [`KeySequence`]. Two concurrent calls never return the same key.

use crate::connection::ShardConnection;
use shardline_core::Result;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of unique, increasing keys.
pub trait KeySequence: Send + Sync + fmt::Debug {
    /// Returns the next key.
    fn next_key(&self) -> Result<u64>;
}

/// Sequence backed by a counter stored in a fixed, non-sharded database.
///
/// Uniqueness relies on [`ShardConnection::increment`] being atomic.
#[derive(Debug, Clone)]
pub struct CounterSequence {
    connection: Arc<dyn ShardConnection>,
    counter: String,
}

impl CounterSequence {
    /// Creates a sequence over the named counter.
    pub fn new(connection: Arc<dyn ShardConnection>, counter: impl Into<String>) -> Self {
        Self {
            connection,
            counter: counter.into(),
        }
    }

    /// Returns the counter name.
    pub fn counter(&self) -> &str {
        &self.counter
    }
}

impl KeySequence for CounterSequence {
    fn next_key(&self) -> Result<u64> {
        let key = self.connection.increment(&self.counter)?;
        tracing::trace!(counter = %self.counter, key, "Issued sequential key");
        Ok(key)
    }
}

/// In-process sequence; keys restart on every run.
#[derive(Debug)]
pub struct AtomicSequence {
    next: AtomicU64,
}

impl AtomicSequence {
    /// Creates a sequence whose first key is `start`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl Default for AtomicSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl KeySequence for AtomicSequence {
    fn next_key(&self) -> Result<u64> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}
