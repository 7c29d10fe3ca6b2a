//! # Shardline Core
//!
//! Core types shared by every Shardline crate.
//!
//! This crate provides the fundamental building blocks:
//! - [`ShardId`], [`EntityType`] and [`RecordId`] - Type-safe identifiers
//! - [`ShardingKey`] and [`Hints`] - Inputs to a routing decision
//! - [`RoutingDecision`] and [`SchemaDecision`] - Tri-state router answers
//! - [`ShardError`] - The routing error taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Identifiers (Newtypes for type safety)
// =============================================================================

/// Identifies one physical database (a shard or a fixed-role database).
///
/// Shard ids are configuration aliases such as `articles_a_db`; they are
/// immutable once a registry has been built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a new shard id.
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    /// Returns the alias as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ShardId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Tag selecting which routing policy applies to a record (e.g. `articles`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Creates a new entity type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the entity type as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Primary identity of a stored record within one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates a new record id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// Sharding Keys and Hints
// =============================================================================

/// The attribute of a record used to select its shard.
///
/// Either a numeric id (sequential article ids) or a small-cardinality
/// categorical value (topic ids, category slugs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShardingKey {
    /// Integer key
    Int(i64),
    /// Categorical string key
    Str(String),
}

impl ShardingKey {
    /// Attempts to get the key as an i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ShardingKey::Int(i) => Some(*i),
            ShardingKey::Str(_) => None,
        }
    }

    /// Attempts to get the key as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ShardingKey::Str(s) => Some(s),
            ShardingKey::Int(_) => None,
        }
    }
}

impl fmt::Display for ShardingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingKey::Int(i) => write!(f, "{}", i),
            ShardingKey::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for ShardingKey {
    fn from(v: i64) -> Self {
        ShardingKey::Int(v)
    }
}

impl From<i32> for ShardingKey {
    fn from(v: i32) -> Self {
        ShardingKey::Int(i64::from(v))
    }
}

impl From<u32> for ShardingKey {
    fn from(v: u32) -> Self {
        ShardingKey::Int(i64::from(v))
    }
}

/// Sequence-issued keys are unsigned; values above `i64::MAX` are refused.
impl TryFrom<u64> for ShardingKey {
    type Error = ShardError;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v)
            .map(ShardingKey::Int)
            .map_err(|_| ShardError::KeyOutOfRange(v))
    }
}

impl From<&str> for ShardingKey {
    fn from(v: &str) -> Self {
        ShardingKey::Str(v.to_string())
    }
}

impl From<String> for ShardingKey {
    fn from(v: String) -> Self {
        ShardingKey::Str(v)
    }
}

/// Ad hoc routing parameters passed alongside a data operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    /// Sharding key of the record being accessed, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding_key: Option<ShardingKey>,
}

impl Hints {
    /// Hints with no sharding key.
    pub fn none() -> Self {
        Self::default()
    }

    /// Hints carrying a sharding key.
    pub fn with_key(key: impl Into<ShardingKey>) -> Self {
        Self {
            sharding_key: Some(key.into()),
        }
    }

    /// Hints from an optional key.
    pub fn from_key(key: Option<ShardingKey>) -> Self {
        Self { sharding_key: key }
    }

    /// Returns the sharding key, if any.
    #[inline]
    pub fn sharding_key(&self) -> Option<&ShardingKey> {
        self.sharding_key.as_ref()
    }
}

// =============================================================================
// Router Answers
// =============================================================================

/// A router's answer to "which database serves this read or write".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// The router owns the entity type and selected this database.
    Owned(ShardId),
    /// The router owns the entity type but refuses the operation.
    Denied,
    /// The entity type is not this router's concern.
    NotApplicable,
}

impl RoutingDecision {
    /// Returns true unless the router abstained.
    #[inline]
    pub fn is_applicable(&self) -> bool {
        !matches!(self, RoutingDecision::NotApplicable)
    }

    /// Returns the selected shard, if the router owned the operation.
    pub fn shard(&self) -> Option<&ShardId> {
        match self {
            RoutingDecision::Owned(shard) => Some(shard),
            _ => None,
        }
    }
}

/// A router's answer to "may schema for this entity type live on this database".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDecision {
    /// Owned and allowed.
    Allow,
    /// Owned and denied.
    Deny,
    /// Not this router's concern.
    Abstain,
}

impl SchemaDecision {
    /// Collapses to `Some(true)`, `Some(false)` or `None`.
    pub fn as_option(self) -> Option<bool> {
        match self {
            SchemaDecision::Allow => Some(true),
            SchemaDecision::Deny => Some(false),
            SchemaDecision::Abstain => None,
        }
    }
}

impl From<bool> for SchemaDecision {
    fn from(allowed: bool) -> Self {
        if allowed {
            SchemaDecision::Allow
        } else {
            SchemaDecision::Deny
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Opaque error raised by a per-shard database driver.
///
/// Propagated unchanged through the routing layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    message: String,
}

impl DriverError {
    /// Creates a driver error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the driver's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that can occur while selecting a shard.
///
/// All of these are configuration or programming errors: none is transient and
/// none is retried.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Empty or missing shard set, missing role, over-capacity mapping table
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Explicit-mapping lookup for a key with no assigned shard
    #[error("No shard registered for sharding key {0}")]
    UnresolvedKey(ShardingKey),

    /// Key the active strategy cannot route (negative or non-integer for modulo)
    #[error("Invalid sharding key {key}: {reason}")]
    InvalidKey { key: ShardingKey, reason: String },

    /// Unsigned key too large for an integer sharding key
    #[error("Key {0} exceeds the integer sharding key range")]
    KeyOutOfRange(u64),

    /// Shard id outside the configured shard set
    #[error("Shard {0} is not part of the configured shard set")]
    UnknownShard(ShardId),

    /// Registering a key that already has a shard
    #[error("Sharding key {0} is already registered")]
    KeyAlreadyRegistered(ShardingKey),

    /// Registering more keys on a shard than it may hold
    #[error("Shard {shard} already holds the maximum of {limit} key(s)")]
    CapacityExceeded { shard: ShardId, limit: usize },

    /// A router claimed the entity type and refused the operation
    #[error("Router '{router}' denied access to {entity_type}")]
    Denied { router: String, entity_type: EntityType },

    /// No router claimed the entity type and no default database exists
    #[error("No database routes entity type {0}")]
    NoRoute(EntityType),

    /// Error from the underlying per-shard driver
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, ShardError>;

// =============================================================================
// Tests
// =============================================================================
