pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod logging;
pub mod placement;
pub mod repository;
pub mod sequence;
pub mod sharding;

// Re-exports
pub use bootstrap::Shardline;
pub use config::{ConfigError, ShardlineConfig};
pub use connection::{
    ConnectionFactory, ConnectionPool, Document, MemoryConnection, MemoryConnectionFactory,
    ShardConnection,
};
pub use placement::{PlacementCheck, PlacementStore};
pub use repository::{Entity, KeyPolicy, PersistenceError, ShardedRepository};
pub use sequence::{AtomicSequence, CounterSequence, KeySequence};
pub use sharding::{
    DatabaseRouter, EntityRouter, ExplicitMappingStrategy, ModuloStrategy, Placement,
    RouterChain, ShardRegistry, ShardingStrategy, StrategyKind,
};
