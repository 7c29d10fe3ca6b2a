//! Database routing and sharding.
//!
//! This module decides, for every data access, which physical database
//! serves a given entity type, and for sharded types which shard holds a
//! given sharding key.
//!
//! # Strategies
//!
//! - **Modulo**: `shards[key mod N]` for non-negative integer keys
//! - **Explicit mapping**: a key -> shard table with a per-shard capacity
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         RouterChain                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//! │  │ auth router  │ → │ news router  │ → │ articles router  │  │
//! │  │  (default)   │   │(news_feed_db)│   │ ShardingStrategy │  │
//! │  └──────────────┘   └──────────────┘   └────────┬─────────┘  │
//! │                                                 │            │
//! │                          ┌──────────────────────┼─────────┐  │
//! │                          ▼                      ▼         ▼  │
//! │                   articles_a_db        articles_b_db  ..._c  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod chain;
mod registry;
mod router;
mod strategy;

pub use chain::RouterChain;
pub use registry::ShardRegistry;
pub use router::{DatabaseRouter, EntityRouter, Placement};
pub use strategy::{ExplicitMappingStrategy, ModuloStrategy, ShardingStrategy, StrategyKind};
