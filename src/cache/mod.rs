//! Generic caching layer for data persistence and offline support.
//!
//! This module provides a provider-agnostic caching mechanism that:
//! - Caches entities in SQLite with an owner, updated_at and search text
//! - Tracks whole collections under hashed query keys with a write timestamp
//! - Serves reads from the local store first, as a stream that follows every write
//! - Collapses concurrent fetches of one key into a single remote call
//! - Provides basic offline mode (serve stale cache when network unavailable)

mod layer;
pub mod storage;
mod traits;

pub use layer::EntityCache;
pub use storage::{observe_entities, CacheStorage, SqliteStorage, StoreChange};
pub use traits::{stable_hash, CacheResult, CacheSource, Cacheable, QueryKey};
