//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key and optionally an updated_at timestamp
/// used to order local reads newest first.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity within its entity type
  fn cache_key(&self) -> String;

  /// Last modification timestamp as RFC 3339 UTC.
  /// Returns None if the entity doesn't track modification time.
  fn updated_at(&self) -> Option<String>;

  /// Entity type name for storage organization (e.g., "ticket_issue", "activity")
  fn entity_type() -> &'static str;

  /// Owning partition, e.g. the source id a ticket was fetched from.
  fn owner(&self) -> Option<&str> {
    None
  }

  /// Lowercased text matched by local substring search.
  fn search_text(&self) -> Option<String> {
    None
  }
}

/// Logical key for a cached collection (e.g. "all activities", "tickets of source X").
pub trait QueryKey: Send + Sync {
  /// Stable, fixed-length hash used as the storage key
  fn cache_hash(&self) -> String;

  /// Human-readable description, stored alongside the hash and used in logs
  fn description(&self) -> String;
}

/// SHA256 hash for stable, fixed-length query keys.
pub fn stable_hash(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale but network fetch in progress or failed
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
