//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

use super::traits::{Cacheable, QueryKey};

/// Result of a cached query lookup.
#[derive(Debug, Clone)]
pub struct CachedQueryResult<T> {
  /// The cached entities in order
  pub entities: Vec<T>,
  /// When the query result was cached
  pub cached_at: DateTime<Utc>,
}

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

/// Published on the store-wide change feed after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
  pub entity_type: &'static str,
  /// Hash of the query result that changed, or None for entity-level writes
  pub query: Option<String>,
}

impl StoreChange {
  /// Whether an observer of `entity_type` (optionally narrowed to one query) must re-read.
  pub fn affects(&self, entity_type: &str, query: Option<&str>) -> bool {
    if self.entity_type != entity_type {
      return false;
    }
    match (query, self.query.as_deref()) {
      (Some(wanted), Some(changed)) => wanted == changed,
      _ => true,
    }
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Replace the entities of a query result and stamp it with `cached_at`.
  fn store_query_result<T: Cacheable>(
    &self,
    key: &dyn QueryKey,
    entities: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Get cached entities for a query.
  fn get_query_result<T: Cacheable>(&self, key: &dyn QueryKey)
    -> Result<Option<CachedQueryResult<T>>>;

  /// Forget a query result. The entities themselves stay cached.
  fn delete_query_result<T: Cacheable>(&self, key: &dyn QueryKey) -> Result<()>;

  /// Get a single entity by key.
  fn get_entity<T: Cacheable>(&self, entity_key: &str) -> Result<Option<CachedEntity<T>>>;

  /// All entities of a type, newest `updated_at` first.
  fn get_entities<T: Cacheable>(&self) -> Result<Vec<T>>;

  /// Store a single entity.
  fn store_entity<T: Cacheable>(&self, entity: &T, cached_at: DateTime<Utc>) -> Result<()>;

  /// Upsert a batch of entities in one transaction.
  fn store_entities<T: Cacheable>(&self, entities: &[T], cached_at: DateTime<Utc>) -> Result<()>;

  fn delete_entity<T: Cacheable>(&self, entity_key: &str) -> Result<()>;

  /// Delete every entity and query result of a type.
  fn delete_entities<T: Cacheable>(&self) -> Result<()>;

  /// Delete every entity of a type owned by `owner`, returning the number removed.
  fn delete_entities_by_owner<T: Cacheable>(&self, owner: &str) -> Result<usize>;

  /// Case-insensitive substring search over `Cacheable::search_text`, newest first.
  fn search_entities<T: Cacheable>(&self, text: &str, limit: usize) -> Result<Vec<T>>;

  fn get_state(&self, name: &str) -> Result<Option<String>>;

  fn put_state(&self, name: &str, value: &str, updated_at: DateTime<Utc>) -> Result<()>;

  /// Subscribe to the change feed.
  fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  changes: broadcast::Sender<StoreChange>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create a throwaway in-memory storage.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    let storage = Self {
      conn: Mutex::new(conn),
      changes,
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tracksync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn notify(&self, entity_type: &'static str, query: Option<String>) {
    // No receivers is fine
    let _ = self.changes.send(StoreChange { entity_type, query });
  }
}

const CHANGE_FEED_CAPACITY: usize = 256;

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Generic entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    owner TEXT,
    data BLOB NOT NULL,
    updated_at TEXT,
    search_text TEXT,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_entity_cache_updated
    ON entity_cache(entity_type, updated_at);

CREATE INDEX IF NOT EXISTS idx_entity_cache_owner
    ON entity_cache(entity_type, owner);

-- Query result tracking
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_description TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    result_count INTEGER NOT NULL
);

-- Query to entity mapping (preserves order)
CREATE TABLE IF NOT EXISTS query_results (
    query_hash TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (query_hash, entity_key),
    FOREIGN KEY (query_hash) REFERENCES query_cache(query_hash) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_query_results_hash ON query_results(query_hash);

-- Sync cursors and other small bits of engine state
CREATE TABLE IF NOT EXISTS sync_state (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_query_result<T: Cacheable>(
    &self,
    key: &dyn QueryKey,
    entities: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let entity_type = T::entity_type();
    let query_hash = key.cache_hash();
    let cached_at = format_timestamp(cached_at);

    {
      let mut conn = self.conn()?;
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      // Delete existing query results
      tx.execute(
        "DELETE FROM query_results WHERE query_hash = ?",
        params![query_hash],
      )
      .map_err(|e| eyre!("Failed to delete old query results: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO query_cache (query_hash, query_description, entity_type, cached_at, result_count)
         VALUES (?, ?, ?, ?, ?)",
        params![query_hash, key.description(), entity_type, cached_at, entities.len()],
      )
      .map_err(|e| eyre!("Failed to update query cache: {}", e))?;

      for (position, entity) in entities.iter().enumerate() {
        upsert_entity(&tx, entity, &cached_at)?;

        tx.execute(
          "INSERT OR REPLACE INTO query_results (query_hash, entity_key, position)
           VALUES (?, ?, ?)",
          params![query_hash, entity.cache_key(), position],
        )
        .map_err(|e| eyre!("Failed to store query result: {}", e))?;
      }

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    }

    self.notify(entity_type, Some(query_hash));
    Ok(())
  }

  fn get_query_result<T: Cacheable>(
    &self,
    key: &dyn QueryKey,
  ) -> Result<Option<CachedQueryResult<T>>> {
    let conn = self.conn()?;
    let entity_type = T::entity_type();
    let query_hash = key.cache_hash();

    let cached_at: Option<String> = conn
      .query_row(
        "SELECT cached_at FROM query_cache WHERE query_hash = ? AND entity_type = ?",
        params![query_hash, entity_type],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read query cache: {}", e))?;

    let cached_at = match cached_at {
      Some(s) => parse_timestamp(&s)?,
      None => return Ok(None),
    };

    // Get entities in order
    let mut stmt = conn
      .prepare(
        "SELECT ec.data FROM entity_cache ec
         INNER JOIN query_results qr ON ec.entity_type = ? AND ec.entity_key = qr.entity_key
         WHERE qr.query_hash = ?
         ORDER BY qr.position",
      )
      .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

    let entities: Vec<T> = stmt
      .query_map(params![entity_type, query_hash], |row| {
        row.get::<_, Vec<u8>>(0)
      })
      .map_err(|e| eyre!("Failed to query entities: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(Some(CachedQueryResult {
      entities,
      cached_at,
    }))
  }

  fn delete_query_result<T: Cacheable>(&self, key: &dyn QueryKey) -> Result<()> {
    let query_hash = key.cache_hash();

    {
      let mut conn = self.conn()?;
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      tx.execute(
        "DELETE FROM query_results WHERE query_hash = ?",
        params![query_hash],
      )
      .map_err(|e| eyre!("Failed to delete query results: {}", e))?;
      tx.execute(
        "DELETE FROM query_cache WHERE query_hash = ?",
        params![query_hash],
      )
      .map_err(|e| eyre!("Failed to delete query cache: {}", e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    }

    self.notify(T::entity_type(), Some(query_hash));
    Ok(())
  }

  fn get_entity<T: Cacheable>(&self, entity_key: &str) -> Result<Option<CachedEntity<T>>> {
    let conn = self.conn()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), entity_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entity {}: {}", entity_key, e))?;

    match row {
      Some((data, cached_at)) => {
        let entity: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entity: {}", e))?;
        let cached_at = parse_timestamp(&cached_at)?;
        Ok(Some(CachedEntity { entity, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn get_entities<T: Cacheable>(&self) -> Result<Vec<T>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT data FROM entity_cache
         WHERE entity_type = ?
         ORDER BY updated_at DESC, entity_key",
      )
      .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

    let entities: Vec<T> = stmt
      .query_map(params![T::entity_type()], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to query entities: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(entities)
  }

  fn store_entity<T: Cacheable>(&self, entity: &T, cached_at: DateTime<Utc>) -> Result<()> {
    upsert_entity(&*self.conn()?, entity, &format_timestamp(cached_at))?;
    self.notify(T::entity_type(), None);
    Ok(())
  }

  fn store_entities<T: Cacheable>(&self, entities: &[T], cached_at: DateTime<Utc>) -> Result<()> {
    let cached_at = format_timestamp(cached_at);

    {
      let mut conn = self.conn()?;
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      for entity in entities {
        upsert_entity(&tx, entity, &cached_at)?;
      }
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    }

    self.notify(T::entity_type(), None);
    Ok(())
  }

  fn delete_entity<T: Cacheable>(&self, entity_key: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), entity_key],
      )
      .map_err(|e| eyre!("Failed to delete entity {}: {}", entity_key, e))?;

    self.notify(T::entity_type(), None);
    Ok(())
  }

  fn delete_entities<T: Cacheable>(&self) -> Result<()> {
    let entity_type = T::entity_type();

    {
      let mut conn = self.conn()?;
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      tx.execute(
        "DELETE FROM query_results WHERE query_hash IN
           (SELECT query_hash FROM query_cache WHERE entity_type = ?)",
        params![entity_type],
      )
      .map_err(|e| eyre!("Failed to delete query results: {}", e))?;
      tx.execute(
        "DELETE FROM query_cache WHERE entity_type = ?",
        params![entity_type],
      )
      .map_err(|e| eyre!("Failed to delete query cache: {}", e))?;
      tx.execute(
        "DELETE FROM entity_cache WHERE entity_type = ?",
        params![entity_type],
      )
      .map_err(|e| eyre!("Failed to delete entities: {}", e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    }

    self.notify(entity_type, None);
    Ok(())
  }

  fn delete_entities_by_owner<T: Cacheable>(&self, owner: &str) -> Result<usize> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ? AND owner = ?",
        params![T::entity_type(), owner],
      )
      .map_err(|e| eyre!("Failed to delete entities owned by {}: {}", owner, e))?;

    self.notify(T::entity_type(), None);
    Ok(removed)
  }

  fn search_entities<T: Cacheable>(&self, text: &str, limit: usize) -> Result<Vec<T>> {
    let conn = self.conn()?;
    let pattern = format!("%{}%", escape_like(&text.trim().to_lowercase()));

    let mut stmt = conn
      .prepare(
        "SELECT data FROM entity_cache
         WHERE entity_type = ? AND search_text LIKE ? ESCAPE '\\'
         ORDER BY updated_at DESC, entity_key
         LIMIT ?",
      )
      .map_err(|e| eyre!("Failed to prepare search query: {}", e))?;

    let entities: Vec<T> = stmt
      .query_map(params![T::entity_type(), pattern, limit], |row| {
        row.get::<_, Vec<u8>>(0)
      })
      .map_err(|e| eyre!("Failed to search entities: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(entities)
  }

  fn get_state(&self, name: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM sync_state WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read sync state {}: {}", name, e))
  }

  fn put_state(&self, name: &str, value: &str, updated_at: DateTime<Utc>) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT INTO sync_state (name, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![name, value, format_timestamp(updated_at)],
      )
      .map_err(|e| eyre!("Failed to write sync state {}: {}", name, e))?;
    Ok(())
  }

  fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
    self.changes.subscribe()
  }
}

fn upsert_entity<T: Cacheable>(conn: &Connection, entity: &T, cached_at: &str) -> Result<()> {
  let data = serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entity_cache
         (entity_type, entity_key, owner, data, updated_at, search_text, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        T::entity_type(),
        entity.cache_key(),
        entity.owner(),
        data,
        entity.updated_at(),
        entity.search_text(),
        cached_at
      ],
    )
    .map_err(|e| eyre!("Failed to store entity: {}", e))?;

  Ok(())
}

fn escape_like(text: &str) -> String {
  let mut escaped = String::with_capacity(text.len());
  for c in text.chars() {
    if matches!(c, '%' | '_' | '\\') {
      escaped.push('\\');
    }
    escaped.push(c);
  }
  escaped
}

/// Format a timestamp so that text order equals time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by `format_timestamp`.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Wait until a change relevant to the observer arrives.
///
/// A lagged receiver counts as a change: the observer re-reads and catches up.
pub(crate) async fn next_change(
  changes: &mut broadcast::Receiver<StoreChange>,
  entity_type: &str,
  query: Option<&str>,
) -> Option<StoreChange> {
  loop {
    match changes.recv().await {
      Ok(change) if change.affects(entity_type, query) => return Some(change),
      Ok(_) => continue,
      Err(broadcast::error::RecvError::Lagged(_)) => {
        return Some(StoreChange {
          entity_type: "",
          query: None,
        })
      }
      Err(broadcast::error::RecvError::Closed) => return None,
    }
  }
}

/// Stream every entity of a type: the current rows first, then again after each write.
pub fn observe_entities<S, T>(storage: Arc<S>) -> BoxStream<'static, Vec<T>>
where
  S: CacheStorage,
  T: Cacheable,
{
  // Subscribe before the first read so no write slips between them
  let changes = storage.subscribe();

  stream::unfold(
    (storage, changes, true),
    |(storage, mut changes, first)| async move {
      if !first {
        next_change(&mut changes, T::entity_type(), None).await?;
      }
      loop {
        match storage.get_entities::<T>() {
          Ok(entities) => return Some((entities, (storage, changes, false))),
          Err(e) => {
            warn!(entity_type = T::entity_type(), error = %e, "failed to read cached entities");
            next_change(&mut changes, T::entity_type(), None).await?;
          }
        }
      }
    },
  )
  .boxed()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::stable_hash;
  use serde::{Deserialize, Serialize};
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Note {
    id: String,
    owner: String,
    title: String,
    updated: String,
  }

  impl Cacheable for Note {
    fn cache_key(&self) -> String {
      format!("{}:{}", self.owner, self.id)
    }

    fn updated_at(&self) -> Option<String> {
      Some(self.updated.clone())
    }

    fn entity_type() -> &'static str {
      "note"
    }

    fn owner(&self) -> Option<&str> {
      Some(&self.owner)
    }

    fn search_text(&self) -> Option<String> {
      Some(self.title.to_lowercase())
    }
  }

  struct Key(&'static str);

  impl QueryKey for Key {
    fn cache_hash(&self) -> String {
      stable_hash(self.0)
    }

    fn description(&self) -> String {
      self.0.to_string()
    }
  }

  fn note(owner: &str, id: &str, title: &str, updated: &str) -> Note {
    Note {
      id: id.into(),
      owner: owner.into(),
      title: title.into(),
      updated: updated.into(),
    }
  }

  #[test]
  fn test_query_result_preserves_order_and_timestamp() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cached_at = parse_timestamp("2024-05-01T10:00:00.000Z").unwrap();
    let notes = vec![
      note("a", "2", "second", "2024-01-01T00:00:00.000Z"),
      note("a", "1", "first", "2024-02-01T00:00:00.000Z"),
    ];

    storage
      .store_query_result(&Key("notes:a"), &notes, cached_at)
      .unwrap();

    let cached = storage
      .get_query_result::<Note>(&Key("notes:a"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.entities, notes);
    assert_eq!(cached.cached_at, cached_at);
    assert!(storage
      .get_query_result::<Note>(&Key("notes:b"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_replacing_query_result_drops_old_membership() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage
      .store_query_result(
        &Key("q"),
        &[note("a", "1", "one", "2024-01-01T00:00:00.000Z")],
        now,
      )
      .unwrap();
    storage
      .store_query_result(
        &Key("q"),
        &[note("a", "2", "two", "2024-01-02T00:00:00.000Z")],
        now,
      )
      .unwrap();

    let cached = storage.get_query_result::<Note>(&Key("q")).unwrap().unwrap();
    assert_eq!(cached.entities.len(), 1);
    assert_eq!(cached.entities[0].id, "2");
    // Entities outlive the query result they arrived in
    assert_eq!(storage.get_entities::<Note>().unwrap().len(), 2);
  }

  #[test]
  fn test_delete_by_owner_only_touches_that_owner() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage
      .store_entities(
        &[
          note("a", "1", "one", "2024-01-01T00:00:00.000Z"),
          note("a", "2", "two", "2024-01-02T00:00:00.000Z"),
          note("b", "1", "three", "2024-01-03T00:00:00.000Z"),
        ],
        now,
      )
      .unwrap();

    let removed = storage.delete_entities_by_owner::<Note>("a").unwrap();

    assert_eq!(removed, 2);
    let remaining = storage.get_entities::<Note>().unwrap();
    assert_eq!(remaining, vec![note("b", "1", "three", "2024-01-03T00:00:00.000Z")]);
  }

  #[test]
  fn test_search_is_case_insensitive_newest_first_and_limited() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .store_entities(
        &[
          note("a", "1", "Fix login", "2024-01-01T00:00:00.000Z"),
          note("a", "2", "LOGIN page copy", "2024-03-01T00:00:00.000Z"),
          note("a", "3", "Billing", "2024-02-01T00:00:00.000Z"),
          note("a", "4", "100% login_rate", "2024-04-01T00:00:00.000Z"),
        ],
        Utc::now(),
      )
      .unwrap();

    let hits = storage.search_entities::<Note>("Login", 2).unwrap();
    let ids: Vec<_> = hits.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["4", "2"]);

    // LIKE wildcards in the query are literal
    let hits = storage.search_entities::<Note>("0% l", 10).unwrap();
    assert_eq!(hits.len(), 1);
  }

  #[test]
  fn test_state_round_trip_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_state("cursor").unwrap(), None);

    storage.put_state("cursor", "one", Utc::now()).unwrap();
    storage.put_state("cursor", "two", Utc::now()).unwrap();

    assert_eq!(storage.get_state("cursor").unwrap().as_deref(), Some("two"));
  }

  #[tokio::test]
  async fn test_observe_entities_replays_then_pushes() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .store_entity(&note("a", "1", "one", "2024-01-01T00:00:00.000Z"), Utc::now())
      .unwrap();

    let mut stream = observe_entities::<_, Note>(Arc::clone(&storage));
    assert_eq!(stream.next().await.unwrap().len(), 1);

    storage
      .store_entity(&note("a", "2", "two", "2024-01-02T00:00:00.000Z"), Utc::now())
      .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(next.len(), 2);
    assert_eq!(next[0].id, "2");
  }

  #[test]
  fn test_change_filtering() {
    let query_change = StoreChange {
      entity_type: "note",
      query: Some("abc".into()),
    };
    let entity_change = StoreChange {
      entity_type: "note",
      query: None,
    };

    assert!(query_change.affects("note", Some("abc")));
    assert!(!query_change.affects("note", Some("def")));
    assert!(query_change.affects("note", None));
    assert!(entity_change.affects("note", Some("def")));
    assert!(!entity_change.affects("activity", None));
  }
}
