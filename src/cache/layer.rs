//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::storage::{next_change, CacheStorage, CachedQueryResult, SqliteStorage, StoreChange};
use super::traits::{CacheResult, Cacheable, QueryKey};
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};

/// A boxed future for one remote fetch of the whole collection
type FetchFuture<T> = BoxFuture<'static, SyncResult<Vec<T>>>;

/// A factory function that creates fetch futures
type FetcherFn<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

/// A fetch in progress, joinable by every concurrent reader
type SharedFetch<T> = Shared<FetchFuture<T>>;

/// Read-through / write-through cache for one logical collection.
///
/// The collection lives in local storage under a single query key. Readers get
/// whatever is stored right away; a missing (or, with a stale time, expired)
/// value triggers one remote fetch whose result is written back to storage.
/// Concurrent fetch requests for the key collapse into a single remote call.
pub struct EntityCache<T: Cacheable, S: CacheStorage = SqliteStorage> {
  storage: Arc<S>,
  key: Arc<dyn QueryKey>,
  fetcher: FetcherFn<T>,
  clock: Arc<dyn Clock>,
  /// How long before cached data is considered stale. None never expires.
  stale_time: Option<Duration>,
  flight: Arc<Mutex<Option<SharedFetch<T>>>>,
  liveness: Arc<Liveness>,
}

/// Decides whether a finished fetch may still write its result.
#[derive(Debug, Default)]
struct Liveness {
  state: Mutex<LivenessState>,
}

#[derive(Debug, Default)]
struct LivenessState {
  generation: u64,
  closed: bool,
}

impl Liveness {
  fn lock(&self) -> MutexGuard<'_, LivenessState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn next_generation(&self) -> u64 {
    let mut state = self.lock();
    state.generation += 1;
    state.generation
  }
}

impl<T: Cacheable, S: CacheStorage> EntityCache<T, S> {
  /// Create a cache for `key`, filled by `fetcher`.
  pub fn new<K, F, Fut>(storage: Arc<S>, key: K, clock: Arc<dyn Clock>, fetcher: F) -> Self
  where
    K: QueryKey + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Vec<T>>> + Send + 'static,
  {
    Self {
      storage,
      key: Arc::new(key),
      fetcher: Arc::new(move || fetcher().boxed()),
      clock,
      stale_time: None,
      flight: Arc::new(Mutex::new(None)),
      liveness: Arc::new(Liveness::default()),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn description(&self) -> String {
    self.key.description()
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    match self.stale_time {
      Some(stale_time) => self.clock.now() - cached_at > stale_time,
      None => false,
    }
  }

  fn cached(&self) -> SyncResult<Option<CachedQueryResult<T>>> {
    self
      .storage
      .get_query_result::<T>(&*self.key)
      .map_err(SyncError::storage)
  }

  /// Join the fetch in progress, or start one.
  ///
  /// With `force`, always start a new fetch; any older one still running
  /// loses its right to write.
  fn start_or_join(&self, force: bool) -> SharedFetch<T> {
    let mut flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);

    if !force {
      if let Some(fetch) = flight.as_ref() {
        if fetch.peek().is_none() {
          return fetch.clone();
        }
      }
    }

    let generation = self.liveness.next_generation();
    let fetch = self.fetch_and_store(generation).boxed().shared();
    *flight = Some(fetch.clone());
    fetch
  }

  fn fetch_and_store(&self, generation: u64) -> impl Future<Output = SyncResult<Vec<T>>> + Send {
    let request = (self.fetcher)();
    let storage = Arc::clone(&self.storage);
    let key = Arc::clone(&self.key);
    let clock = Arc::clone(&self.clock);
    let liveness = Arc::clone(&self.liveness);

    async move {
      let data = request.await?;

      // Held across the write so close() cannot interleave with it
      let state = liveness.lock();
      if state.closed || state.generation != generation {
        debug!(key = %key.description(), "discarding superseded fetch result");
        return Ok(data);
      }
      storage
        .store_query_result(&*key, &data, clock.now())
        .map_err(SyncError::storage)?;
      drop(state);

      debug!(key = %key.description(), count = data.len(), "cache refreshed from remote");
      Ok(data)
    }
  }

  /// Fetch in the background, keeping the cached value if the remote fails.
  fn refresh_in_background(&self) {
    if self.is_closed() {
      return;
    }
    let fetch = self.start_or_join(false);
    let description = self.key.description();
    tokio::spawn(async move {
      match fetch.await {
        Ok(_) => {}
        Err(SyncError::Cancelled) => debug!(key = %description, "background refresh cancelled"),
        Err(e) => warn!(key = %description, error = %e, "background refresh failed; serving cached data"),
      }
    });
  }

  /// Initial value for a reader of an empty cache.
  async fn first_fetch(&self, changes: &mut broadcast::Receiver<StoreChange>) -> Vec<T> {
    if self.is_closed() {
      return Vec::new();
    }
    match self.start_or_join(false).await {
      Ok(data) => {
        // Skip the notification for the write just awaited
        *changes = changes.resubscribe();
        match self.cached() {
          Ok(Some(cached)) => cached.entities,
          _ => data,
        }
      }
      Err(SyncError::Cancelled) => {
        debug!(key = %self.key.description(), "initial fetch cancelled");
        Vec::new()
      }
      Err(e) => {
        warn!(key = %self.key.description(), error = %e, "initial fetch failed; nothing cached");
        Vec::new()
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return stale cache (offline mode)
  /// 4. Update cache with new data
  pub async fn get(&self) -> SyncResult<CacheResult<Vec<T>>> {
    match self.cached()? {
      Some(cached) if !self.is_stale(cached.cached_at) => Ok(CacheResult::from_cache(
        cached.entities,
        cached.cached_at,
        false,
      )),
      Some(cached) => match self.start_or_join(false).await {
        Ok(data) => Ok(CacheResult::from_network(data)),
        Err(e) => {
          debug!(key = %self.key.description(), error = %e, "fetch failed; serving stale cache");
          Ok(CacheResult::offline(cached.entities, cached.cached_at))
        }
      },
      None => self
        .start_or_join(false)
        .await
        .map(CacheResult::from_network),
    }
  }

  /// Continuous read: the cached value right away (if any), then every write.
  ///
  /// Never fails. An expired value is served at once and refreshed in the
  /// background; if that fails readers keep what is cached. With nothing
  /// cached the first item waits for a fetch, and is empty if it fails.
  /// When the value is cleared the stream yields an empty collection.
  pub fn read(&self) -> BoxStream<'static, Vec<T>> {
    // Subscribe before the first read so no write slips between them
    let changes = self.storage.subscribe();
    let query = self.key.cache_hash();

    stream::unfold(
      (self.clone(), changes, query, true),
      |(cache, mut changes, query, first)| async move {
        if first {
          match cache.cached() {
            Ok(Some(cached)) => {
              if cache.is_stale(cached.cached_at) {
                cache.refresh_in_background();
              }
              return Some((cached.entities, (cache, changes, query, false)));
            }
            Ok(None) => {
              let initial = cache.first_fetch(&mut changes).await;
              return Some((initial, (cache, changes, query, false)));
            }
            Err(e) => warn!(key = %cache.key.description(), error = %e, "failed to read cache"),
          }
        }

        loop {
          let change = next_change(&mut changes, T::entity_type(), Some(&query)).await?;
          match cache.cached() {
            Ok(Some(cached)) => return Some((cached.entities, (cache, changes, query, false))),
            Ok(None) if change.query.as_deref() == Some(query.as_str()) => {
              return Some((Vec::new(), (cache, changes, query, false)))
            }
            Ok(None) => continue,
            Err(e) => warn!(key = %cache.key.description(), error = %e, "failed to read cache"),
          }
        }
      },
    )
    .boxed()
  }

  /// Clear the cached value, then fetch once and write the result back.
  ///
  /// Completes once the write lands. A failed fetch leaves the cache empty and
  /// the error goes to the caller; passive readers are unaffected.
  pub async fn invalidate(&self) -> SyncResult<Vec<T>> {
    self
      .storage
      .delete_query_result::<T>(&*self.key)
      .map_err(SyncError::storage)?;
    self.start_or_join(true).await
  }

  /// Retire this instance: results of fetches still in flight are discarded.
  pub fn close(&self) {
    {
      let mut state = self.liveness.lock();
      state.closed = true;
      state.generation += 1;
    }
    self
      .flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
  }

  pub fn is_closed(&self) -> bool {
    self.liveness.lock().closed
  }
}

impl<T: Cacheable, S: CacheStorage> Clone for EntityCache<T, S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      key: Arc::clone(&self.key),
      fetcher: Arc::clone(&self.fetcher),
      clock: Arc::clone(&self.clock),
      stale_time: self.stale_time,
      flight: Arc::clone(&self.flight),
      liveness: Arc::clone(&self.liveness),
    }
  }
}
