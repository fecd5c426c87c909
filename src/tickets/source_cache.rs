//! Per-source ticket cache with its own expiry.

use futures::stream::BoxStream;
use std::sync::Arc;

use super::cache::TicketQueryKey;
use super::provider::ProviderRegistry;
use super::types::{SourceConfig, TicketIssue};
use crate::cache::{CacheResult, EntityCache, SqliteStorage};
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};

/// Issues pulled per source refresh.
pub const SOURCE_FETCH_LIMIT: usize = 100;

/// The cached issue list of one source.
///
/// Goes stale `sync_interval_minutes` after its last successful write, so a
/// 5-minute source and a 60-minute source refresh independently.
#[derive(Clone)]
pub struct TicketSourceCache {
  config: SourceConfig,
  cache: EntityCache<TicketIssue>,
}

impl TicketSourceCache {
  pub fn new(
    config: SourceConfig,
    storage: Arc<SqliteStorage>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let key = TicketQueryKey::Source {
      source_id: config.id.clone(),
    };
    let fetch_config = config.clone();

    let cache = EntityCache::new(storage, key, clock, move || {
      let registry = Arc::clone(&registry);
      let config = fetch_config.clone();
      async move {
        let provider = registry.get(config.provider_kind)?;
        provider
          .search_issues(&config, "", SOURCE_FETCH_LIMIT)
          .await
          .map_err(SyncError::network)
      }
    })
    .with_stale_time(config.stale_time());

    Self { config, cache }
  }

  pub fn config(&self) -> &SourceConfig {
    &self.config
  }

  pub fn read(&self) -> BoxStream<'static, Vec<TicketIssue>> {
    self.cache.read()
  }

  pub async fn get(&self) -> SyncResult<CacheResult<Vec<TicketIssue>>> {
    self.cache.get().await
  }

  /// Drop the cached page and fetch exactly once, waiting for the outcome.
  pub async fn refresh(&self) -> SyncResult<Vec<TicketIssue>> {
    self.cache.invalidate().await
  }

  pub fn close(&self) {
    self.cache.close();
  }
}
