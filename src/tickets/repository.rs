//! Aggregation over every configured ticket source.

use futures::future::join_all;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::cache::TicketQueryKey;
use super::provider::ProviderRegistry;
use super::source_cache::TicketSourceCache;
use super::sources::SourceConfigs;
use super::types::{SourceConfig, TicketIssue, TicketProject};
use crate::cache::{observe_entities, CacheResult, CacheStorage, SqliteStorage};
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};

/// Outcome of refreshing one source as part of `refresh_all_sources`.
#[derive(Debug, Clone)]
pub struct SourceRefresh {
  pub source_id: String,
  /// Number of issues fetched
  pub result: SyncResult<usize>,
}

/// Ticket reads and refreshes across all sources.
///
/// Owns the per-source caches, created on first use and dropped when their
/// source is cleared or deleted.
pub struct TicketRepository {
  storage: Arc<SqliteStorage>,
  registry: Arc<ProviderRegistry>,
  configs: Arc<SourceConfigs>,
  clock: Arc<dyn Clock>,
  caches: Mutex<HashMap<String, TicketSourceCache>>,
}

impl TicketRepository {
  pub fn new(
    storage: Arc<SqliteStorage>,
    registry: Arc<ProviderRegistry>,
    configs: Arc<SourceConfigs>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      storage,
      registry,
      configs,
      clock,
      caches: Mutex::new(HashMap::new()),
    }
  }

  pub fn configs(&self) -> Arc<SourceConfigs> {
    Arc::clone(&self.configs)
  }

  fn caches(&self) -> MutexGuard<'_, HashMap<String, TicketSourceCache>> {
    self.caches.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// The cache instance for a source, rebuilt when its config changed.
  fn cache_for(&self, config: &SourceConfig) -> SyncResult<TicketSourceCache> {
    config.validate()?;
    self.registry.get(config.provider_kind)?;

    let mut caches = self.caches();
    if let Some(existing) = caches.get(&config.id) {
      if existing.config() == config {
        return Ok(existing.clone());
      }
      debug!(source_id = %config.id, "source config changed; rebuilding its cache");
      existing.close();
    }

    let cache = TicketSourceCache::new(
      config.clone(),
      Arc::clone(&self.storage),
      Arc::clone(&self.registry),
      Arc::clone(&self.clock),
    );
    caches.insert(config.id.clone(), cache.clone());
    Ok(cache)
  }

  /// Everything ever cached, for any source, following every write.
  pub fn get_all_issues(&self) -> BoxStream<'static, Vec<TicketIssue>> {
    observe_entities::<_, TicketIssue>(Arc::clone(&self.storage))
  }

  /// One source's cached page as a stream, refreshed when it expires.
  pub fn observe_source(
    &self,
    config: &SourceConfig,
  ) -> SyncResult<BoxStream<'static, Vec<TicketIssue>>> {
    Ok(self.cache_for(config)?.read())
  }

  /// One source's issues, from cache while fresh.
  pub async fn issues_for(&self, config: &SourceConfig) -> SyncResult<CacheResult<Vec<TicketIssue>>> {
    self.cache_for(config)?.get().await
  }

  /// Search every enabled source concurrently.
  ///
  /// A source whose search fails contributes nothing. Results are deduplicated
  /// by (source, issue id), newest first, capped at `limit`.
  pub async fn search_all_sources(&self, query: &str, limit: usize) -> SyncResult<Vec<TicketIssue>> {
    let mut searches = JoinSet::new();
    for config in self.configs.enabled() {
      let registry = Arc::clone(&self.registry);
      let query = query.to_string();
      searches.spawn(async move { search_source(&registry, &config, &query, limit).await });
    }

    let mut found = Vec::new();
    while let Some(joined) = searches.join_next().await {
      found.extend(joined?);
    }

    Ok(merge_results(found, limit))
  }

  /// Local store first; only when nothing matches locally, search remotely and cache the hits.
  pub async fn search_with_fallback(&self, query: &str, limit: usize) -> SyncResult<Vec<TicketIssue>> {
    let local = self
      .storage
      .search_entities::<TicketIssue>(query, limit)
      .map_err(SyncError::storage)?;
    if !local.is_empty() {
      debug!(query, count = local.len(), "ticket search served locally");
      return Ok(local);
    }

    let remote = self.search_all_sources(query, limit).await?;
    if !remote.is_empty() {
      self
        .storage
        .store_entities(&remote, self.clock.now())
        .map_err(SyncError::storage)?;
    }
    Ok(remote)
  }

  /// Discard a source's cached page and fetch it once, waiting for the outcome.
  pub async fn refresh_source(&self, config: &SourceConfig) -> SyncResult<Vec<TicketIssue>> {
    self.cache_for(config)?.refresh().await
  }

  /// Refresh every enabled source concurrently; one failure does not stop the rest.
  pub async fn refresh_all_sources(&self) -> Vec<SourceRefresh> {
    let refreshes = self.configs.enabled().into_iter().map(|config| async move {
      let result = self.refresh_source(&config).await.map(|issues| issues.len());
      if let Err(e) = &result {
        warn!(source_id = %config.id, error = %e, "source refresh failed");
      }
      SourceRefresh {
        source_id: config.id,
        result,
      }
    });

    join_all(refreshes).await
  }

  /// Forget a source's cache instance and every issue stored for it.
  pub fn clear_source(&self, source_id: &str) -> SyncResult<()> {
    if let Some(cache) = self.caches().remove(source_id) {
      cache.close();
    }

    let key = TicketQueryKey::Source {
      source_id: source_id.to_string(),
    };
    self
      .storage
      .delete_query_result::<TicketIssue>(&key)
      .map_err(SyncError::storage)?;
    let removed = self
      .storage
      .delete_entities_by_owner::<TicketIssue>(source_id)
      .map_err(SyncError::storage)?;

    info!(source_id, removed, "cleared cached issues for source");
    Ok(())
  }

  /// Remove a source config and everything cached for it.
  pub fn delete_config(&self, source_id: &str) -> SyncResult<Option<SourceConfig>> {
    let removed = self.configs.remove(source_id);
    self.clear_source(source_id)?;
    Ok(removed)
  }

  /// Look an issue up remotely, caching it; falls back to the local copy when offline.
  pub async fn get_issue_by_key(
    &self,
    config: &SourceConfig,
    key: &str,
  ) -> SyncResult<Option<TicketIssue>> {
    let provider = self.registry.get(config.provider_kind)?;

    match provider.get_issue_by_key(config, key).await {
      Ok(Some(issue)) => {
        self
          .storage
          .store_entity(&issue, self.clock.now())
          .map_err(SyncError::storage)?;
        Ok(Some(issue))
      }
      Ok(None) => Ok(None),
      Err(e) => {
        let local = self
          .storage
          .search_entities::<TicketIssue>(key, LOCAL_KEY_LOOKUP_LIMIT)
          .map_err(SyncError::storage)?
          .into_iter()
          .find(|issue| issue.source_id == config.id && issue.key.eq_ignore_ascii_case(key));
        match local {
          Some(issue) => {
            debug!(source_id = %config.id, key, error = %e, "issue lookup failed; using cached copy");
            Ok(Some(issue))
          }
          None => Err(SyncError::network(e)),
        }
      }
    }
  }

  pub async fn get_projects(&self, config: &SourceConfig) -> SyncResult<Vec<TicketProject>> {
    let provider = self.registry.get(config.provider_kind)?;
    provider
      .get_projects(config)
      .await
      .map_err(SyncError::network)
  }

  /// Display name of the authenticated user.
  pub async fn test_connection(&self, config: &SourceConfig) -> SyncResult<String> {
    let provider = self.registry.get(config.provider_kind)?;
    provider
      .test_connection(config)
      .await
      .map_err(SyncError::network)
  }

  pub async fn get_current_user(&self, config: &SourceConfig) -> SyncResult<String> {
    let provider = self.registry.get(config.provider_kind)?;
    provider
      .get_current_user(config)
      .await
      .map_err(SyncError::network)
  }

  pub async fn validate_credentials(&self, config: &SourceConfig) -> SyncResult<bool> {
    let provider = self.registry.get(config.provider_kind)?;
    provider
      .validate_credentials(config)
      .await
      .map_err(SyncError::network)
  }
}

const LOCAL_KEY_LOOKUP_LIMIT: usize = 20;

async fn search_source(
  registry: &ProviderRegistry,
  config: &SourceConfig,
  query: &str,
  limit: usize,
) -> Vec<TicketIssue> {
  let provider = match registry.get(config.provider_kind) {
    Ok(provider) => provider,
    Err(e) => {
      warn!(source_id = %config.id, error = %e, "skipping source in search");
      return Vec::new();
    }
  };

  match provider.search_issues(config, query, limit).await {
    Ok(issues) => issues,
    Err(e) => {
      warn!(source_id = %config.id, error = %e, "ticket search failed; skipping source");
      Vec::new()
    }
  }
}

/// Deduplicate by (source, issue id), newest first, at most `limit`.
fn merge_results(issues: Vec<TicketIssue>, limit: usize) -> Vec<TicketIssue> {
  let mut seen = HashSet::new();
  let mut merged: Vec<TicketIssue> = issues
    .into_iter()
    .filter(|issue| seen.insert((issue.source_id.clone(), issue.id.clone())))
    .collect();

  merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
  merged.truncate(limit);
  merged
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::testing::{issue, source_config, FakeProvider, ManualClock};
  use crate::tickets::types::ProviderKind;
  use chrono::Duration;
  use futures::StreamExt;

  struct Fixture {
    repository: TicketRepository,
    storage: Arc<SqliteStorage>,
    jira: Arc<FakeProvider>,
    gitlab: Arc<FakeProvider>,
    clock: Arc<ManualClock>,
  }

  fn fixture(configs: Vec<SourceConfig>) -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let jira = Arc::new(FakeProvider::new(ProviderKind::Jira));
    let gitlab = Arc::new(FakeProvider::new(ProviderKind::GitLab));
    let mut registry = ProviderRegistry::new();
    registry.register(jira.clone());
    registry.register(gitlab.clone());
    let clock = Arc::new(ManualClock::default());

    let repository = TicketRepository::new(
      Arc::clone(&storage),
      Arc::new(registry),
      Arc::new(SourceConfigs::new(configs).unwrap()),
      clock.clone(),
    );

    Fixture {
      repository,
      storage,
      jira,
      gitlab,
      clock,
    }
  }

  #[tokio::test]
  async fn test_search_dedups_within_a_source_only() {
    let fx = fixture(vec![
      source_config("a", ProviderKind::Jira, 5, true),
      source_config("b", ProviderKind::GitLab, 5, true),
    ]);
    let dup = issue("a", "1", "ABC-1", "Login bug", 10);
    fx.jira.set_issues("a", vec![dup.clone(), dup.clone()]);
    // Same issue id, different source: not a duplicate
    fx.gitlab.set_issues("b", vec![issue("b", "1", "grp/app#1", "Login page", 5)]);

    let results = fx.repository.search_all_sources("login", 10).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].source_id, "b");
    assert_eq!(results[1].source_id, "a");
  }

  #[tokio::test]
  async fn test_search_sorts_newest_first_and_truncates() {
    let fx = fixture(vec![source_config("a", ProviderKind::Jira, 5, true)]);
    fx.jira.set_issues(
      "a",
      vec![
        issue("a", "1", "ABC-1", "old", 300),
        issue("a", "2", "ABC-2", "newest", 1),
        issue("a", "3", "ABC-3", "middle", 60),
      ],
    );

    let results = fx.repository.search_all_sources("", 2).await.unwrap();

    let keys: Vec<_> = results.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, vec!["ABC-2", "ABC-3"]);
  }

  #[tokio::test]
  async fn test_failing_source_degrades_to_empty() {
    let fx = fixture(vec![
      source_config("a", ProviderKind::Jira, 5, true),
      source_config("b", ProviderKind::GitLab, 5, true),
      // No GitHub provider is registered
      source_config("c", ProviderKind::GitHub, 5, true),
    ]);
    fx.jira.fail_source("a");
    fx.gitlab.set_issues("b", vec![issue("b", "9", "grp/app#9", "Works", 5)]);

    let results = fx.repository.search_all_sources("", 10).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "9");
  }

  #[tokio::test]
  async fn test_disabled_sources_are_not_searched() {
    let fx = fixture(vec![
      source_config("a", ProviderKind::Jira, 5, true),
      source_config("b", ProviderKind::GitLab, 5, false),
    ]);
    fx.gitlab.set_issues("b", vec![issue("b", "1", "grp/app#1", "Hidden", 5)]);

    let results = fx.repository.search_all_sources("", 10).await.unwrap();

    assert!(results.is_empty());
    assert_eq!(fx.gitlab.search_count("b"), 0);
  }

  #[tokio::test]
  async fn test_fallback_hits_local_store_without_network() {
    let fx = fixture(vec![source_config("a", ProviderKind::Jira, 5, true)]);
    fx.storage
      .store_entity(&issue("a", "1", "ABC-1", "Export x report", 5), fx.clock.now())
      .unwrap();

    let results = fx.repository.search_with_fallback("x", 10).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(fx.jira.total_searches(), 0);
  }

  #[tokio::test]
  async fn test_fallback_searches_remote_once_and_caches() {
    let fx = fixture(vec![source_config("a", ProviderKind::Jira, 5, true)]);
    fx.jira.set_issues("a", vec![issue("a", "1", "ABC-1", "Export x report", 5)]);

    let results = fx.repository.search_with_fallback("x", 10).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(fx.jira.total_searches(), 1);

    // Now cached locally, so the next search stays offline
    fx.repository.search_with_fallback("x", 10).await.unwrap();
    assert_eq!(fx.jira.total_searches(), 1);
  }

  #[tokio::test]
  async fn test_per_source_expiry_is_independent() {
    let fast = source_config("fast", ProviderKind::Jira, 5, true);
    let slow = source_config("slow", ProviderKind::GitLab, 60, true);
    let fx = fixture(vec![fast.clone(), slow.clone()]);
    fx.jira.set_issues("fast", vec![issue("fast", "1", "ABC-1", "a", 5)]);
    fx.gitlab.set_issues("slow", vec![issue("slow", "1", "grp/app#1", "b", 5)]);

    fx.repository.refresh_source(&fast).await.unwrap();
    fx.repository.refresh_source(&slow).await.unwrap();
    fx.clock.advance(Duration::minutes(6));

    let fast_read = fx.repository.issues_for(&fast).await.unwrap();
    let slow_read = fx.repository.issues_for(&slow).await.unwrap();

    assert_eq!(fast_read.source, CacheSource::Network);
    assert_eq!(fx.jira.search_count("fast"), 2);
    assert_eq!(slow_read.source, CacheSource::CacheFresh);
    assert_eq!(fx.gitlab.search_count("slow"), 1);
  }

  #[tokio::test]
  async fn test_refresh_source_surfaces_failures() {
    let config = source_config("a", ProviderKind::Jira, 5, true);
    let fx = fixture(vec![config.clone()]);
    fx.jira.fail_source("a");

    let err = fx.repository.refresh_source(&config).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));

    let unregistered = source_config("gh", ProviderKind::GitHub, 5, true);
    let err = fx.repository.refresh_source(&unregistered).await.unwrap_err();
    assert!(err.is_configuration());
  }

  #[tokio::test]
  async fn test_refresh_all_isolates_failures() {
    let fx = fixture(vec![
      source_config("a", ProviderKind::Jira, 5, true),
      source_config("b", ProviderKind::GitLab, 5, true),
    ]);
    fx.jira.fail_source("a");
    fx.gitlab.set_issues("b", vec![issue("b", "1", "grp/app#1", "ok", 5)]);

    let mut outcomes = fx.repository.refresh_all_sources().await;
    outcomes.sort_by(|x, y| x.source_id.cmp(&y.source_id));

    assert!(outcomes[0].result.is_err());
    assert_eq!(outcomes[1].result.as_ref().unwrap(), &1);
  }

  #[tokio::test]
  async fn test_clear_source_removes_only_its_issues() {
    let a = source_config("a", ProviderKind::Jira, 5, true);
    let b = source_config("b", ProviderKind::GitLab, 5, true);
    let fx = fixture(vec![a.clone(), b.clone()]);
    fx.jira.set_issues("a", vec![issue("a", "1", "ABC-1", "a", 5)]);
    fx.gitlab.set_issues("b", vec![issue("b", "1", "grp/app#1", "b", 5)]);
    fx.repository.refresh_source(&a).await.unwrap();
    fx.repository.refresh_source(&b).await.unwrap();

    fx.repository.clear_source("a").unwrap();

    let mut all = fx.repository.get_all_issues();
    let remaining = all.next().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].source_id, "b");

    // The next read for the cleared source has to go back to the network
    fx.repository.issues_for(&a).await.unwrap();
    assert_eq!(fx.jira.search_count("a"), 2);
  }

  #[tokio::test]
  async fn test_delete_config_cascades() {
    let a = source_config("a", ProviderKind::Jira, 5, true);
    let fx = fixture(vec![a.clone()]);
    fx.jira.set_issues("a", vec![issue("a", "1", "ABC-1", "a", 5)]);
    fx.repository.refresh_source(&a).await.unwrap();

    let removed = fx.repository.delete_config("a").unwrap();

    assert_eq!(removed.unwrap().id, "a");
    assert!(fx.repository.configs().get("a").is_none());
    assert!(fx.storage.get_entities::<TicketIssue>().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_get_all_issues_follows_writes() {
    let a = source_config("a", ProviderKind::Jira, 5, true);
    let fx = fixture(vec![a.clone()]);
    let mut all = fx.repository.get_all_issues();
    assert!(all.next().await.unwrap().is_empty());

    fx.jira.set_issues("a", vec![issue("a", "1", "ABC-1", "a", 5)]);
    fx.repository.refresh_source(&a).await.unwrap();

    assert_eq!(all.next().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_issue_lookup_falls_back_to_cache_when_offline() {
    let a = source_config("a", ProviderKind::Jira, 5, true);
    let fx = fixture(vec![a.clone()]);
    fx.jira.set_issues("a", vec![issue("a", "1", "ABC-1", "Login", 5)]);

    let found = fx.repository.get_issue_by_key(&a, "ABC-1").await.unwrap();
    assert_eq!(found.unwrap().id, "1");

    fx.jira.fail_source("a");
    let cached = fx.repository.get_issue_by_key(&a, "ABC-1").await.unwrap();
    assert_eq!(cached.unwrap().summary, "Login");

    let err = fx.repository.get_issue_by_key(&a, "ABC-2").await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
  }

  #[tokio::test]
  async fn test_changed_interval_rebuilds_cache() {
    let mut a = source_config("a", ProviderKind::Jira, 60, true);
    let fx = fixture(vec![a.clone()]);
    fx.jira.set_issues("a", vec![issue("a", "1", "ABC-1", "a", 5)]);
    fx.repository.refresh_source(&a).await.unwrap();
    fx.clock.advance(Duration::minutes(10));

    // Fresh under the 60 minute policy
    fx.repository.issues_for(&a).await.unwrap();
    assert_eq!(fx.jira.search_count("a"), 1);

    a.sync_interval_minutes = 5;
    let read = fx.repository.issues_for(&a).await.unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(fx.jira.search_count("a"), 2);
  }

  #[test]
  fn test_merge_results_keeps_first_of_duplicates() {
    let mut newer = issue("a", "1", "ABC-1", "newer", 1);
    newer.summary = "first seen".into();
    let older = issue("a", "1", "ABC-1", "second seen", 100);

    let merged = merge_results(vec![newer, older], 10);

    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].summary, "first seen");
  }
}
