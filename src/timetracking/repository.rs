//! Time tracking data: cached master data and timesheet history.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::TimeTrackingQueryKey;
use super::client::TimeTrackingApi;
use super::types::{Activity, Customer, NewTimeEntry, Project, TimeEntry};
use crate::cache::storage::{format_timestamp, parse_timestamp};
use crate::cache::{observe_entities, CacheStorage, Cacheable, EntityCache, SqliteStorage};
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};

/// `sync_state` row holding how far back timesheet history has been loaded
const HISTORY_WATERMARK: &str = "timesheets.history_watermark";
/// Stored in place of a watermark once the remote has no older entries
const HISTORY_DONE: &str = "done";

pub struct TimeTrackingRepository {
  storage: Arc<SqliteStorage>,
  api: Arc<dyn TimeTrackingApi>,
  clock: Arc<dyn Clock>,
  activities: EntityCache<Activity>,
  projects: EntityCache<Project>,
  customers: EntityCache<Customer>,
}

/// Remote call filling one master data collection
type MasterDataFetch<T> = fn(Arc<dyn TimeTrackingApi>) -> BoxFuture<'static, color_eyre::Result<Vec<T>>>;

fn master_data_cache<T: Cacheable>(
  storage: &Arc<SqliteStorage>,
  api: &Arc<dyn TimeTrackingApi>,
  clock: &Arc<dyn Clock>,
  key: TimeTrackingQueryKey,
  fetch: MasterDataFetch<T>,
) -> EntityCache<T> {
  let api = Arc::clone(api);
  EntityCache::new(Arc::clone(storage), key, Arc::clone(clock), move || {
    let api = Arc::clone(&api);
    async move {
      if !api.is_configured() {
        return Err(SyncError::configuration("time tracking is not configured"));
      }
      fetch(api).await.map_err(SyncError::network)
    }
  })
}

impl TimeTrackingRepository {
  pub fn new(storage: Arc<SqliteStorage>, api: Arc<dyn TimeTrackingApi>, clock: Arc<dyn Clock>) -> Self {
    let activities = master_data_cache(&storage, &api, &clock, TimeTrackingQueryKey::Activities, |api| {
      async move { api.activities().await }.boxed()
    });
    let projects = master_data_cache(&storage, &api, &clock, TimeTrackingQueryKey::Projects, |api| {
      async move { api.projects().await }.boxed()
    });
    let customers = master_data_cache(&storage, &api, &clock, TimeTrackingQueryKey::Customers, |api| {
      async move { api.customers().await }.boxed()
    });

    Self {
      storage,
      api,
      clock,
      activities,
      projects,
      customers,
    }
  }

  pub fn is_configured(&self) -> bool {
    self.api.is_configured()
  }

  pub fn get_activities(&self) -> BoxStream<'static, Vec<Activity>> {
    self.activities.read()
  }

  pub fn get_projects(&self) -> BoxStream<'static, Vec<Project>> {
    self.projects.read()
  }

  pub fn get_customers(&self) -> BoxStream<'static, Vec<Customer>> {
    self.customers.read()
  }

  pub async fn invalidate_activities(&self) -> SyncResult<Vec<Activity>> {
    self.activities.invalidate().await
  }

  pub async fn invalidate_projects(&self) -> SyncResult<Vec<Project>> {
    self.projects.invalidate().await
  }

  pub async fn invalidate_customers(&self) -> SyncResult<Vec<Customer>> {
    self.customers.invalidate().await
  }

  /// Refetch all master data concurrently. Fails if any collection fails.
  pub async fn invalidate_all(&self) -> SyncResult<()> {
    futures::try_join!(
      self.invalidate_activities(),
      self.invalidate_projects(),
      self.invalidate_customers(),
    )?;
    Ok(())
  }

  /// Every locally known time entry, newest first, following every write.
  pub fn get_timesheets(&self) -> BoxStream<'static, Vec<TimeEntry>> {
    observe_entities::<_, TimeEntry>(Arc::clone(&self.storage))
  }

  fn local_timesheets(&self) -> SyncResult<Vec<TimeEntry>> {
    self
      .storage
      .get_entities::<TimeEntry>()
      .map_err(SyncError::storage)
  }

  /// The running entry: remote when reachable (and written through), local otherwise.
  pub async fn active_timesheet(&self) -> SyncResult<Option<TimeEntry>> {
    match self.api.active_timesheets().await {
      Ok(active) => {
        self
          .storage
          .store_entities(&active, self.clock.now())
          .map_err(SyncError::storage)?;
        let current = active.into_iter().max_by_key(|entry| entry.begin);
        self
          .reconcile_running(current.as_ref().map(|entry| entry.id))
          .await;
        Ok(current)
      }
      Err(e) => {
        debug!(error = %e, "active timesheet lookup failed; using local state");
        Ok(
          self
            .local_timesheets()?
            .into_iter()
            .find(TimeEntry::is_running),
        )
      }
    }
  }

  /// Fetch one page of entries that began strictly before `before` (default: now).
  ///
  /// Returns the oldest begin in the page as the next watermark, or None once
  /// the remote has nothing older. A page size of zero is read as one.
  pub async fn load_new_timesheets(
    &self,
    before: Option<DateTime<Utc>>,
    page_size: usize,
  ) -> SyncResult<Option<DateTime<Utc>>> {
    let before = before.unwrap_or_else(|| self.clock.now());

    let page: Vec<TimeEntry> = self
      .api
      .timesheets_before(before, page_size.max(1))
      .await
      .map_err(SyncError::network)?
      .into_iter()
      .filter(|entry| entry.begin < before)
      .collect();

    let Some(oldest) = page.iter().map(|entry| entry.begin).min() else {
      debug!(before = %before, "no timesheets older than watermark");
      return Ok(None);
    };

    self
      .storage
      .store_entities(&page, self.clock.now())
      .map_err(SyncError::storage)?;
    debug!(count = page.len(), watermark = %oldest, "stored timesheet page");

    Ok(Some(oldest))
  }

  /// Load the next page of history, resuming from the persisted watermark.
  ///
  /// Once history is exhausted this returns None without calling the remote.
  pub async fn load_older_timesheets(&self, page_size: usize) -> SyncResult<Option<DateTime<Utc>>> {
    let before = match self
      .storage
      .get_state(HISTORY_WATERMARK)
      .map_err(SyncError::storage)?
    {
      Some(value) if value == HISTORY_DONE => return Ok(None),
      Some(value) => Some(parse_timestamp(&value).map_err(SyncError::storage)?),
      None => None,
    };

    let next = self.load_new_timesheets(before, page_size).await?;

    let value = match next {
      Some(watermark) => format_timestamp(watermark),
      None => {
        info!("timesheet history fully loaded");
        HISTORY_DONE.to_string()
      }
    };
    self
      .storage
      .put_state(HISTORY_WATERMARK, &value, self.clock.now())
      .map_err(SyncError::storage)?;

    Ok(next)
  }

  /// Start a timer remotely and write it through.
  pub async fn start_timesheet(&self, entry: &NewTimeEntry) -> SyncResult<TimeEntry> {
    let started = self
      .api
      .start_timesheet(entry)
      .await
      .map_err(SyncError::network)?;

    self
      .storage
      .store_entity(&started, self.clock.now())
      .map_err(SyncError::storage)?;
    info!(id = started.id, "started timesheet");

    // The remote stops any other timer; mirror that locally
    self.reconcile_running(Some(started.id)).await;
    Ok(started)
  }

  /// Stop a timer remotely and write it through.
  pub async fn stop_timesheet(&self, id: i64) -> SyncResult<TimeEntry> {
    let stopped = self
      .api
      .stop_timesheet(id)
      .await
      .map_err(SyncError::network)?;

    self
      .storage
      .store_entity(&stopped, self.clock.now())
      .map_err(SyncError::storage)?;
    info!(id, "stopped timesheet");
    Ok(stopped)
  }

  /// Re-read every locally running entry other than `keep` from the remote.
  async fn reconcile_running(&self, keep: Option<i64>) {
    let running = match self.local_timesheets() {
      Ok(entries) => entries
        .into_iter()
        .filter(|entry| entry.is_running() && Some(entry.id) != keep),
      Err(e) => {
        warn!(error = %e, "failed to read local timesheets");
        return;
      }
    };

    for entry in running {
      let result = match self.api.timesheet(entry.id).await {
        Ok(Some(remote)) => self.storage.store_entity(&remote, self.clock.now()),
        Ok(None) => self
          .storage
          .delete_entity::<TimeEntry>(&entry.cache_key()),
        Err(e) => {
          warn!(id = entry.id, error = %e, "could not reconcile running timesheet");
          continue;
        }
      };
      if let Err(e) = result {
        warn!(id = entry.id, error = %e, "failed to update local timesheet");
      }
    }
  }
}
