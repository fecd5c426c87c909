//! Periodic background sync driven by one enabled flag and one interval.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncResult;

/// One fetch-and-replace cycle the scheduler runs.
#[async_trait]
pub trait SyncTask: Send + Sync + 'static {
  fn name(&self) -> &str;

  /// Whether configuration and credentials are in place.
  fn is_ready(&self) -> bool {
    true
  }

  async fn sync(&self) -> SyncResult<()>;
}

/// Live scheduler settings. Changes are picked up without a restart.
#[derive(Debug)]
pub struct SyncSettings {
  enabled: watch::Sender<bool>,
  interval: watch::Sender<Duration>,
}

impl SyncSettings {
  pub fn new(enabled: bool, interval: Duration) -> Self {
    Self {
      enabled: watch::Sender::new(enabled),
      interval: watch::Sender::new(interval),
    }
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.send_if_modified(|current| {
      let changed = *current != enabled;
      *current = enabled;
      changed
    });
  }

  pub fn set_interval(&self, interval: Duration) {
    self.interval.send_replace(interval);
  }

  pub fn enabled(&self) -> bool {
    *self.enabled.borrow()
  }

  pub fn interval(&self) -> Duration {
    *self.interval.borrow()
  }

  pub fn subscribe_enabled(&self) -> watch::Receiver<bool> {
    self.enabled.subscribe()
  }

  pub fn subscribe_interval(&self) -> watch::Receiver<Duration> {
    self.interval.subscribe()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  Stopped,
  /// Watching the enabled flag, no loop running
  Monitoring,
  /// Periodic loop active
  Syncing,
}

struct Shared {
  state: watch::Sender<SchedulerState>,
  monitor: Mutex<Option<CancellationToken>>,
}

impl Shared {
  fn monitor(&self) -> MutexGuard<'_, Option<CancellationToken>> {
    self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Publish a state change, unless the monitor reporting it has been retired.
  fn publish(&self, from: &CancellationToken, state: SchedulerState) {
    let _guard = self.monitor();
    if !from.is_cancelled() {
      self.state.send_if_modified(|current| {
        let changed = *current != state;
        *current = state;
        changed
      });
    }
  }
}

/// Starts and stops a periodic loop for `task` as the enabled flag changes.
pub struct SyncScheduler<T: SyncTask> {
  task: Arc<T>,
  settings: Arc<SyncSettings>,
  shared: Arc<Shared>,
}

impl<T: SyncTask> SyncScheduler<T> {
  pub fn new(task: Arc<T>, settings: Arc<SyncSettings>) -> Self {
    Self {
      task,
      settings,
      shared: Arc::new(Shared {
        state: watch::Sender::new(SchedulerState::Stopped),
        monitor: Mutex::new(None),
      }),
    }
  }

  /// Start monitoring the enabled flag. Replaces any monitor already running.
  pub fn start(&self) {
    let cancel = CancellationToken::new();
    {
      let mut slot = self.shared.monitor();
      if let Some(previous) = slot.replace(cancel.clone()) {
        debug!(task = self.task.name(), "replacing running sync monitor");
        previous.cancel();
      }
      self.shared.state.send_replace(SchedulerState::Monitoring);
    }

    tokio::spawn(monitor(
      Arc::clone(&self.task),
      Arc::clone(&self.settings),
      Arc::clone(&self.shared),
      cancel,
    ));
  }

  /// Cancel the monitor and the loop.
  pub fn stop(&self) {
    let mut slot = self.shared.monitor();
    if let Some(cancel) = slot.take() {
      cancel.cancel();
      info!(task = self.task.name(), "sync scheduler stopped");
    }
    self.shared.state.send_replace(SchedulerState::Stopped);
  }

  /// Run one cycle right now, outside the schedule.
  pub async fn sync_now(&self) -> SyncResult<()> {
    self.task.sync().await
  }

  pub fn state(&self) -> SchedulerState {
    *self.shared.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
    self.shared.state.subscribe()
  }
}

impl<T: SyncTask> Drop for SyncScheduler<T> {
  fn drop(&mut self) {
    if let Some(cancel) = self.shared.monitor().take() {
      cancel.cancel();
    }
  }
}

async fn monitor<T: SyncTask>(
  task: Arc<T>,
  settings: Arc<SyncSettings>,
  shared: Arc<Shared>,
  cancel: CancellationToken,
) {
  let mut enabled = settings.subscribe_enabled();
  let mut running: Option<CancellationToken> = None;

  loop {
    if cancel.is_cancelled() {
      break;
    }

    let wanted = *enabled.borrow_and_update() && task.is_ready();
    match (wanted, running.is_some()) {
      (true, false) => {
        let token = cancel.child_token();
        tokio::spawn(sync_loop(
          Arc::clone(&task),
          Arc::clone(&settings),
          token.clone(),
        ));
        running = Some(token);
        info!(task = task.name(), "periodic sync started");
        shared.publish(&cancel, SchedulerState::Syncing);
      }
      (false, true) => {
        if let Some(token) = running.take() {
          token.cancel();
        }
        info!(task = task.name(), "periodic sync disabled");
        shared.publish(&cancel, SchedulerState::Monitoring);
      }
      (false, false) => {
        if *enabled.borrow() {
          debug!(task = task.name(), "sync enabled but not configured; waiting");
        }
        shared.publish(&cancel, SchedulerState::Monitoring);
      }
      (true, true) => {}
    }

    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      changed = enabled.changed() => {
        if changed.is_err() {
          break;
        }
      }
    }
  }

  if let Some(token) = running {
    token.cancel();
  }
  debug!(task = task.name(), "sync monitor exited");
}

/// Sync immediately, then once per interval. The interval is re-read every cycle.
async fn sync_loop<T: SyncTask>(task: Arc<T>, settings: Arc<SyncSettings>, cancel: CancellationToken) {
  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      result = task.sync() => match result {
        Ok(()) => debug!(task = task.name(), "sync cycle complete"),
        Err(e) if e.is_cancelled() => {
          debug!(task = task.name(), "sync cycle cancelled");
          break;
        }
        Err(e) => warn!(task = task.name(), error = %e, "sync cycle failed; retrying next interval"),
      },
    }

    let interval = settings.interval();
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      _ = tokio::time::sleep(interval) => {}
    }
  }
  debug!(task = task.name(), "sync loop stopped");
}
