//! One background refresh job per enabled ticket source.
//!
//! A single monitor task owns the job map. It reconciles the map against the
//! live source list on every change and is the only code that mutates it;
//! everything else talks to it over a command channel. Each job also re-checks
//! its own source before every refresh and exits once the source is gone or
//! disabled, so a late monitor never causes a stray refresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tickets::{SourceConfig, TicketRepository};

enum Command {
  ListJobs(oneshot::Sender<Vec<String>>),
  /// Sent by a job that exited on its own
  JobFinished { source_id: String, generation: u64 },
}

struct RunningMonitor {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
  commands: mpsc::UnboundedSender<Command>,
}

pub struct SourceSyncScheduler {
  repository: Arc<TicketRepository>,
  running: Mutex<Option<RunningMonitor>>,
}

impl SourceSyncScheduler {
  pub fn new(repository: Arc<TicketRepository>) -> Self {
    Self {
      repository,
      running: Mutex::new(None),
    }
  }

  fn running(&self) -> MutexGuard<'_, Option<RunningMonitor>> {
    self.running.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start the monitor. A monitor already running is cancelled first.
  pub fn start(&self) {
    let cancel = CancellationToken::new();
    let (commands, inbox) = mpsc::unbounded_channel();
    let configs = self.repository.configs().subscribe();

    let monitor = Monitor {
      repository: Arc::clone(&self.repository),
      configs,
      commands: commands.clone(),
      inbox,
      cancel: cancel.clone(),
      jobs: HashMap::new(),
      next_generation: 0,
    };
    let handle = tokio::spawn(monitor.run());

    let previous = self.running().replace(RunningMonitor {
      cancel,
      handle,
      commands,
    });
    if let Some(previous) = previous {
      debug!("replacing running source sync monitor");
      previous.cancel.cancel();
    }
  }

  /// Cancel the monitor and every job, waiting for them to wind down.
  pub async fn stop(&self) {
    let Some(running) = self.running().take() else {
      return;
    };
    running.cancel.cancel();
    if let Err(e) = running.handle.await {
      if !e.is_cancelled() {
        warn!(error = %e, "source sync monitor panicked");
      }
    }
    info!("source sync scheduler stopped");
  }

  /// Ids of the sources that currently have a job, sorted.
  pub async fn running_jobs(&self) -> Vec<String> {
    let commands = match self.running().as_ref() {
      Some(running) => running.commands.clone(),
      None => return Vec::new(),
    };

    let (reply, answer) = oneshot::channel();
    if commands.send(Command::ListJobs(reply)).is_err() {
      return Vec::new();
    }
    answer.await.unwrap_or_default()
  }

  pub fn is_running(&self) -> bool {
    self.running().is_some()
  }
}

impl Drop for SourceSyncScheduler {
  fn drop(&mut self) {
    if let Some(running) = self.running().take() {
      running.cancel.cancel();
    }
  }
}

struct SourceJob {
  generation: u64,
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

struct Monitor {
  repository: Arc<TicketRepository>,
  configs: watch::Receiver<Vec<SourceConfig>>,
  commands: mpsc::UnboundedSender<Command>,
  inbox: mpsc::UnboundedReceiver<Command>,
  cancel: CancellationToken,
  jobs: HashMap<String, SourceJob>,
  next_generation: u64,
}

impl Monitor {
  async fn run(mut self) {
    if self.cancel.is_cancelled() {
      return;
    }
    info!("source sync monitor started");
    self.reconcile();

    loop {
      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => break,
        changed = self.configs.changed() => {
          if changed.is_err() {
            break;
          }
          self.reconcile();
        }
        Some(command) = self.inbox.recv() => self.handle(command),
      }
    }

    self.shutdown().await;
  }

  /// Stop jobs whose source is no longer enabled and start jobs for new ones.
  fn reconcile(&mut self) {
    let enabled: HashMap<String, SourceConfig> = self
      .configs
      .borrow_and_update()
      .iter()
      .filter(|config| config.enabled)
      .map(|config| (config.id.clone(), config.clone()))
      .collect();

    self.jobs.retain(|source_id, job| {
      let keep = enabled.contains_key(source_id) && !job.handle.is_finished();
      if !keep {
        job.cancel.cancel();
        info!(source_id = %source_id, "stopped source sync job");
      }
      keep
    });

    for config in enabled.into_values() {
      self.start_job(config);
    }
  }

  fn start_job(&mut self, config: SourceConfig) {
    if self.jobs.contains_key(&config.id) {
      return;
    }

    self.next_generation += 1;
    let generation = self.next_generation;
    let cancel = self.cancel.child_token();
    let job = SourceJobRunner {
      repository: Arc::clone(&self.repository),
      configs: self.configs.clone(),
      source_id: config.id.clone(),
      generation,
      cancel: cancel.clone(),
      commands: self.commands.clone(),
    };

    info!(
      source_id = %config.id,
      interval_minutes = config.sync_interval_minutes,
      "started source sync job"
    );
    let handle = tokio::spawn(job.run(config.clone()));
    self.jobs.insert(
      config.id,
      SourceJob {
        generation,
        cancel,
        handle,
      },
    );
  }

  fn handle(&mut self, command: Command) {
    match command {
      Command::ListJobs(reply) => {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort();
        let _ = reply.send(ids);
      }
      Command::JobFinished {
        source_id,
        generation,
      } => {
        let current = self.jobs.get(&source_id).map(|job| job.generation);
        if current == Some(generation) {
          self.jobs.remove(&source_id);
          debug!(source_id = %source_id, "source sync job exited on its own");
          // Re-enabled while the job was winding down
          self.reconcile();
        }
      }
    }
  }

  async fn shutdown(&mut self) {
    for (source_id, job) in self.jobs.drain() {
      job.cancel.cancel();
      if let Err(e) = job.handle.await {
        if !e.is_cancelled() {
          warn!(source_id = %source_id, error = %e, "source sync job panicked");
        }
      }
    }
    info!("source sync monitor stopped");
  }
}

struct SourceJobRunner {
  repository: Arc<TicketRepository>,
  configs: watch::Receiver<Vec<SourceConfig>>,
  source_id: String,
  generation: u64,
  cancel: CancellationToken,
  commands: mpsc::UnboundedSender<Command>,
}

impl SourceJobRunner {
  fn current_config(&self) -> Option<SourceConfig> {
    self
      .configs
      .borrow()
      .iter()
      .find(|config| config.id == self.source_id && config.enabled)
      .cloned()
  }

  /// Refresh now, then after each interval while the source stays enabled.
  async fn run(self, mut config: SourceConfig) {
    // Configuration errors are not retried until the config itself changes
    let mut blocked = false;

    loop {
      if !blocked {
        tokio::select! {
          biased;
          _ = self.cancel.cancelled() => break,
          result = self.repository.refresh_source(&config) => match result {
            Ok(issues) => debug!(source_id = %self.source_id, count = issues.len(), "source refreshed"),
            Err(e) if e.is_cancelled() => break,
            Err(e) if e.is_configuration() => {
              warn!(source_id = %self.source_id, error = %e, "source misconfigured; pausing refreshes until it changes");
              blocked = true;
            }
            Err(e) => warn!(source_id = %self.source_id, error = %e, "source refresh failed; retrying next interval"),
          },
        }
      }

      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => break,
        _ = tokio::time::sleep(config.sync_interval()) => {}
      }

      match self.current_config() {
        Some(latest) => {
          if latest != config {
            blocked = false;
          }
          config = latest;
        }
        None => {
          info!(source_id = %self.source_id, "source disabled or removed; sync job exiting");
          let _ = self.commands.send(Command::JobFinished {
            source_id: self.source_id.clone(),
            generation: self.generation,
          });
          return;
        }
      }
    }

    debug!(source_id = %self.source_id, "source sync job cancelled");
  }
}
