use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tracksync::cache::SqliteStorage;
use tracksync::clock::{Clock, SystemClock};
use tracksync::config::Config;
use tracksync::sync::{SourceSyncScheduler, SyncScheduler, SyncSettings, SyncTask, TimeTrackingSync};
use tracksync::tickets::{ProviderRegistry, SourceConfigs, TicketRepository};
use tracksync::timetracking::{KimaiClient, TimeTrackingRepository};

#[derive(Parser, Debug)]
#[command(name = "tracksync")]
#[command(about = "Keep a local cache of tickets and timesheets in sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tracksync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Refresh everything once and exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = tracksync::logging::init(&config.logging)?;

  let storage = Arc::new(match &config.cache.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  });
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);

  let configs = Arc::new(SourceConfigs::new(config.source_configs()?)?);
  let tickets = Arc::new(TicketRepository::new(
    Arc::clone(&storage),
    Arc::new(ProviderRegistry::with_defaults()),
    configs,
    Arc::clone(&clock),
  ));

  let timetracking = match config.kimai_settings()? {
    Some(settings) => Some(Arc::new(TimeTrackingSync::new(
      Arc::new(TimeTrackingRepository::new(
        Arc::clone(&storage),
        Arc::new(KimaiClient::new(settings)?),
        Arc::clone(&clock),
      )),
      config.sync.timesheet_page_size,
    ))),
    None => {
      info!("No time tracking configured; syncing ticket sources only");
      None
    }
  };

  if args.once {
    for refresh in tickets.refresh_all_sources().await {
      match refresh.result {
        Ok(count) => info!(source_id = %refresh.source_id, count, "Source refreshed"),
        Err(e) => warn!(source_id = %refresh.source_id, error = %e, "Source refresh failed"),
      }
    }
    if let Some(task) = &timetracking {
      task.sync().await?;
      info!("Time tracking refreshed");
    }
    return Ok(());
  }

  let sources = SourceSyncScheduler::new(Arc::clone(&tickets));
  sources.start();

  let settings = Arc::new(SyncSettings::new(config.sync.enabled, config.sync.interval()));
  let scheduler = timetracking.map(|task| {
    let scheduler = SyncScheduler::new(task, settings);
    scheduler.start();
    scheduler
  });

  info!("Sync running; press Ctrl-C to stop");
  tokio::signal::ctrl_c().await?;

  info!("Shutting down");
  if let Some(scheduler) = &scheduler {
    scheduler.stop();
  }
  sources.stop().await;

  Ok(())
}
