use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::scheduler::SyncTask;
use crate::error::SyncResult;
use crate::timetracking::TimeTrackingRepository;

pub const DEFAULT_TIMESHEET_PAGE_SIZE: usize = 50;

/// Refresh all time tracking master data, then pull the newest timesheet page.
pub struct TimeTrackingSync {
  repository: Arc<TimeTrackingRepository>,
  page_size: usize,
}

impl TimeTrackingSync {
  pub fn new(repository: Arc<TimeTrackingRepository>, page_size: usize) -> Self {
    Self {
      repository,
      page_size: page_size.max(1),
    }
  }
}

#[async_trait]
impl SyncTask for TimeTrackingSync {
  fn name(&self) -> &str {
    "timetracking"
  }

  fn is_ready(&self) -> bool {
    self.repository.is_configured()
  }

  async fn sync(&self) -> SyncResult<()> {
    self.repository.invalidate_all().await?;
    let watermark = self.repository.load_new_timesheets(None, self.page_size).await?;
    debug!(watermark = ?watermark, "time tracking sync complete");
    Ok(())
  }
}
