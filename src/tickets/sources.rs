//! Live, observable list of configured ticket sources.

use std::collections::HashSet;
use tokio::sync::watch;
use tracing::info;

use super::types::SourceConfig;
use crate::error::{SyncError, SyncResult};

/// The current set of source configs.
///
/// Every edit is published to subscribers, which is how the multi-source
/// scheduler learns that a source was added, toggled, edited or removed.
pub struct SourceConfigs {
  tx: watch::Sender<Vec<SourceConfig>>,
}

impl SourceConfigs {
  pub fn new(initial: Vec<SourceConfig>) -> SyncResult<Self> {
    let mut seen = HashSet::new();
    for config in &initial {
      config.validate()?;
      if !seen.insert(config.id.as_str()) {
        return Err(SyncError::configuration(format!(
          "duplicate source id {}",
          config.id
        )));
      }
    }

    let (tx, _) = watch::channel(initial);
    Ok(Self { tx })
  }

  pub fn all(&self) -> Vec<SourceConfig> {
    self.tx.borrow().clone()
  }

  pub fn enabled(&self) -> Vec<SourceConfig> {
    self
      .tx
      .borrow()
      .iter()
      .filter(|c| c.enabled)
      .cloned()
      .collect()
  }

  pub fn get(&self, id: &str) -> Option<SourceConfig> {
    self.tx.borrow().iter().find(|c| c.id == id).cloned()
  }

  /// Add a source, or replace the one with the same id.
  pub fn upsert(&self, config: SourceConfig) -> SyncResult<()> {
    config.validate()?;
    info!(source_id = %config.id, enabled = config.enabled, "source config saved");

    self.tx.send_modify(|configs| {
      match configs.iter_mut().find(|c| c.id == config.id) {
        Some(existing) => *existing = config,
        None => configs.push(config),
      }
    });
    Ok(())
  }

  pub fn remove(&self, id: &str) -> Option<SourceConfig> {
    let mut removed = None;
    self.tx.send_if_modified(|configs| {
      let position = configs.iter().position(|c| c.id == id);
      removed = position.map(|i| configs.remove(i));
      removed.is_some()
    });
    if removed.is_some() {
      info!(source_id = %id, "source config removed");
    }
    removed
  }

  pub fn set_enabled(&self, id: &str, enabled: bool) -> SyncResult<()> {
    let mut found = false;
    self.tx.send_if_modified(|configs| {
      match configs.iter_mut().find(|c| c.id == id) {
        Some(config) => {
          found = true;
          let changed = config.enabled != enabled;
          config.enabled = enabled;
          changed
        }
        None => false,
      }
    });

    if found {
      info!(source_id = %id, enabled, "source toggled");
      Ok(())
    } else {
      Err(SyncError::configuration(format!("unknown source {}", id)))
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<Vec<SourceConfig>> {
    self.tx.subscribe()
  }
}
