//! Caching implementations for time tracking types.

use crate::cache::storage::format_timestamp;
use crate::cache::{stable_hash, Cacheable, QueryKey};

use super::types::{Activity, Customer, Project, TimeEntry};

impl Cacheable for Activity {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn updated_at(&self) -> Option<String> {
    None
  }

  fn entity_type() -> &'static str {
    "activity"
  }

  fn search_text(&self) -> Option<String> {
    Some(self.name.to_lowercase())
  }
}

impl Cacheable for Project {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn updated_at(&self) -> Option<String> {
    None
  }

  fn entity_type() -> &'static str {
    "project"
  }

  fn search_text(&self) -> Option<String> {
    Some(self.name.to_lowercase())
  }
}

impl Cacheable for Customer {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn updated_at(&self) -> Option<String> {
    None
  }

  fn entity_type() -> &'static str {
    "customer"
  }

  fn search_text(&self) -> Option<String> {
    Some(self.name.to_lowercase())
  }
}

impl Cacheable for TimeEntry {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  /// Ordered by start so the newest entry comes first
  fn updated_at(&self) -> Option<String> {
    Some(format_timestamp(self.begin))
  }

  fn entity_type() -> &'static str {
    "time_entry"
  }

  fn search_text(&self) -> Option<String> {
    self.description.as_ref().map(|d| d.to_lowercase())
  }
}

/// Master data collections, each cached whole under one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeTrackingQueryKey {
  Activities,
  Projects,
  Customers,
}

impl TimeTrackingQueryKey {
  fn name(&self) -> &'static str {
    match self {
      Self::Activities => "activities",
      Self::Projects => "projects",
      Self::Customers => "customers",
    }
  }
}

impl QueryKey for TimeTrackingQueryKey {
  fn cache_hash(&self) -> String {
    stable_hash(&format!("timetracking:{}:all", self.name()))
  }

  fn description(&self) -> String {
    format!("all {}", self.name())
  }
}
