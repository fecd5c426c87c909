//! Caching implementations for ticket types.

use crate::cache::{stable_hash, Cacheable, QueryKey};
use crate::cache::storage::format_timestamp;

use super::types::TicketIssue;

impl Cacheable for TicketIssue {
  /// Issue ids are only unique within a source
  fn cache_key(&self) -> String {
    format!("{}:{}", self.source_id, self.id)
  }

  fn updated_at(&self) -> Option<String> {
    Some(format_timestamp(self.updated_at))
  }

  fn entity_type() -> &'static str {
    "ticket_issue"
  }

  fn owner(&self) -> Option<&str> {
    Some(&self.source_id)
  }

  fn search_text(&self) -> Option<String> {
    Some(format!("{} {}", self.key, self.summary).to_lowercase())
  }
}

/// Query key types for ticket caches.
#[derive(Clone, Debug)]
pub enum TicketQueryKey {
  /// Everything last fetched for one source
  Source { source_id: String },
}

impl QueryKey for TicketQueryKey {
  fn cache_hash(&self) -> String {
    match self {
      Self::Source { source_id } => stable_hash(&format!("tickets:{}", source_id)),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Source { source_id } => format!("tickets of source {}", source_id),
    }
  }
}
