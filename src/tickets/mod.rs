//! Ticket sources: configuration, providers and the per-source caches.

mod cache;
pub mod provider;
pub mod repository;
pub mod source_cache;
pub mod sources;
pub mod types;

pub use cache::TicketQueryKey;
pub use provider::{ProviderRegistry, TicketProvider};
pub use repository::{SourceRefresh, TicketRepository};
pub use source_cache::{TicketSourceCache, SOURCE_FETCH_LIMIT};
pub use sources::SourceConfigs;
pub use types::{
  ProviderKind, SourceConfig, SourceCredentials, TicketIssue, TicketProject, DEFAULT_ISSUE_FORMAT,
};
