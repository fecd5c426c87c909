//! Provider seam: one implementation per issue tracker family.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;

use super::types::{ProviderKind, SourceConfig, TicketIssue, TicketProject};
use crate::error::{SyncError, SyncResult};
use crate::providers::{GitHubProvider, GitLabProvider, JiraProvider};

/// Remote operations every issue tracker provider offers.
///
/// The config passed in carries the base URL and credentials, so one provider
/// instance serves every source of its kind.
#[async_trait]
pub trait TicketProvider: Send + Sync {
  fn kind(&self) -> ProviderKind;

  /// Check the connection and return the authenticated user's display name.
  async fn test_connection(&self, config: &SourceConfig) -> Result<String>;

  /// Search issues. An empty query lists recently updated issues.
  async fn search_issues(
    &self,
    config: &SourceConfig,
    query: &str,
    max_results: usize,
  ) -> Result<Vec<TicketIssue>>;

  async fn get_issue_by_key(&self, config: &SourceConfig, key: &str) -> Result<Option<TicketIssue>>;

  async fn get_projects(&self, config: &SourceConfig) -> Result<Vec<TicketProject>>;

  /// Provider-side id of the authenticated user.
  async fn get_current_user(&self, config: &SourceConfig) -> Result<String>;

  async fn validate_credentials(&self, config: &SourceConfig) -> Result<bool> {
    Ok(self.get_current_user(config).await.is_ok())
  }
}

/// Providers by kind. The set of kinds is closed, so lookup is an exhaustive match.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
  jira: Option<Arc<dyn TicketProvider>>,
  github: Option<Arc<dyn TicketProvider>>,
  gitlab: Option<Arc<dyn TicketProvider>>,
}

impl ProviderRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with the built-in Jira, GitHub and GitLab providers.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register(Arc::new(JiraProvider::new()));
    registry.register(Arc::new(GitHubProvider::new()));
    registry.register(Arc::new(GitLabProvider::new()));
    registry
  }

  /// Register a provider under its own kind, replacing any previous one.
  pub fn register(&mut self, provider: Arc<dyn TicketProvider>) {
    let slot = match provider.kind() {
      ProviderKind::Jira => &mut self.jira,
      ProviderKind::GitHub => &mut self.github,
      ProviderKind::GitLab => &mut self.gitlab,
    };
    *slot = Some(provider);
  }

  pub fn get(&self, kind: ProviderKind) -> SyncResult<Arc<dyn TicketProvider>> {
    let slot = match kind {
      ProviderKind::Jira => &self.jira,
      ProviderKind::GitHub => &self.github,
      ProviderKind::GitLab => &self.gitlab,
    };
    slot
      .clone()
      .ok_or_else(|| SyncError::configuration(format!("no provider registered for {}", kind)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeProvider;

  #[test]
  fn test_lookup_by_kind() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(FakeProvider::new(ProviderKind::GitLab)));

    assert_eq!(
      registry.get(ProviderKind::GitLab).unwrap().kind(),
      ProviderKind::GitLab
    );
    let err = registry.get(ProviderKind::Jira).err().unwrap();
    assert!(err.is_configuration());
    assert_eq!(
      err.to_string(),
      "configuration error: no provider registered for jira"
    );
  }

  #[test]
  fn test_defaults_cover_every_kind() {
    let registry = ProviderRegistry::with_defaults();
    for kind in [ProviderKind::Jira, ProviderKind::GitHub, ProviderKind::GitLab] {
      assert_eq!(registry.get(kind).unwrap().kind(), kind);
    }
  }
}
