use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Issue tracker families a source can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  Jira,
  GitHub,
  GitLab,
}

impl fmt::Display for ProviderKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Jira => "jira",
      Self::GitHub => "github",
      Self::GitLab => "gitlab",
    };
    f.write_str(name)
  }
}

/// Provider-specific credentials. Debug output never shows secrets.
#[derive(Clone, PartialEq, Eq)]
pub enum SourceCredentials {
  /// Jira Cloud: email + API token as Basic auth
  Jira { email: String, api_token: String },
  /// Personal access token sent as a Bearer token
  GitHub { token: String },
  /// Personal access token sent as PRIVATE-TOKEN
  GitLab { token: String },
}

impl SourceCredentials {
  pub fn kind(&self) -> ProviderKind {
    match self {
      Self::Jira { .. } => ProviderKind::Jira,
      Self::GitHub { .. } => ProviderKind::GitHub,
      Self::GitLab { .. } => ProviderKind::GitLab,
    }
  }
}

impl fmt::Debug for SourceCredentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Jira { email, .. } => f
        .debug_struct("Jira")
        .field("email", email)
        .field("api_token", &"<redacted>")
        .finish(),
      Self::GitHub { .. } => f.debug_struct("GitHub").field("token", &"<redacted>").finish(),
      Self::GitLab { .. } => f.debug_struct("GitLab").field("token", &"<redacted>").finish(),
    }
  }
}

pub const DEFAULT_ISSUE_FORMAT: &str = "{key}: {summary}";

/// One configured, independently scheduled issue tracker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
  pub id: String,
  pub display_name: String,
  pub provider_kind: ProviderKind,
  pub enabled: bool,
  pub base_url: String,
  pub credentials: SourceCredentials,
  pub sync_interval_minutes: u32,
  pub default_project_key: Option<String>,
  pub issue_format_pattern: String,
}

impl SourceConfig {
  /// Check the invariants every stored config must satisfy.
  pub fn validate(&self) -> SyncResult<()> {
    if self.id.trim().is_empty() {
      return Err(SyncError::configuration("source id must not be empty"));
    }
    if self.credentials.kind() != self.provider_kind {
      return Err(SyncError::configuration(format!(
        "source {} is a {} source but has {} credentials",
        self.id,
        self.provider_kind,
        self.credentials.kind()
      )));
    }
    if self.sync_interval_minutes == 0 {
      return Err(SyncError::configuration(format!(
        "source {} must sync at least every few minutes, got an interval of 0",
        self.id
      )));
    }
    Ok(())
  }

  /// Wait between background refreshes.
  pub fn sync_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(u64::from(self.sync_interval_minutes) * 60)
  }

  /// Age after which the source's cached issues are stale.
  pub fn stale_time(&self) -> Duration {
    Duration::minutes(i64::from(self.sync_interval_minutes))
  }

  /// Render an issue with this source's format pattern, e.g. for a timesheet description.
  pub fn format_issue(&self, issue: &TicketIssue) -> String {
    let pattern = if self.issue_format_pattern.trim().is_empty() {
      DEFAULT_ISSUE_FORMAT
    } else {
      &self.issue_format_pattern
    };

    pattern
      .replace("{key}", &issue.key)
      .replace("{summary}", &issue.summary)
      .replace("{id}", &issue.id)
      .replace("{project}", &issue.project_key)
      .replace("{type}", &issue.issue_type)
      .replace("{status}", &issue.status)
  }
}

/// Issue from any provider, in one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketIssue {
  pub id: String,
  pub key: String,
  pub summary: String,
  pub status: String,
  pub project_key: String,
  pub project_name: String,
  pub issue_type: String,
  pub assignee: Option<String>,
  pub updated_at: DateTime<Utc>,
  pub source_id: String,
  pub provider_kind: ProviderKind,
  pub web_url: Option<String>,
}

/// Project (or repository) a source can file issues under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketProject {
  pub id: String,
  pub key: String,
  pub name: String,
  pub source_id: String,
}
