//! Serde-deserializable types matching Jira API responses.
//!
//! Kept apart from `TicketIssue` so deserialization can follow Jira's shape
//! while the rest of the crate only sees the unified record.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::tickets::{ProviderKind, TicketIssue, TicketProject};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiStatus {
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssueType {
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  #[serde(rename = "displayName")]
  pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiProjectRef {
  pub key: String,
  #[serde(default)]
  pub name: String,
}

// ============================================================================
// Issue search
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ApiIssueFields {
  #[serde(default)]
  pub summary: String,
  pub status: Option<ApiStatus>,
  #[serde(rename = "issuetype")]
  pub issue_type: Option<ApiIssueType>,
  pub assignee: Option<ApiUser>,
  pub project: Option<ApiProjectRef>,
  #[serde(default)]
  pub updated: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssue {
  pub id: String,
  pub key: String,
  #[serde(default)]
  pub fields: ApiIssueFields,
}

#[derive(Debug, Deserialize)]
pub struct ApiSearchResponse {
  #[serde(default)]
  pub issues: Vec<ApiIssue>,
}

// ============================================================================
// Projects and the current user
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiProject {
  pub id: String,
  pub key: String,
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiMyself {
  #[serde(rename = "accountId")]
  pub account_id: String,
  #[serde(rename = "displayName")]
  pub display_name: String,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl ApiIssue {
  pub fn into_ticket(self, source_id: &str, base_url: &str) -> TicketIssue {
    let f = self.fields;
    // The key prefix is the project key when the project field was not requested
    let (project_key, project_name) = match f.project {
      Some(p) => (p.key, p.name),
      None => {
        let key = self.key.split('-').next().unwrap_or_default().to_string();
        (key.clone(), key)
      }
    };

    TicketIssue {
      web_url: Some(format!("{}/browse/{}", base_url.trim_end_matches('/'), self.key)),
      id: self.id,
      key: self.key,
      summary: f.summary,
      status: f.status.map(|s| s.name).unwrap_or_default(),
      project_key,
      project_name,
      issue_type: f.issue_type.map(|t| t.name).unwrap_or_default(),
      assignee: f.assignee.map(|u| u.display_name),
      updated_at: parse_jira_datetime(&f.updated).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
      source_id: source_id.to_string(),
      provider_kind: ProviderKind::Jira,
    }
  }
}

impl ApiProject {
  pub fn into_project(self, source_id: &str) -> TicketProject {
    TicketProject {
      id: self.id,
      key: self.key,
      name: self.name,
      source_id: source_id.to_string(),
    }
  }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse Jira's `2024-01-15T10:30:00.000+0000` timestamps (RFC 3339 also accepted).
pub fn parse_jira_datetime(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
    .or_else(|_| DateTime::parse_from_rfc3339(s))
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}
