//! GitLab issues over the REST v4 API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use super::http::{self, api_root, encode_component, fetch, fetch_optional};
use crate::tickets::{
  ProviderKind, SourceConfig, SourceCredentials, TicketIssue, TicketProject, TicketProvider,
};

const DEFAULT_HOST: &str = "https://gitlab.com";

#[derive(Debug, Clone)]
pub struct GitLabProvider {
  http: Option<Client>,
}

impl Default for GitLabProvider {
  fn default() -> Self {
    Self::new()
  }
}

impl GitLabProvider {
  pub fn new() -> Self {
    Self {
      http: http::client().ok(),
    }
  }

  fn get(&self, config: &SourceConfig, path: &str) -> Result<RequestBuilder> {
    let SourceCredentials::GitLab { token } = &config.credentials else {
      return Err(eyre!("Source {} has no GitLab credentials", config.id));
    };
    let http = self
      .http
      .as_ref()
      .ok_or_else(|| eyre!("GitLab HTTP client unavailable"))?;

    Ok(
      http
        .get(format!(
          "{}/api/v4{}",
          api_root(&config.base_url, DEFAULT_HOST),
          path
        ))
        .header("PRIVATE-TOKEN", token),
    )
  }

  async fn user(&self, config: &SourceConfig) -> Result<ApiUser> {
    fetch(self.get(config, "/user")?, "get GitLab user").await
  }
}

#[async_trait]
impl TicketProvider for GitLabProvider {
  fn kind(&self) -> ProviderKind {
    ProviderKind::GitLab
  }

  async fn test_connection(&self, config: &SourceConfig) -> Result<String> {
    Ok(self.user(config).await?.name)
  }

  async fn search_issues(
    &self,
    config: &SourceConfig,
    query: &str,
    max_results: usize,
  ) -> Result<Vec<TicketIssue>> {
    let query = query.trim();
    let project = config
      .default_project_key
      .as_deref()
      .map(str::trim)
      .filter(|p| !p.is_empty());

    let path = match project {
      Some(project) => format!("/projects/{}/issues", encode_component(project)),
      None => "/issues".to_string(),
    };
    let mut params = vec![
      ("order_by", "updated_at".to_string()),
      ("sort", "desc".to_string()),
      ("per_page", max_results.clamp(1, 100).to_string()),
    ];
    if !query.is_empty() {
      params.push(("search", query.to_string()));
    }
    if project.is_none() {
      // Without a project, free text searches everything visible; a bare listing is "my issues"
      let scope = if query.is_empty() { "assigned_to_me" } else { "all" };
      params.push(("scope", scope.to_string()));
    }

    let request = self.get(config, &path)?.query(&params);
    let issues: Vec<ApiIssue> = fetch(request, "search GitLab issues").await?;
    Ok(
      issues
        .into_iter()
        .map(|issue| issue.into_ticket(&config.id))
        .collect(),
    )
  }

  async fn get_issue_by_key(&self, config: &SourceConfig, key: &str) -> Result<Option<TicketIssue>> {
    let Some((project, iid)) = parse_issue_ref(key, config.default_project_key.as_deref()) else {
      return Ok(None);
    };

    let path = format!("/projects/{}/issues/{}", encode_component(&project), iid);
    let issue: Option<ApiIssue> = fetch_optional(self.get(config, &path)?, "get GitLab issue").await?;
    Ok(issue.map(|issue| issue.into_ticket(&config.id)))
  }

  async fn get_projects(&self, config: &SourceConfig) -> Result<Vec<TicketProject>> {
    let request = self.get(config, "/projects")?.query(&[
      ("membership", "true"),
      ("simple", "true"),
      ("order_by", "last_activity_at"),
      ("per_page", "100"),
    ]);
    let projects: Vec<ApiProject> = fetch(request, "list GitLab projects").await?;

    Ok(
      projects
        .into_iter()
        .map(|p| TicketProject {
          id: p.id.to_string(),
          key: p.path_with_namespace,
          name: p.name,
          source_id: config.id.clone(),
        })
        .collect(),
    )
  }

  async fn get_current_user(&self, config: &SourceConfig) -> Result<String> {
    Ok(self.user(config).await?.username)
  }
}

/// `group/app#12`, or `#12` / `12` within the default project.
fn parse_issue_ref(key: &str, default_project: Option<&str>) -> Option<(String, u64)> {
  let key = key.trim();
  let (project, iid) = match key.rsplit_once('#') {
    Some((project, iid)) if !project.is_empty() => (project.to_string(), iid),
    Some((_, iid)) => (default_project?.trim().to_string(), iid),
    None => (default_project?.trim().to_string(), key),
  };
  let iid = iid.parse().ok()?;
  (!project.is_empty()).then_some((project, iid))
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  username: String,
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiProject {
  id: u64,
  path_with_namespace: String,
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiAssignee {
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiReferences {
  full: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
  id: u64,
  iid: u64,
  title: String,
  state: String,
  web_url: String,
  updated_at: DateTime<Utc>,
  references: Option<ApiReferences>,
  #[serde(default)]
  assignees: Vec<ApiAssignee>,
  issue_type: Option<String>,
}

impl ApiIssue {
  fn into_ticket(self, source_id: &str) -> TicketIssue {
    // references.full is "group/app#12"; older servers omit it, so fall back to the web URL
    let key = match self.references {
      Some(refs) => refs.full,
      None => self
        .web_url
        .split("/-/issues/")
        .next()
        .and_then(|project_url| project_url.splitn(4, '/').nth(3))
        .map(|path| format!("{}#{}", path, self.iid))
        .unwrap_or_else(|| format!("#{}", self.iid)),
    };
    let project_key = key.split('#').next().unwrap_or_default().to_string();
    let project_name = project_key.rsplit('/').next().unwrap_or_default().to_string();

    TicketIssue {
      id: self.id.to_string(),
      key,
      summary: self.title,
      status: self.state,
      project_key,
      project_name,
      issue_type: self.issue_type.unwrap_or_else(|| "issue".to_string()),
      assignee: self.assignees.into_iter().next().map(|a| a.name),
      updated_at: self.updated_at,
      source_id: source_id.to_string(),
      provider_kind: ProviderKind::GitLab,
      web_url: Some(self.web_url),
    }
  }
}
