//! GitHub issues over the REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use super::http::{self, api_root, fetch, fetch_optional};
use crate::tickets::{
  ProviderKind, SourceConfig, SourceCredentials, TicketIssue, TicketProject, TicketProvider,
};

const DEFAULT_API: &str = "https://api.github.com";

/// GitHub (or GitHub Enterprise with `base_url` set to its `/api/v3` root).
#[derive(Debug, Clone)]
pub struct GitHubProvider {
  http: Option<Client>,
}

impl Default for GitHubProvider {
  fn default() -> Self {
    Self::new()
  }
}

impl GitHubProvider {
  pub fn new() -> Self {
    // A client that fails to build surfaces on first use
    Self {
      http: http::client().ok(),
    }
  }

  fn get(&self, config: &SourceConfig, path: &str) -> Result<RequestBuilder> {
    let SourceCredentials::GitHub { token } = &config.credentials else {
      return Err(eyre!("Source {} has no GitHub credentials", config.id));
    };
    let http = self
      .http
      .as_ref()
      .ok_or_else(|| eyre!("GitHub HTTP client unavailable"))?;

    Ok(
      http
        .get(format!("{}{}", api_root(&config.base_url, DEFAULT_API), path))
        .bearer_auth(token)
        .header("Accept", "application/vnd.github+json")
        .header("X-GitHub-Api-Version", "2022-11-28"),
    )
  }

  async fn user(&self, config: &SourceConfig) -> Result<ApiUser> {
    fetch(self.get(config, "/user")?, "get GitHub user").await
  }
}

#[async_trait]
impl TicketProvider for GitHubProvider {
  fn kind(&self) -> ProviderKind {
    ProviderKind::GitHub
  }

  async fn test_connection(&self, config: &SourceConfig) -> Result<String> {
    let user = self.user(config).await?;
    Ok(user.name.filter(|n| !n.is_empty()).unwrap_or(user.login))
  }

  async fn search_issues(
    &self,
    config: &SourceConfig,
    query: &str,
    max_results: usize,
  ) -> Result<Vec<TicketIssue>> {
    let q = search_query(query, config.default_project_key.as_deref());
    let request = self.get(config, "/search/issues")?.query(&[
      ("q", q),
      ("sort", "updated".to_string()),
      ("order", "desc".to_string()),
      ("per_page", max_results.clamp(1, 100).to_string()),
    ]);

    let response: ApiSearchResponse = fetch(request, "search GitHub issues").await?;
    Ok(
      response
        .items
        .into_iter()
        .filter(|item| item.pull_request.is_none())
        .map(|item| item.into_ticket(&config.id))
        .collect(),
    )
  }

  async fn get_issue_by_key(&self, config: &SourceConfig, key: &str) -> Result<Option<TicketIssue>> {
    let Some((repo, number)) = parse_issue_ref(key, config.default_project_key.as_deref()) else {
      return Ok(None);
    };

    let request = self.get(config, &format!("/repos/{}/issues/{}", repo, number))?;
    let issue: Option<ApiIssue> = fetch_optional(request, "get GitHub issue").await?;
    Ok(
      issue
        .filter(|item| item.pull_request.is_none())
        .map(|item| item.into_ticket(&config.id)),
    )
  }

  async fn get_projects(&self, config: &SourceConfig) -> Result<Vec<TicketProject>> {
    let request = self
      .get(config, "/user/repos")?
      .query(&[("per_page", "100"), ("sort", "updated")]);
    let repos: Vec<ApiRepo> = fetch(request, "list GitHub repositories").await?;

    Ok(
      repos
        .into_iter()
        .map(|repo| TicketProject {
          id: repo.id.to_string(),
          key: repo.full_name,
          name: repo.name,
          source_id: config.id.clone(),
        })
        .collect(),
    )
  }

  async fn get_current_user(&self, config: &SourceConfig) -> Result<String> {
    Ok(self.user(config).await?.login)
  }
}

/// GitHub search syntax for a free-text query, scoped to the default repository if any.
fn search_query(query: &str, default_repo: Option<&str>) -> String {
  let mut terms = vec!["is:issue".to_string()];
  match default_repo.map(str::trim).filter(|r| !r.is_empty()) {
    Some(repo) => terms.push(format!("repo:{}", repo)),
    None => terms.push("involves:@me".to_string()),
  }
  let query = query.trim();
  if !query.is_empty() {
    terms.push(query.to_string());
  }
  terms.join(" ")
}

/// `owner/repo#12`, or `#12` / `12` within the default repository.
fn parse_issue_ref(key: &str, default_repo: Option<&str>) -> Option<(String, u64)> {
  let key = key.trim();
  let (repo, number) = match key.rsplit_once('#') {
    Some((repo, number)) if !repo.is_empty() => (repo.to_string(), number),
    Some((_, number)) => (default_repo?.to_string(), number),
    None => (default_repo?.to_string(), key),
  };
  let number = number.parse().ok()?;
  repo.contains('/').then_some((repo, number))
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  login: String,
  name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLogin {
  login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
  id: u64,
  full_name: String,
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
  id: u64,
  number: u64,
  title: String,
  state: String,
  html_url: String,
  updated_at: DateTime<Utc>,
  repository_url: String,
  assignee: Option<ApiLogin>,
  #[serde(default)]
  labels: Vec<ApiLabel>,
  pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiSearchResponse {
  #[serde(default)]
  items: Vec<ApiIssue>,
}

impl ApiIssue {
  fn into_ticket(self, source_id: &str) -> TicketIssue {
    // repository_url ends in /repos/{owner}/{repo}
    let repo = self
      .repository_url
      .split("/repos/")
      .nth(1)
      .unwrap_or_default()
      .to_string();
    let repo_name = repo.rsplit('/').next().unwrap_or_default().to_string();

    TicketIssue {
      id: self.id.to_string(),
      key: format!("{}#{}", repo, self.number),
      summary: self.title,
      status: self.state,
      project_key: repo,
      project_name: repo_name,
      issue_type: self
        .labels
        .into_iter()
        .next()
        .map(|l| l.name)
        .unwrap_or_else(|| "issue".to_string()),
      assignee: self.assignee.map(|a| a.login),
      updated_at: self.updated_at,
      source_id: source_id.to_string(),
      provider_kind: ProviderKind::GitHub,
      web_url: Some(self.html_url),
    }
  }
}
