use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};

use super::api_types::{ApiMyself, ApiProject, ApiSearchResponse};
use crate::providers::http::encode_component;
use crate::tickets::{
  ProviderKind, SourceConfig, SourceCredentials, TicketIssue, TicketProject, TicketProvider,
};

/// Fields requested from the search endpoint
const ISSUE_FIELDS: &str = "summary,status,issuetype,assignee,project,updated";

/// Jira Cloud provider. Uses Basic auth with the account email and an API token.
#[derive(Debug, Default, Clone, Copy)]
pub struct JiraProvider;

impl JiraProvider {
  pub fn new() -> Self {
    Self
  }

  fn client(config: &SourceConfig) -> Result<gouqi::r#async::Jira> {
    let SourceCredentials::Jira { email, api_token } = &config.credentials else {
      return Err(eyre!("Source {} has no Jira credentials", config.id));
    };

    let credentials = gouqi::Credentials::Basic(email.clone(), api_token.clone());

    gouqi::r#async::Jira::new(&config.base_url, credentials)
      .map_err(|e| eyre!("Failed to create Jira client: {}", e))
  }

  async fn search(
    client: &gouqi::r#async::Jira,
    config: &SourceConfig,
    jql: &str,
    max_results: usize,
  ) -> Result<Vec<TicketIssue>> {
    let endpoint = format!(
      "/search/jql?jql={}&maxResults={}&fields={}",
      encode_component(jql),
      max_results,
      ISSUE_FIELDS
    );

    let response: ApiSearchResponse = client
      .get("api", &endpoint)
      .await
      .map_err(|e| eyre!("Failed to search issues: {}", e))?;

    Ok(
      response
        .issues
        .into_iter()
        .map(|issue| issue.into_ticket(&config.id, &config.base_url))
        .collect(),
    )
  }

  async fn myself(config: &SourceConfig) -> Result<ApiMyself> {
    Self::client(config)?
      .get("api", "/myself")
      .await
      .map_err(|e| eyre!("Failed to get current user: {}", e))
  }
}

#[async_trait]
impl TicketProvider for JiraProvider {
  fn kind(&self) -> ProviderKind {
    ProviderKind::Jira
  }

  async fn test_connection(&self, config: &SourceConfig) -> Result<String> {
    Ok(Self::myself(config).await?.display_name)
  }

  async fn search_issues(
    &self,
    config: &SourceConfig,
    query: &str,
    max_results: usize,
  ) -> Result<Vec<TicketIssue>> {
    let client = Self::client(config)?;
    let jql = build_jql(query, config.default_project_key.as_deref());
    Self::search(&client, config, &jql, max_results).await
  }

  async fn get_issue_by_key(&self, config: &SourceConfig, key: &str) -> Result<Option<TicketIssue>> {
    if !looks_like_issue_key(key) {
      return Ok(None);
    }
    let client = Self::client(config)?;
    let jql = format!("key = \"{}\"", key.trim().to_uppercase());
    let mut issues = Self::search(&client, config, &jql, 1).await?;
    Ok(issues.pop())
  }

  async fn get_projects(&self, config: &SourceConfig) -> Result<Vec<TicketProject>> {
    let projects: Vec<ApiProject> = Self::client(config)?
      .get("api", "/project")
      .await
      .map_err(|e| eyre!("Failed to get projects: {}", e))?;

    Ok(
      projects
        .into_iter()
        .map(|p| p.into_project(&config.id))
        .collect(),
    )
  }

  async fn get_current_user(&self, config: &SourceConfig) -> Result<String> {
    Ok(Self::myself(config).await?.account_id)
  }
}

/// Build JQL for a free-text query.
///
/// A query shaped like an issue key looks that key up directly. Otherwise the
/// text is matched within the default project, or across the user's issues
/// when neither text nor project is given.
pub fn build_jql(query: &str, default_project: Option<&str>) -> String {
  let query = query.trim();
  if looks_like_issue_key(query) {
    return format!("key = \"{}\"", query.to_uppercase());
  }

  let mut clauses = Vec::new();
  if let Some(project) = default_project.filter(|p| !p.trim().is_empty()) {
    clauses.push(format!("project = \"{}\"", escape_jql(project.trim())));
  }
  if !query.is_empty() {
    clauses.push(format!("text ~ \"{}\"", escape_jql(query)));
  }
  if clauses.is_empty() {
    clauses.push("assignee = currentUser()".to_string());
  }

  format!("{} ORDER BY updated DESC", clauses.join(" AND "))
}

/// `ABC-123` style: letters (then letters, digits or `_`), a dash, digits.
pub fn looks_like_issue_key(s: &str) -> bool {
  let Some((project, number)) = s.trim().split_once('-') else {
    return false;
  };
  project.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    && project.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    && !number.is_empty()
    && number.chars().all(|c| c.is_ascii_digit())
}

fn escape_jql(s: &str) -> String {
  s.replace('\\', "\\\\").replace('"', "\\\"")
}
