//! Fakes and fixture builders shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::clock::Clock;
use crate::tickets::provider::TicketProvider;
use crate::tickets::types::{
  ProviderKind, SourceConfig, SourceCredentials, TicketIssue, TicketProject, DEFAULT_ISSUE_FORMAT,
};
use crate::timetracking::client::TimeTrackingApi;
use crate::timetracking::types::{Activity, Customer, NewTimeEntry, Project, TimeEntry};

/// Fixed instant every fake clock starts at.
pub fn base_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
  fn default() -> Self {
    Self {
      now: Mutex::new(base_time()),
    }
  }
}

impl ManualClock {
  pub fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

pub fn source_config(id: &str, kind: ProviderKind, interval_minutes: u32, enabled: bool) -> SourceConfig {
  let credentials = match kind {
    ProviderKind::Jira => SourceCredentials::Jira {
      email: "dev@example.com".into(),
      api_token: "jira-token".into(),
    },
    ProviderKind::GitHub => SourceCredentials::GitHub {
      token: "gh-token".into(),
    },
    ProviderKind::GitLab => SourceCredentials::GitLab {
      token: "gl-token".into(),
    },
  };

  SourceConfig {
    id: id.to_string(),
    display_name: format!("Source {}", id),
    provider_kind: kind,
    enabled,
    base_url: format!("https://{}.example.com", id),
    credentials,
    sync_interval_minutes: interval_minutes,
    default_project_key: None,
    issue_format_pattern: DEFAULT_ISSUE_FORMAT.to_string(),
  }
}

/// An open issue of `source_id`, last updated `minutes_ago` before `base_time`.
pub fn issue(source_id: &str, id: &str, key: &str, summary: &str, minutes_ago: i64) -> TicketIssue {
  let project_key = key.split('-').next().unwrap_or(key).to_string();
  TicketIssue {
    id: id.to_string(),
    key: key.to_string(),
    summary: summary.to_string(),
    status: "Open".to_string(),
    project_name: format!("Project {}", project_key),
    project_key,
    issue_type: "Task".to_string(),
    assignee: None,
    updated_at: base_time() - Duration::minutes(minutes_ago),
    source_id: source_id.to_string(),
    provider_kind: ProviderKind::Jira,
    web_url: None,
  }
}

/// A finished five-minute entry that began `minutes_ago` before `base_time`.
pub fn time_entry(id: i64, minutes_ago: i64) -> TimeEntry {
  let begin = base_time() - Duration::minutes(minutes_ago);
  TimeEntry {
    id,
    project_id: 1,
    activity_id: 1,
    begin,
    end: Some(begin + Duration::minutes(5)),
    duration_seconds: Some(300),
    description: None,
    exported: false,
  }
}

#[derive(Default)]
struct FakeProviderState {
  issues: HashMap<String, Vec<TicketIssue>>,
  failing: HashSet<String>,
  searches: HashMap<String, usize>,
}

/// Provider with canned issues per source id, failure injection and call counters.
pub struct FakeProvider {
  kind: ProviderKind,
  state: Mutex<FakeProviderState>,
}

impl FakeProvider {
  pub fn new(kind: ProviderKind) -> Self {
    Self {
      kind,
      state: Mutex::new(FakeProviderState::default()),
    }
  }

  fn state(&self) -> MutexGuard<'_, FakeProviderState> {
    self.state.lock().unwrap()
  }

  pub fn set_issues(&self, source_id: &str, issues: Vec<TicketIssue>) {
    self.state().issues.insert(source_id.to_string(), issues);
  }

  /// Every call for this source fails from now on.
  pub fn fail_source(&self, source_id: &str) {
    self.state().failing.insert(source_id.to_string());
  }

  pub fn search_count(&self, source_id: &str) -> usize {
    self.state().searches.get(source_id).copied().unwrap_or(0)
  }

  pub fn total_searches(&self) -> usize {
    self.state().searches.values().sum()
  }

  fn check(&self, config: &SourceConfig) -> Result<()> {
    if self.state().failing.contains(&config.id) {
      return Err(eyre!("connection to {} refused", config.base_url));
    }
    Ok(())
  }
}

#[async_trait]
impl TicketProvider for FakeProvider {
  fn kind(&self) -> ProviderKind {
    self.kind
  }

  async fn test_connection(&self, config: &SourceConfig) -> Result<String> {
    self.check(config)?;
    Ok("Fake User".to_string())
  }

  async fn search_issues(
    &self,
    config: &SourceConfig,
    query: &str,
    max_results: usize,
  ) -> Result<Vec<TicketIssue>> {
    *self.state().searches.entry(config.id.clone()).or_default() += 1;
    self.check(config)?;

    let needle = query.trim().to_lowercase();
    let state = self.state();
    let issues = state.issues.get(&config.id).cloned().unwrap_or_default();
    Ok(
      issues
        .into_iter()
        .filter(|issue| {
          needle.is_empty()
            || issue.key.to_lowercase().contains(&needle)
            || issue.summary.to_lowercase().contains(&needle)
        })
        .take(max_results)
        .collect(),
    )
  }

  async fn get_issue_by_key(&self, config: &SourceConfig, key: &str) -> Result<Option<TicketIssue>> {
    self.check(config)?;
    let state = self.state();
    Ok(
      state
        .issues
        .get(&config.id)
        .and_then(|issues| issues.iter().find(|issue| issue.key == key).cloned()),
    )
  }

  async fn get_projects(&self, config: &SourceConfig) -> Result<Vec<TicketProject>> {
    self.check(config)?;
    let state = self.state();
    let mut seen = HashSet::new();
    Ok(
      state
        .issues
        .get(&config.id)
        .into_iter()
        .flatten()
        .filter(|issue| seen.insert(issue.project_key.clone()))
        .map(|issue| TicketProject {
          id: issue.project_key.clone(),
          key: issue.project_key.clone(),
          name: issue.project_name.clone(),
          source_id: config.id.clone(),
        })
        .collect(),
    )
  }

  async fn get_current_user(&self, config: &SourceConfig) -> Result<String> {
    self.check(config)?;
    Ok("fake-user".to_string())
  }
}

struct FakeTimeTrackingState {
  configured: bool,
  failing: bool,
  ignore_cutoff: bool,
  activities: Vec<Activity>,
  projects: Vec<Project>,
  customers: Vec<Customer>,
  timesheets: Vec<TimeEntry>,
  next_id: i64,
  activity_calls: usize,
  project_calls: usize,
  page_calls: usize,
}

/// In-memory time tracking backend. Keeps at most one running entry, like the real one.
pub struct FakeTimeTrackingApi {
  state: Mutex<FakeTimeTrackingState>,
}

impl Default for FakeTimeTrackingApi {
  fn default() -> Self {
    Self {
      state: Mutex::new(FakeTimeTrackingState {
        configured: true,
        failing: false,
        ignore_cutoff: false,
        activities: Vec::new(),
        projects: vec![Project {
          id: 1,
          name: "Internal".into(),
          customer_id: 1,
          visible: true,
        }],
        customers: vec![Customer {
          id: 1,
          name: "Acme".into(),
          visible: true,
        }],
        timesheets: Vec::new(),
        next_id: 1000,
        activity_calls: 0,
        project_calls: 0,
        page_calls: 0,
      }),
    }
  }
}

impl FakeTimeTrackingApi {
  fn state(&self) -> MutexGuard<'_, FakeTimeTrackingState> {
    self.state.lock().unwrap()
  }

  pub fn set_timesheets(&self, timesheets: Vec<TimeEntry>) {
    self.state().timesheets = timesheets;
  }

  pub fn set_activity_names(&self, names: &[&str]) {
    self.state().activities = names
      .iter()
      .zip(1..)
      .map(|(name, id)| Activity {
        id,
        name: name.to_string(),
        project_id: None,
        visible: true,
      })
      .collect();
  }

  pub fn set_configured(&self, configured: bool) {
    self.state().configured = configured;
  }

  pub fn set_failing(&self, failing: bool) {
    self.state().failing = failing;
  }

  /// Return entries regardless of the requested cutoff.
  pub fn ignore_cutoff(&self) {
    self.state().ignore_cutoff = true;
  }

  pub fn activity_calls(&self) -> usize {
    self.state().activity_calls
  }

  pub fn project_calls(&self) -> usize {
    self.state().project_calls
  }

  pub fn timesheet_page_calls(&self) -> usize {
    self.state().page_calls
  }

  fn check(&self) -> Result<()> {
    if self.state().failing {
      return Err(eyre!("time tracking server unreachable"));
    }
    Ok(())
  }
}

#[async_trait]
impl TimeTrackingApi for FakeTimeTrackingApi {
  fn is_configured(&self) -> bool {
    self.state().configured
  }

  async fn activities(&self) -> Result<Vec<Activity>> {
    self.check()?;
    let mut state = self.state();
    state.activity_calls += 1;
    Ok(state.activities.clone())
  }

  async fn projects(&self) -> Result<Vec<Project>> {
    self.check()?;
    let mut state = self.state();
    state.project_calls += 1;
    Ok(state.projects.clone())
  }

  async fn customers(&self) -> Result<Vec<Customer>> {
    self.check()?;
    Ok(self.state().customers.clone())
  }

  async fn timesheets_before(&self, before: DateTime<Utc>, size: usize) -> Result<Vec<TimeEntry>> {
    self.check()?;
    let mut state = self.state();
    state.page_calls += 1;

    let mut page: Vec<TimeEntry> = state
      .timesheets
      .iter()
      .filter(|entry| state.ignore_cutoff || entry.begin < before)
      .cloned()
      .collect();
    page.sort_by(|a, b| b.begin.cmp(&a.begin));
    page.truncate(size);
    Ok(page)
  }

  async fn active_timesheets(&self) -> Result<Vec<TimeEntry>> {
    self.check()?;
    Ok(
      self
        .state()
        .timesheets
        .iter()
        .filter(|entry| entry.is_running())
        .cloned()
        .collect(),
    )
  }

  async fn timesheet(&self, id: i64) -> Result<Option<TimeEntry>> {
    self.check()?;
    Ok(self.state().timesheets.iter().find(|entry| entry.id == id).cloned())
  }

  async fn start_timesheet(&self, entry: &NewTimeEntry) -> Result<TimeEntry> {
    self.check()?;
    let mut state = self.state();

    for running in state.timesheets.iter_mut().filter(|e| e.is_running()) {
      running.end = Some(entry.begin);
      running.duration_seconds = Some((entry.begin - running.begin).num_seconds());
    }

    state.next_id += 1;
    let started = TimeEntry {
      id: state.next_id,
      project_id: entry.project_id,
      activity_id: entry.activity_id,
      begin: entry.begin,
      end: None,
      duration_seconds: None,
      description: entry.description.clone(),
      exported: false,
    };
    state.timesheets.push(started.clone());
    Ok(started)
  }

  async fn stop_timesheet(&self, id: i64) -> Result<TimeEntry> {
    self.check()?;
    let mut state = self.state();
    let entry = state
      .timesheets
      .iter_mut()
      .find(|entry| entry.id == id)
      .ok_or_else(|| eyre!("timesheet {} not found", id))?;

    let end = entry.begin + Duration::hours(1);
    entry.end = Some(end);
    entry.duration_seconds = Some(3600);
    Ok(entry.clone())
  }
}
