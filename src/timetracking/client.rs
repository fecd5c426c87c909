//! Time tracking backend seam and the Kimai REST client.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::warn;

use super::types::{Activity, Customer, NewTimeEntry, Project, TimeEntry};

/// Request/response calls against the time tracking backend.
#[async_trait]
pub trait TimeTrackingApi: Send + Sync {
  /// Whether a server and credentials are set up at all.
  fn is_configured(&self) -> bool;

  async fn activities(&self) -> Result<Vec<Activity>>;

  async fn projects(&self) -> Result<Vec<Project>>;

  async fn customers(&self) -> Result<Vec<Customer>>;

  /// Up to `size` entries that began strictly before `before`, newest first.
  async fn timesheets_before(&self, before: DateTime<Utc>, size: usize) -> Result<Vec<TimeEntry>>;

  async fn active_timesheets(&self) -> Result<Vec<TimeEntry>>;

  async fn timesheet(&self, id: i64) -> Result<Option<TimeEntry>>;

  async fn start_timesheet(&self, entry: &NewTimeEntry) -> Result<TimeEntry>;

  async fn stop_timesheet(&self, id: i64) -> Result<TimeEntry>;
}

/// How to reach a Kimai server.
#[derive(Clone)]
pub struct KimaiSettings {
  pub base_url: String,
  /// Set for the legacy X-AUTH-USER / X-AUTH-TOKEN scheme; None uses a Bearer token
  pub username: Option<String>,
  pub token: String,
  /// Zone Kimai reads local datetimes in; looked up from the user's profile when None
  pub timezone: Option<Tz>,
}

impl std::fmt::Debug for KimaiSettings {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("KimaiSettings")
      .field("base_url", &self.base_url)
      .field("username", &self.username)
      .field("token", &"<redacted>")
      .field("timezone", &self.timezone)
      .finish()
  }
}

#[derive(Clone)]
pub struct KimaiClient {
  http: Client,
  settings: KimaiSettings,
  timezone: OnceCell<Tz>,
}

impl KimaiClient {
  pub fn new(settings: KimaiSettings) -> Result<Self> {
    let http = Client::builder()
      .user_agent(concat!("tracksync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create Kimai client: {}", e))?;

    Ok(Self {
      http,
      settings,
      timezone: OnceCell::new(),
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}/api{}", self.settings.base_url.trim_end_matches('/'), path)
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.settings.username {
      Some(user) => request
        .header("X-AUTH-USER", user)
        .header("X-AUTH-TOKEN", &self.settings.token),
      None => request.bearer_auth(&self.settings.token),
    }
  }

  /// The user's timezone, resolved once.
  async fn timezone(&self) -> Result<Tz> {
    self
      .timezone
      .get_or_try_init(|| async {
        match self.settings.timezone {
          Some(tz) => Ok(tz),
          None => self.profile_timezone().await,
        }
      })
      .await
      .copied()
  }

  async fn profile_timezone(&self) -> Result<Tz> {
    let me: ApiMe = self.send(self.http.get(self.url("/users/me")), "get current user").await?;
    match me.timezone_name() {
      Some(name) => name
        .parse()
        .map_err(|e| eyre!("Unknown Kimai timezone '{}': {}", name, e)),
      None => {
        warn!("Kimai profile has no timezone; assuming UTC");
        Ok(Tz::UTC)
      }
    }
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", what, e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!("Failed to {}: HTTP {} {}", what, status, body));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
  }
}

#[async_trait]
impl TimeTrackingApi for KimaiClient {
  fn is_configured(&self) -> bool {
    !self.settings.base_url.trim().is_empty() && !self.settings.token.is_empty()
  }

  async fn activities(&self) -> Result<Vec<Activity>> {
    let request = self.http.get(self.url("/activities"));
    let activities: Vec<ApiActivity> = self.send(request, "list activities").await?;
    Ok(activities.into_iter().map(Into::into).collect())
  }

  async fn projects(&self) -> Result<Vec<Project>> {
    let request = self.http.get(self.url("/projects"));
    let projects: Vec<ApiProject> = self.send(request, "list projects").await?;
    Ok(projects.into_iter().map(Into::into).collect())
  }

  async fn customers(&self) -> Result<Vec<Customer>> {
    let request = self.http.get(self.url("/customers"));
    let customers: Vec<ApiCustomer> = self.send(request, "list customers").await?;
    Ok(customers.into_iter().map(Into::into).collect())
  }

  async fn timesheets_before(&self, before: DateTime<Utc>, size: usize) -> Result<Vec<TimeEntry>> {
    let request = self.http.get(self.url("/timesheets")).query(&[
      ("end", format_local(before, self.timezone().await?)),
      ("size", size.to_string()),
      ("order", "DESC".to_string()),
      ("orderBy", "begin".to_string()),
    ]);
    let timesheets: Vec<ApiTimesheet> = self.send(request, "list timesheets").await?;
    timesheets.into_iter().map(TimeEntry::try_from).collect()
  }

  async fn active_timesheets(&self) -> Result<Vec<TimeEntry>> {
    let request = self.http.get(self.url("/timesheets/active"));
    let timesheets: Vec<ApiTimesheet> = self.send(request, "list active timesheets").await?;
    timesheets.into_iter().map(TimeEntry::try_from).collect()
  }

  async fn timesheet(&self, id: i64) -> Result<Option<TimeEntry>> {
    let response = self
      .authorize(self.http.get(self.url(&format!("/timesheets/{}", id))))
      .send()
      .await
      .map_err(|e| eyre!("Failed to get timesheet {}: {}", id, e))?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      return Err(eyre!("Failed to get timesheet {}: HTTP {}", id, response.status()));
    }

    let timesheet: ApiTimesheet = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse timesheet {}: {}", id, e))?;
    timesheet.try_into().map(Some)
  }

  async fn start_timesheet(&self, entry: &NewTimeEntry) -> Result<TimeEntry> {
    let body = ApiNewTimesheet {
      project: entry.project_id,
      activity: entry.activity_id,
      begin: format_local(entry.begin, self.timezone().await?),
      description: entry.description.as_deref(),
    };
    let request = self.http.post(self.url("/timesheets")).json(&body);
    let timesheet: ApiTimesheet = self.send(request, "start timesheet").await?;
    timesheet.try_into()
  }

  async fn stop_timesheet(&self, id: i64) -> Result<TimeEntry> {
    let request = self.http.patch(self.url(&format!("/timesheets/{}/stop", id)));
    let timesheet: ApiTimesheet = self.send(request, "stop timesheet").await?;
    timesheet.try_into()
  }
}

// Kimai takes HTML5 local datetimes in the user's timezone and returns ISO 8601 with a numeric offset

fn format_local(at: DateTime<Utc>, tz: Tz) -> String {
  at.with_timezone(&tz).format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn parse_kimai_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
    .or_else(|_| DateTime::parse_from_rfc3339(s))
    .map(|dt| dt.with_timezone(&Utc))
    .or_else(|_| {
      NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").map(|naive| naive.and_utc())
    })
    .map_err(|e| eyre!("Failed to parse Kimai datetime '{}': {}", s, e))
}

#[derive(Debug, Deserialize)]
struct ApiPreference {
  name: String,
  value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiMe {
  timezone: Option<String>,
  #[serde(default)]
  preferences: Vec<ApiPreference>,
}

impl ApiMe {
  /// Newer servers expose the zone directly, older ones only as a preference
  fn timezone_name(self) -> Option<String> {
    self.timezone.or_else(|| {
      self
        .preferences
        .into_iter()
        .find(|p| p.name == "timezone")
        .and_then(|p| p.value)
        .and_then(|v| v.as_str().map(str::to_string))
    })
  }
}

#[derive(Debug, Deserialize)]
struct ApiCustomer {
  id: i64,
  name: String,
  #[serde(default = "default_visible")]
  visible: bool,
}

#[derive(Debug, Deserialize)]
struct ApiProject {
  id: i64,
  name: String,
  customer: i64,
  #[serde(default = "default_visible")]
  visible: bool,
}

#[derive(Debug, Deserialize)]
struct ApiActivity {
  id: i64,
  name: String,
  project: Option<i64>,
  #[serde(default = "default_visible")]
  visible: bool,
}

#[derive(Debug, Deserialize)]
struct ApiTimesheet {
  id: i64,
  project: i64,
  activity: i64,
  begin: String,
  end: Option<String>,
  duration: Option<i64>,
  description: Option<String>,
  #[serde(default)]
  exported: bool,
}

#[derive(Debug, Serialize)]
struct ApiNewTimesheet<'a> {
  project: i64,
  activity: i64,
  begin: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  description: Option<&'a str>,
}

fn default_visible() -> bool {
  true
}

impl From<ApiCustomer> for Customer {
  fn from(api: ApiCustomer) -> Self {
    Self {
      id: api.id,
      name: api.name,
      visible: api.visible,
    }
  }
}

impl From<ApiProject> for Project {
  fn from(api: ApiProject) -> Self {
    Self {
      id: api.id,
      name: api.name,
      customer_id: api.customer,
      visible: api.visible,
    }
  }
}

impl From<ApiActivity> for Activity {
  fn from(api: ApiActivity) -> Self {
    Self {
      id: api.id,
      name: api.name,
      project_id: api.project,
      visible: api.visible,
    }
  }
}

impl TryFrom<ApiTimesheet> for TimeEntry {
  type Error = color_eyre::Report;

  fn try_from(api: ApiTimesheet) -> Result<Self> {
    let end = api.end.as_deref().map(parse_kimai_datetime).transpose()?;
    Ok(Self {
      id: api.id,
      project_id: api.project,
      activity_id: api.activity,
      begin: parse_kimai_datetime(&api.begin)?,
      // Kimai reports 0 while the entry is running
      duration_seconds: api.duration.filter(|_| end.is_some()),
      end,
      description: api.description.filter(|d| !d.is_empty()),
      exported: api.exported,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_parses_kimai_offsets() {
    let parsed = parse_kimai_datetime("2024-03-01T10:15:00+0100").unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 0).unwrap());

    let rfc = parse_kimai_datetime("2024-03-01T10:15:00+01:00").unwrap();
    assert_eq!(rfc, parsed);
  }

  #[test]
  fn test_running_timesheet_has_no_duration() {
    let api: ApiTimesheet = serde_json::from_str(
      r#"{"id": 7, "project": 1, "activity": 2, "begin": "2024-03-01T10:00:00+0000",
          "end": null, "duration": 0, "description": "", "exported": false}"#,
    )
    .unwrap();

    let entry = TimeEntry::try_from(api).unwrap();

    assert!(entry.is_running());
    assert_eq!(entry.duration_seconds, None);
    assert_eq!(entry.description, None);
  }

  #[test]
  fn test_legacy_auth_selected_by_username() {
    let settings = KimaiSettings {
      base_url: "https://kimai.example.com/".into(),
      username: Some("alice".into()),
      token: "secret".into(),
      timezone: None,
    };
    let client = KimaiClient::new(settings.clone()).unwrap();

    assert!(client.is_configured());
    assert_eq!(client.url("/timesheets"), "https://kimai.example.com/api/timesheets");
    assert!(!format!("{:?}", settings).contains("secret"));
  }

  #[test]
  fn test_cutoff_is_sent_as_local_time() {
    let winter = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
    let summer = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();

    assert_eq!(format_local(winter, chrono_tz::Europe::Berlin), "2024-01-15T13:00:00");
    assert_eq!(format_local(summer, chrono_tz::Europe::Berlin), "2024-07-15T14:00:00");
    assert_eq!(format_local(winter, chrono_tz::America::New_York), "2024-01-15T07:00:00");
    assert_eq!(format_local(winter, Tz::UTC), "2024-01-15T12:00:00");
  }

  #[tokio::test]
  async fn test_configured_timezone_skips_profile_lookup() {
    let client = KimaiClient::new(KimaiSettings {
      // Unroutable, so any request would fail
      base_url: "http://127.0.0.1:9".into(),
      username: None,
      token: "secret".into(),
      timezone: Some(chrono_tz::Europe::Berlin),
    })
    .unwrap();

    assert_eq!(client.timezone().await.unwrap(), chrono_tz::Europe::Berlin);
  }

  #[test]
  fn test_profile_timezone_from_preferences() {
    let me: ApiMe = serde_json::from_str(
      r#"{"preferences": [{"name": "language", "value": "de"}, {"name": "timezone", "value": "Europe/Vienna"}]}"#,
    )
    .unwrap();

    assert_eq!(me.timezone_name().as_deref(), Some("Europe/Vienna"));

    let direct: ApiMe = serde_json::from_str(r#"{"timezone": "Asia/Tokyo"}"#).unwrap();
    assert_eq!(direct.timezone_name().as_deref(), Some("Asia/Tokyo"));
  }
}
