use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
  pub id: i64,
  pub name: String,
  #[serde(default = "visible")]
  pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
  pub id: i64,
  pub name: String,
  pub customer_id: i64,
  #[serde(default = "visible")]
  pub visible: bool,
}

/// Activities without a project are global and can be booked on any project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
  pub id: i64,
  pub name: String,
  pub project_id: Option<i64>,
  #[serde(default = "visible")]
  pub visible: bool,
}

/// One time entry. `end == None` is the running entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
  pub id: i64,
  pub project_id: i64,
  pub activity_id: i64,
  pub begin: DateTime<Utc>,
  pub end: Option<DateTime<Utc>>,
  pub duration_seconds: Option<i64>,
  pub description: Option<String>,
  #[serde(default)]
  pub exported: bool,
}

impl TimeEntry {
  pub fn is_running(&self) -> bool {
    self.end.is_none()
  }
}

/// What is needed to start a timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTimeEntry {
  pub project_id: i64,
  pub activity_id: i64,
  pub begin: DateTime<Utc>,
  pub description: Option<String>,
}

fn visible() -> bool {
  true
}
