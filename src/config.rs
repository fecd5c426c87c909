use chrono_tz::Tz;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::DEFAULT_TIMESHEET_PAGE_SIZE;
use crate::tickets::{ProviderKind, SourceConfig, SourceCredentials, DEFAULT_ISSUE_FORMAT};
use crate::timetracking::KimaiSettings;

const DEFAULT_KIMAI_TOKEN_ENV: &str = "TRACKSYNC_KIMAI_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Omitting the section disables timesheet sync
  pub timetracking: Option<TimeTrackingConfig>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeTrackingConfig {
  pub url: String,
  /// Set to use the legacy X-AUTH headers instead of a Bearer token
  pub username: Option<String>,
  #[serde(default = "default_kimai_token_env")]
  pub token_env: String,
  /// IANA zone such as Europe/Berlin; read from the Kimai profile when unset
  pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_interval_minutes")]
  pub interval_minutes: u32,
  #[serde(default = "default_page_size")]
  pub timesheet_page_size: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      interval_minutes: default_interval_minutes(),
      timesheet_page_size: DEFAULT_TIMESHEET_PAGE_SIZE,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(u64::from(self.interval_minutes.max(1)) * 60)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Defaults to $DATA_DIR/tracksync/cache.db
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Daily rolling files in this directory; stderr when unset
  pub directory: Option<PathBuf>,
  #[serde(default = "default_level")]
  pub level: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      directory: None,
      level: default_level(),
    }
  }
}

/// One `sources:` entry as written in the file. Tokens stay in the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
  pub id: String,
  pub display_name: Option<String>,
  pub provider: ProviderKind,
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default)]
  pub base_url: String,
  /// Jira only
  pub email: Option<String>,
  pub token_env: String,
  #[serde(default = "default_interval_minutes")]
  pub sync_interval_minutes: u32,
  pub default_project_key: Option<String>,
  #[serde(default = "default_issue_format")]
  pub issue_format_pattern: String,
}

fn default_true() -> bool {
  true
}

fn default_interval_minutes() -> u32 {
  15
}

fn default_page_size() -> usize {
  DEFAULT_TIMESHEET_PAGE_SIZE
}

fn default_level() -> String {
  "info".to_string()
}

fn default_kimai_token_env() -> String {
  DEFAULT_KIMAI_TOKEN_ENV.to_string()
}

fn default_issue_format() -> String {
  DEFAULT_ISSUE_FORMAT.to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracksync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracksync/config.yaml
  /// 4. ~/.config/tracksync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tracksync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tracksync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tracksync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    // dirs::config_dir is not ~/.config on macOS
    if let Some(home) = dirs::home_dir() {
      let dot_config = home.join(".config").join("tracksync").join("config.yaml");
      if dot_config.exists() {
        return Some(dot_config);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Resolve `sources:` into validated configs, reading tokens from the environment.
  pub fn source_configs(&self) -> Result<Vec<SourceConfig>> {
    self.source_configs_with(|name| std::env::var(name).ok())
  }

  pub fn source_configs_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Vec<SourceConfig>> {
    let mut seen = HashSet::new();
    let mut configs = Vec::with_capacity(self.sources.len());

    for entry in &self.sources {
      if !seen.insert(entry.id.as_str()) {
        return Err(eyre!("Duplicate source id in config: {}", entry.id));
      }
      let config = entry.resolve(&lookup)?;
      config.validate().map_err(|e| eyre!("Invalid source {}: {}", entry.id, e))?;
      configs.push(config);
    }

    Ok(configs)
  }

  /// Kimai connection settings, or None when time tracking is not configured.
  pub fn kimai_settings(&self) -> Result<Option<KimaiSettings>> {
    self.kimai_settings_with(|name| std::env::var(name).ok())
  }

  pub fn kimai_settings_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Option<KimaiSettings>> {
    let Some(tt) = &self.timetracking else {
      return Ok(None);
    };

    let timezone = tt
      .timezone
      .as_deref()
      .map(str::trim)
      .filter(|tz| !tz.is_empty())
      .map(|tz| {
        tz.parse::<Tz>()
          .map_err(|e| eyre!("Unknown time tracking timezone '{}': {}", tz, e))
      })
      .transpose()?;

    Ok(Some(KimaiSettings {
      base_url: tt.url.clone(),
      username: tt.username.clone().filter(|u| !u.trim().is_empty()),
      token: token_from(&lookup, &tt.token_env, "time tracking")?,
      timezone,
    }))
  }
}

impl SourceEntry {
  fn resolve(&self, lookup: &impl Fn(&str) -> Option<String>) -> Result<SourceConfig> {
    let token = token_from(lookup, &self.token_env, &self.id)?;
    let credentials = match self.provider {
      ProviderKind::Jira => {
        let email = self
          .email
          .clone()
          .filter(|e| !e.trim().is_empty())
          .ok_or_else(|| eyre!("Jira source {} needs an email", self.id))?;
        SourceCredentials::Jira {
          email,
          api_token: token,
        }
      }
      ProviderKind::GitHub => SourceCredentials::GitHub { token },
      ProviderKind::GitLab => SourceCredentials::GitLab { token },
    };

    Ok(SourceConfig {
      id: self.id.clone(),
      display_name: self.display_name.clone().unwrap_or_else(|| self.id.clone()),
      provider_kind: self.provider,
      enabled: self.enabled,
      base_url: self.base_url.clone(),
      credentials,
      sync_interval_minutes: self.sync_interval_minutes,
      default_project_key: self.default_project_key.clone(),
      issue_format_pattern: self.issue_format_pattern.clone(),
    })
  }
}

fn token_from(lookup: &impl Fn(&str) -> Option<String>, var: &str, owner: &str) -> Result<String> {
  lookup(var)
    .filter(|t| !t.trim().is_empty())
    .ok_or_else(|| eyre!("Token for {} not found. Set the {} environment variable.", owner, var))
}
