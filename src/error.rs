//! Error taxonomy for the sync engine.

use std::fmt::Display;

use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by cache refreshes, aggregated searches and sync cycles.
///
/// Cloneable so a single in-flight fetch can hand the same outcome to every
/// waiter that joined it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
  /// No provider registered for a kind, missing credentials, or an invalid
  /// source definition. Never retried automatically.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// A remote call failed or timed out.
  #[error("network error: {0}")]
  Network(String),

  /// The local cache database rejected a read or write.
  #[error("storage error: {0}")]
  Storage(String),

  /// A spawned fan-out task panicked.
  #[error("background task failed: {0}")]
  Task(String),

  /// The task driving the call was cancelled.
  #[error("sync cancelled")]
  Cancelled,
}

impl SyncError {
  pub fn configuration(message: impl Into<String>) -> Self {
    Self::Configuration(message.into())
  }

  /// Wrap a remote failure, keeping the whole `eyre` chain in the message.
  pub fn network(err: impl Display) -> Self {
    Self::Network(format!("{err:#}"))
  }

  pub fn storage(err: impl Display) -> Self {
    Self::Storage(format!("{err:#}"))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }

  pub fn is_configuration(&self) -> bool {
    matches!(self, Self::Configuration(_))
  }
}

impl From<tokio::task::JoinError> for SyncError {
  fn from(err: tokio::task::JoinError) -> Self {
    if err.is_cancelled() {
      Self::Cancelled
    } else {
      Self::Task(err.to_string())
    }
  }
}
