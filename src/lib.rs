//! Offline-first cache and sync engine for a time tracking client.
//!
//! Ticket sources (Jira, GitHub, GitLab) and time tracking master data are
//! cached in SQLite, served cache-first, and refreshed in the background by
//! per-source schedulers.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod sync;
pub mod tickets;
pub mod timetracking;

#[cfg(test)]
pub(crate) mod testing;
