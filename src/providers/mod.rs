//! Remote issue tracker implementations of `TicketProvider`.

mod http;

pub mod github;
pub mod gitlab;
pub mod jira;

pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use jira::JiraProvider;
