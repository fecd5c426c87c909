pub mod api_types;
pub mod client;

pub use client::JiraProvider;
