mod cache;
pub mod client;
pub mod repository;
pub mod types;

pub use cache::TimeTrackingQueryKey;
pub use client::{KimaiClient, KimaiSettings, TimeTrackingApi};
pub use repository::TimeTrackingRepository;
pub use types::{Activity, Customer, NewTimeEntry, Project, TimeEntry};
