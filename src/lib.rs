pub mod config;
pub mod error;
pub mod image;
pub mod job;
pub mod manifest;
pub mod metrics;
pub mod notify;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod store;
