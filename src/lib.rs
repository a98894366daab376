//! Incremental collection of Jira and GitLab records into a local store,
//! followed by enrichment into a canonical schema.

pub mod collector;
pub mod config;
pub mod cursor;
pub mod db;
pub mod enrich;
pub mod fetch;
pub mod model;
pub mod paginate;
pub mod store;
