pub mod auth;
pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod ingest;
pub mod metrics;
pub mod pairing;
pub mod query;
pub mod reaper;
pub mod store;
pub mod web_interface;
