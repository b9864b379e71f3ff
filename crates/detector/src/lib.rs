//! Anomaly detector service: HTTP API over a hot-reloaded model bundle

pub mod api;
pub mod config;
pub mod context;
