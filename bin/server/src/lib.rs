//! autorule server.
//!
//! Hosts the automation engine behind an axum API and, when NATS is
//! configured, subscribers for completion signals and trigger events.

pub mod config;
pub mod error;
pub mod listeners;
pub mod routes;
