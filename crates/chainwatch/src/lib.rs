//! Chainwatch agent
//!
//! Hosts the threat engine behind an HTTP API and runs its background
//! workers until shutdown.

pub mod api;
pub mod config;
