//! CLI command implementations

pub mod chains;
pub mod events;
pub mod models;
