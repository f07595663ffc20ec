//! Data layer module
//!
//! Handles all data persistence:
//! - Local users and their notes
//! - Remote actor projections
//! - Per-host instance records

mod database;
mod models;

pub use database::{Database, OutboxScope};
pub use models::*;
