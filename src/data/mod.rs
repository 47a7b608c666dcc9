//! Data layer
//!
//! Database operations and model definitions.

pub mod database;
pub mod models;

pub use database::Database;
pub use models::*;
