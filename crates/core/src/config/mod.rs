//! Configuration loading and management.
//!
//! This module loads the deployment settings from the `.queue-pipeline/`
//! directory and resolves the broker connection string from the environment.

pub mod error;
pub mod loader;
pub mod models;
