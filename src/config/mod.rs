//! Configuration module.
//!
//! Provides CLI argument parsing and the controller's library-level settings.

#[allow(clippy::module_inception)]
mod config;

pub use config::{AppConfig, ControllerConfig, DEFAULT_TIMEOUT_MS, Provider};
