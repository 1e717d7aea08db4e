//! Shared utilities for mongo-provision components
//!
//! This crate provides common functionality used by the provisioner:
//! - Structured logging initialization
//! - Environment variable parsing helpers
//! - Subprocess execution utilities

pub mod command;
pub mod config;
pub mod logging;

pub use config::ConfigExt;
pub use logging::init_logging;
