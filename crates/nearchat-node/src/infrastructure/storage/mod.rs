//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration from the
//! platform-appropriate directory, falls back to defaults on first run, and
//! turns the file's sections into the settings each component takes.

pub mod config;
