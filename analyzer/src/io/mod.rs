//! I/O helpers for analyzer runs.

pub mod artifacts;
pub mod command_log;
pub mod config;
pub mod gateway;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod repo;
pub mod scan;
pub mod secret_scan;
pub mod workspace;
