//! Side-effecting adapters: config, subprocesses, installers, oracle, artifacts.

pub mod attempt_log;
pub mod batch;
pub mod config;
pub mod installer;
pub mod manifest;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod registry;
