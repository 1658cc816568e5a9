//! Subcommand implementations

pub mod bridge;
pub mod run;
