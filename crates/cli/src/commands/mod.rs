//! Subcommand implementations

pub mod metrics;
pub mod port_forward;
