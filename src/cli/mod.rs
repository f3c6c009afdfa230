//! Command-line interface for crowd-sched.
//!
//! Provides commands for handing out tasks, releasing locks and inspecting
//! locks, active users and availability.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
