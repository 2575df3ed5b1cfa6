//! Command-line interface for task-dispatch.
//!
//! Provides the `dispatch` and `status` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
