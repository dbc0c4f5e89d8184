//! Command-line interface for swe-harness.
//!
//! Provides commands for running a batch, parsing a single test log and
//! previewing the image chains a configuration resolves to.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
