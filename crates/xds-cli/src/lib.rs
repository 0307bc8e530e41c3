//! Command-line surface of the discovery conformance suite.

pub mod cli_args;
pub mod runtime;

pub use cli_args::Cli;
pub use runtime::{run_cli, RunOutcome};
