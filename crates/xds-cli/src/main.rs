use std::process::ExitCode;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use xds_cli::{run_cli, Cli};

fn init_tracing(debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match run_cli(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "suite could not run");
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}
