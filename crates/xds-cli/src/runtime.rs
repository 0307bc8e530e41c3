use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use xds_audit::{AuditLog, InMemoryAuditLog, SqliteAuditLog};
use xds_runner::{Connector, GrpcConnector};
use xds_suite::{builtin, load_scenarios, write_results, SuiteOrchestrator};
use xds_types::SuiteResults;

use crate::cli_args::Cli;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed,
    /// No scenario matched the tag expressions of any variant.
    NothingSelected,
}

impl RunOutcome {
    pub fn from_results(results: &SuiteResults) -> Self {
        if results.has_failures() {
            Self::Failed
        } else if results.total == 0 {
            Self::NothingSelected
        } else {
            Self::Passed
        }
    }

    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Passed => ExitCode::SUCCESS,
            Self::Failed | Self::NothingSelected => ExitCode::from(1),
        }
    }
}

/// Runs the suite against real gRPC endpoints.
pub async fn run_cli(cli: Cli) -> Result<RunOutcome> {
    run_with_connector(cli, Arc::new(GrpcConnector)).await
}

pub async fn run_with_connector(cli: Cli, connector: Arc<dyn Connector>) -> Result<RunOutcome> {
    let config = cli.suite_config()?;
    let audit: Arc<dyn AuditLog> = match &cli.audit_db {
        Some(path) => Arc::new(
            SqliteAuditLog::new(path)
                .with_context(|| format!("failed to open audit store {}", path.display()))?,
        ),
        None => Arc::new(InMemoryAuditLog::new()),
    };
    let mut scenarios = builtin();
    if let Some(path) = &cli.scenarios {
        scenarios.extend(load_scenarios(path)?);
    }

    let orchestrator = SuiteOrchestrator::new(config, connector, audit, scenarios)?;
    let results = orchestrator.run_all().await;
    for line in summary_lines(&results) {
        println!("{line}");
    }
    if let Some(dir) = &cli.results_dir {
        let written = write_results(dir, &results)?;
        tracing::info!(dir = %dir.display(), files = written.len(), "results written");
    }
    let outcome = RunOutcome::from_results(&results);
    if outcome == RunOutcome::NothingSelected {
        tracing::error!(tags = ?cli.tags, "no scenario was selected in any variant");
    }
    Ok(outcome)
}

/// One line per variant, then the suite total.
pub fn summary_lines(results: &SuiteResults) -> Vec<String> {
    let mut lines: Vec<String> = results
        .results_by_variant
        .iter()
        .map(|variant| {
            format!(
                "{:<28} total={} passed={} failed={} skipped={} pending={} undefined={}",
                variant.variant.name(),
                variant.total,
                variant.passed,
                variant.failed,
                variant.skipped,
                variant.pending,
                variant.undefined
            )
        })
        .collect();
    for variant in &results.results_by_variant {
        for failure in &variant.failed_scenarios {
            lines.push(format!(
                "  FAILED [{}] {}: {} ({})",
                variant.variant.name(),
                failure.scenario_name,
                failure.failing_step_text,
                failure.source_location
            ));
        }
    }
    lines.push(format!(
        "{:<28} total={} passed={} failed={} skipped={} pending={} undefined={}",
        "all variants",
        results.total,
        results.passed,
        results.failed,
        results.skipped,
        results.pending,
        results.undefined
    ));
    lines
}
