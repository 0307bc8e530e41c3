use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use xds_runner::SessionConfig;
use xds_suite::{SuiteConfig, TagExpression};
use xds_types::Variant;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "xds-conformance",
    about = "Conformance suite for discovery protocol control planes",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "XDS_TARGET",
        default_value = ":18000",
        help = "Address of the control plane under test"
    )]
    pub target: String,

    #[arg(
        long,
        env = "XDS_ADAPTER",
        default_value = ":17000",
        help = "Address of the companion adapter that programs the target's state"
    )]
    pub adapter: String,

    #[arg(
        long = "node-id",
        env = "XDS_NODE_ID",
        default_value = "test-id",
        help = "Node identifier used for every request and programmed state"
    )]
    pub node_id: String,

    #[arg(
        long,
        env = "XDS_TAGS",
        help = "Tag expression narrowing the scenarios of every variant, e.g. '@CDS && not @wip'"
    )]
    pub tags: Option<String>,

    #[arg(
        long = "variant",
        env = "XDS_VARIANTS",
        value_delimiter = ',',
        help = "Protocol variants to run (default: all four), e.g. 'sotw-aggregated'"
    )]
    pub variants: Vec<String>,

    #[arg(
        long = "scenarios",
        env = "XDS_SCENARIOS",
        help = "JSON file of extra scenarios appended to the built-in catalog"
    )]
    pub scenarios: Option<PathBuf>,

    #[arg(
        long = "results-dir",
        env = "XDS_RESULTS_DIR",
        help = "Directory receiving one JSON result file per variant and summary.json"
    )]
    pub results_dir: Option<PathBuf>,

    #[arg(
        long = "audit-db",
        env = "XDS_AUDIT_DB",
        help = "SQLite file keeping the request/response audit trail (in memory when omitted)"
    )]
    pub audit_db: Option<PathBuf>,

    #[arg(
        long = "dial-timeout-ms",
        env = "XDS_DIAL_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Bound on connecting to the target and the adapter"
    )]
    pub dial_timeout_ms: u64,

    #[arg(
        long = "stream-deadline-ms",
        env = "XDS_STREAM_DEADLINE_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Upper bound on the lifetime of one discovery stream"
    )]
    pub stream_deadline_ms: u64,

    #[arg(
        long = "step-timeout-ms",
        env = "XDS_STEP_TIMEOUT_MS",
        default_value_t = 3_000,
        value_parser = parse_positive_u64,
        help = "How long a step waits for an expected response"
    )]
    pub step_timeout_ms: u64,

    #[arg(
        long = "quiet-period-ms",
        env = "XDS_QUIET_PERIOD_MS",
        default_value_t = 2_000,
        help = "How long to listen before concluding that the target sends nothing"
    )]
    pub quiet_period_ms: u64,

    #[arg(long, env = "XDS_DEBUG", help = "Log at debug level unless RUST_LOG says otherwise")]
    pub debug: bool,
}

impl Cli {
    /// Suite configuration described by the flags.
    pub fn suite_config(&self) -> anyhow::Result<SuiteConfig> {
        let variants = if self.variants.is_empty() {
            Variant::ALL.to_vec()
        } else {
            self.variants
                .iter()
                .map(|raw| raw.parse::<Variant>())
                .collect::<Result<Vec<_>, _>>()?
        };
        let base_tags = self
            .tags
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(str::parse::<TagExpression>)
            .transpose()?;

        let config = SuiteConfig {
            session: SessionConfig {
                target_address: self.target.clone(),
                adapter_address: self.adapter.clone(),
                node_id: self.node_id.clone(),
                dial_timeout: Duration::from_millis(self.dial_timeout_ms),
                stream_deadline: Duration::from_millis(self.stream_deadline_ms),
                step_timeout: Duration::from_millis(self.step_timeout_ms),
                quiet_period: Duration::from_millis(self.quiet_period_ms),
                ..SessionConfig::default()
            },
            variants,
            base_tags,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::Parser;
    use std::time::Duration;
    use xds_types::Variant;

    #[test]
    fn defaults_match_the_local_harness_setup() {
        let cli = Cli::try_parse_from(["xds-conformance"]).expect("parse");
        let config = cli.suite_config().expect("config");
        assert_eq!(config.session.target_address, ":18000");
        assert_eq!(config.session.adapter_address, ":17000");
        assert_eq!(config.session.node_id, "test-id");
        assert_eq!(config.session.step_timeout, Duration::from_secs(3));
        assert_eq!(config.variants, Variant::ALL.to_vec());
        assert!(config.base_tags.is_none());
    }

    #[test]
    fn variants_and_tags_are_parsed() {
        let cli = Cli::try_parse_from([
            "xds-conformance",
            "--variant",
            "sotw-aggregated,incremental non-aggregated",
            "--tags",
            "@CDS && not @wip",
            "--node-id",
            "edge-1",
        ])
        .expect("parse");
        let config = cli.suite_config().expect("config");
        assert_eq!(
            config.variants,
            vec![Variant::SotwAggregated, Variant::IncrementalNonAggregated]
        );
        assert_eq!(
            config.base_tags.map(|tags| tags.to_string()),
            Some("@CDS && not @wip".to_string())
        );
        assert_eq!(config.session.node_id, "edge-1");
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        assert!(Cli::try_parse_from(["xds-conformance", "--step-timeout-ms", "0"]).is_err());

        let cli = Cli::try_parse_from(["xds-conformance", "--variant", "sotw"]).expect("parse");
        assert!(cli.suite_config().is_err());

        let cli = Cli::try_parse_from(["xds-conformance", "--node-id", " "]).expect("parse");
        assert!(cli.suite_config().is_err());

        let cli = Cli::try_parse_from(["xds-conformance", "--tags", "CDS"]).expect("parse");
        assert!(cli.suite_config().is_err());
    }
}
