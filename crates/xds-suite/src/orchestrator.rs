use std::sync::Arc;

use thiserror::Error;
use xds_audit::AuditLog;
use xds_runner::{Connector, KindRegistry, Session, SessionConfig, SessionError};
use xds_types::{FailedScenario, StepStatus, SuiteResults, Variant, VariantResults};

use crate::scenario::Scenario;
use crate::steps::run_step;
use crate::tags::TagExpression;

const CONNECT_STEP_TEXT: &str = "the Client connects to the target and the adapter";

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("invalid suite configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What a suite run covers. The session template's variant is replaced by
/// each variant in turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteConfig {
    pub session: SessionConfig,
    pub variants: Vec<Variant>,
    pub base_tags: Option<TagExpression>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            variants: Variant::ALL.to_vec(),
            base_tags: None,
        }
    }
}

impl SuiteConfig {
    pub fn validate(&self) -> Result<(), SuiteError> {
        if self.variants.is_empty() {
            return Err(SuiteError::InvalidConfig(
                "at least one variant must be selected".to_string(),
            ));
        }
        self.session.validate()?;
        Ok(())
    }
}

pub struct SuiteOrchestrator {
    config: SuiteConfig,
    registry: Arc<KindRegistry>,
    connector: Arc<dyn Connector>,
    audit: Arc<dyn AuditLog>,
    scenarios: Vec<Scenario>,
}

impl SuiteOrchestrator {
    pub fn new(
        config: SuiteConfig,
        connector: Arc<dyn Connector>,
        audit: Arc<dyn AuditLog>,
        scenarios: Vec<Scenario>,
    ) -> Result<Self, SuiteError> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(KindRegistry::standard()),
            connector,
            audit,
            scenarios,
        })
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Scenarios whose tags satisfy the expression of `variant`.
    pub fn selected(&self, variant: Variant) -> Vec<&Scenario> {
        let expression = TagExpression::for_variant(variant, self.config.base_tags.as_ref());
        self.scenarios
            .iter()
            .filter(|scenario| expression.matches(&scenario.tags))
            .collect()
    }

    /// Runs every configured variant, one after another.
    pub async fn run_all(&self) -> SuiteResults {
        let mut results = SuiteResults::default();
        for variant in &self.config.variants {
            results = results.fold(self.run_variant(*variant).await);
        }
        tracing::info!(
            total = results.total,
            passed = results.passed,
            failed = results.failed,
            pending = results.pending,
            "suite finished"
        );
        results
    }

    /// Runs the scenarios selected for `variant` on sessions of that wiring.
    /// A variant that cannot connect fails every selected scenario.
    #[tracing::instrument(name = "xds_suite.orchestrator.run_variant", skip(self), fields(variant = %variant))]
    pub async fn run_variant(&self, variant: Variant) -> VariantResults {
        let selected = self.selected(variant);
        let mut results = VariantResults::new(variant);
        let tags = TagExpression::for_variant(variant, self.config.base_tags.as_ref());
        if selected.is_empty() {
            tracing::warn!(tags = %tags, "no scenario matches the variant's tag expression");
            return results;
        }
        tracing::info!(tags = %tags, scenarios = selected.len(), "variant started");

        match self.connect(variant).await {
            Ok(base) => {
                for scenario in selected {
                    self.run_scenario(&base, scenario, &mut results).await;
                }
            }
            Err(error) => {
                tracing::error!(error = %error, "variant cannot connect");
                for scenario in selected {
                    fail_unconnected(&mut results, scenario, &error);
                }
            }
        }

        tracing::info!(
            total = results.total,
            passed = results.passed,
            failed = results.failed,
            skipped = results.skipped,
            pending = results.pending,
            undefined = results.undefined,
            "variant finished"
        );
        results
    }

    async fn connect(&self, variant: Variant) -> Result<Session, SessionError> {
        let mut session = Session::new(
            SessionConfig {
                variant,
                ..self.config.session.clone()
            },
            self.registry.clone(),
            self.connector.clone(),
            self.audit.clone(),
        )?;
        session.connect_all().await?;
        Ok(session)
    }

    async fn run_scenario(&self, base: &Session, scenario: &Scenario, results: &mut VariantResults) {
        let mut session = base.fresh();
        let mut halted = false;
        tracing::debug!(scenario = %scenario.name, session = session.id(), "scenario started");

        for step in &scenario.steps {
            if halted {
                results.record_step(StepStatus::Skipped);
                continue;
            }
            let Err(error) = run_step(&mut session, &step.action).await else {
                results.record_step(StepStatus::Passed);
                continue;
            };
            let status = error.status();
            results.record_step(status);
            halted = true;
            if status == StepStatus::Failed {
                tracing::warn!(
                    scenario = %scenario.name,
                    step = %step,
                    location = %step.location,
                    error = %error,
                    "step failed"
                );
                results.failed_scenarios.push(FailedScenario {
                    scenario_name: scenario.name.clone(),
                    failing_step_text: step.to_string(),
                    source_location: step.location.clone(),
                    error_message: Some(error.to_string()),
                });
            }
        }

        if let Err(error) = session.teardown().await {
            tracing::warn!(scenario = %scenario.name, error = %error, "scenario teardown failed");
        }
    }
}

fn fail_unconnected(results: &mut VariantResults, scenario: &Scenario, error: &SessionError) {
    results.record_step(StepStatus::Failed);
    for _ in &scenario.steps {
        results.record_step(StepStatus::Skipped);
    }
    results.failed_scenarios.push(FailedScenario {
        scenario_name: scenario.name.clone(),
        failing_step_text: CONNECT_STEP_TEXT.to_string(),
        source_location: "connect".to_string(),
        error_message: Some(error.to_string()),
    });
}

#[cfg(test)]
mod tests {
    use super::{SuiteConfig, SuiteError, SuiteOrchestrator};
    use crate::catalog::builtin;
    use crate::scenario::{Scenario, StepAction};
    use crate::tags::TagExpression;
    use std::sync::Arc;
    use std::time::Duration;
    use xds_audit::InMemoryAuditLog;
    use xds_runner::{AdapterCall, InMemoryConnector, InMemoryControlPlane, SessionConfig};
    use xds_types::Variant;

    fn config(variants: Vec<Variant>, base: &str) -> SuiteConfig {
        SuiteConfig {
            session: SessionConfig {
                step_timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(10),
                quiet_period: Duration::from_millis(50),
                ..SessionConfig::default()
            },
            variants,
            base_tags: Some(base.parse::<TagExpression>().expect("tags")),
        }
    }

    fn orchestrator(
        config: SuiteConfig,
        connector: InMemoryConnector,
        scenarios: Vec<Scenario>,
    ) -> SuiteOrchestrator {
        SuiteOrchestrator::new(
            config,
            Arc::new(connector),
            Arc::new(InMemoryAuditLog::new()),
            scenarios,
        )
        .expect("orchestrator")
    }

    #[test]
    fn config_requires_a_variant() {
        let config = SuiteConfig {
            variants: Vec::new(),
            ..SuiteConfig::default()
        };
        assert!(matches!(config.validate(), Err(SuiteError::InvalidConfig(_))));
        assert!(SuiteConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn conformant_plane_passes_every_route_scenario() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let suite = orchestrator(
            config(vec![Variant::SotwNonAggregated], "@RDS"),
            InMemoryConnector::new(plane.clone()),
            builtin(),
        );

        let results = suite.run_variant(Variant::SotwNonAggregated).await;
        assert_eq!(results.failed, 0, "{:?}", results.failed_scenarios);
        assert_eq!(results.pending, 1);
        assert_eq!(results.skipped, 1);
        assert_eq!(
            results.total,
            results.passed + results.pending + results.skipped
        );

        let clears = plane
            .adapter_calls()
            .await
            .into_iter()
            .filter(|call| matches!(call, AdapterCall::ClearState(_)))
            .count();
        assert_eq!(clears, suite.selected(Variant::SotwNonAggregated).len());
    }

    #[tokio::test]
    async fn every_variant_runs_and_folds_into_the_total() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let suite = orchestrator(
            config(Variant::ALL.to_vec(), "@CDS && not @wip"),
            InMemoryConnector::new(plane),
            builtin(),
        );

        let results = suite.run_all().await;
        assert!(!results.has_failures(), "{:?}", results.results_by_variant);
        assert_eq!(
            results.variants,
            Variant::ALL
                .iter()
                .map(|variant| variant.name().to_string())
                .collect::<Vec<_>>()
        );
        let sum: u64 = results
            .results_by_variant
            .iter()
            .map(|variant| variant.total)
            .sum();
        assert_eq!(results.total, sum);
        assert!(results.total > 0);
    }

    #[tokio::test]
    async fn variant_without_matching_scenarios_records_nothing() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let suite = orchestrator(
            config(vec![Variant::SotwNonAggregated], "@LDS,@CDS && @no-such-tag"),
            InMemoryConnector::new(plane.clone()),
            builtin(),
        );

        assert!(suite.selected(Variant::SotwNonAggregated).is_empty());
        let results = suite.run_all().await;
        assert_eq!(results.total, 0);
        assert!(plane.adapter_calls().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_target_fails_every_selected_scenario() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let suite = orchestrator(
            config(vec![Variant::SotwAggregated, Variant::IncrementalAggregated], "@LDS"),
            InMemoryConnector::new(plane).refuse(":18000"),
            builtin(),
        );

        let results = suite.run_all().await;
        assert_eq!(results.results_by_variant.len(), 2);
        for variant in &results.results_by_variant {
            let selected = suite.selected(variant.variant).len();
            assert!(selected > 0);
            assert_eq!(variant.failed, selected as u64);
            assert_eq!(variant.failed_scenarios.len(), selected);
            assert_eq!(variant.passed, 0);
            assert!(variant.failed_scenarios[0]
                .error_message
                .as_deref()
                .is_some_and(|message| message.contains(":18000")));
        }
    }

    #[tokio::test]
    async fn failing_step_skips_the_rest_and_records_its_location() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let scenario = Scenario::new("missing version")
            .tagged(["@sotw", "@non-aggregated", "@custom"])
            .given(StepAction::TargetSetup {
                service: "EDS".to_string(),
                resources: vec!["tui".to_string()],
                version: "1".to_string(),
            })
            .when(StepAction::WildcardSubscription {
                service: "EDS".to_string(),
            })
            .then(StepAction::ExpectResources {
                service: "EDS".to_string(),
                resources: vec!["tui".to_string()],
                version: "9".to_string(),
            })
            .and(StepAction::AckNotAnswered {
                service: "EDS".to_string(),
            });
        let mut config = config(vec![Variant::SotwNonAggregated], "@custom");
        config.session.step_timeout = Duration::from_millis(200);
        let suite = orchestrator(config, InMemoryConnector::new(plane), vec![scenario.clone()]);

        let results = suite.run_variant(Variant::SotwNonAggregated).await;
        assert_eq!((results.passed, results.failed, results.skipped), (2, 1, 1));
        let failure = &results.failed_scenarios[0];
        assert_eq!(failure.scenario_name, "missing version");
        assert_eq!(failure.failing_step_text, scenario.steps[2].to_string());
        assert_eq!(failure.source_location, scenario.steps[2].location);
    }
}
