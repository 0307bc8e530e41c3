//! Built-in conformance scenarios and loading of extra scenario files.

use std::path::Path;

use thiserror::Error;

use crate::scenario::{Scenario, StepAction};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read scenarios from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenarios from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

const ALL_VARIANTS: [&str; 4] = ["@sotw", "@incremental", "@aggregated", "@non-aggregated"];
const INCREMENTAL_ONLY: [&str; 3] = ["@incremental", "@aggregated", "@non-aggregated"];

/// Services the built-in scenarios run against.
pub const SERVICES: [&str; 4] = ["LDS", "CDS", "RDS", "EDS"];

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn text(value: &str) -> String {
    value.to_string()
}

/// Every built-in scenario, for every service.
pub fn builtin() -> Vec<Scenario> {
    SERVICES.into_iter().flat_map(for_service).collect()
}

fn for_service(service: &str) -> Vec<Scenario> {
    let service_tag = format!("@{service}");
    let all = names(&["tui", "kaka", "kakapo"]);
    // listeners and clusters may legitimately carry more than was asked for
    // in the state-of-the-world protocol
    let subset_tags: &[&str] = if matches!(service, "LDS" | "CDS") {
        &INCREMENTAL_ONLY
    } else {
        &ALL_VARIANTS
    };

    let setup = |resources: &[&str], version: &str| StepAction::TargetSetup {
        service: text(service),
        resources: names(resources),
        version: text(version),
    };
    let expect = |resources: &[&str], version: &str| StepAction::ExpectResources {
        service: text(service),
        resources: names(resources),
        version: text(version),
    };
    let wildcard = || StepAction::WildcardSubscription {
        service: text(service),
    };
    let ack_unanswered = || StepAction::AckNotAnswered {
        service: text(service),
    };

    vec![
        Scenario::new(format!("{service}: wildcard subscription receives every resource"))
            .tagged(ALL_VARIANTS)
            .tagged([service_tag.clone(), text("@wildcard")])
            .given(setup(&["tui", "kaka", "kakapo"], "1"))
            .when(wildcard())
            .then(expect(&["tui", "kaka", "kakapo"], "1"))
            .and(ack_unanswered()),
        Scenario::new(format!("{service}: subscribers receive new versions"))
            .tagged(ALL_VARIANTS)
            .tagged([service_tag.clone(), text("@wildcard")])
            .given(setup(&["tui", "kaka", "kakapo"], "1"))
            .when(wildcard())
            .then(expect(&["tui", "kaka", "kakapo"], "1"))
            .when(StepAction::StateUpdated {
                service: text(service),
                version: text("2"),
            })
            .then(StepAction::ExpectResources {
                service: text(service),
                resources: all.clone(),
                version: text("2"),
            })
            .and(ack_unanswered()),
        Scenario::new(format!("{service}: an added resource is delivered"))
            .tagged(ALL_VARIANTS)
            .tagged([service_tag.clone(), text("@wildcard")])
            .given(setup(&["tui", "kaka"], "1"))
            .when(wildcard())
            .then(expect(&["tui", "kaka"], "1"))
            .when(StepAction::ResourcesAdded {
                service: text(service),
                resources: names(&["kakapo"]),
                version: text("2"),
            })
            .then(expect(&["tui", "kaka", "kakapo"], "2"))
            .and(ack_unanswered()),
        Scenario::new(format!("{service}: subset subscription receives only the subset"))
            .tagged(subset_tags.iter().copied())
            .tagged([service_tag.clone(), text("@subset")])
            .given(setup(&["tui", "kaka", "kakapo"], "1"))
            .when(StepAction::SubsetSubscription {
                service: text(service),
                resources: names(&["tui", "kaka"]),
            })
            .then(expect(&["tui", "kaka"], "1"))
            .and(ack_unanswered()),
        Scenario::new(format!("{service}: updating a subscription changes what is sent"))
            .tagged(subset_tags.iter().copied())
            .tagged([service_tag.clone(), text("@subset")])
            .given(setup(&["tui", "kaka", "kakapo"], "1"))
            .when(StepAction::SubsetSubscription {
                service: text(service),
                resources: names(&["tui"]),
            })
            .then(expect(&["tui"], "1"))
            .when(StepAction::SubscriptionUpdated {
                service: text(service),
                resources: names(&["kaka"]),
            })
            .then(StepAction::ExpectOnlyResources {
                service: text(service),
                resources: names(&["kaka"]),
                version: text("1"),
            }),
        Scenario::new(format!("{service}: unsubscribing stops updates"))
            .tagged(ALL_VARIANTS)
            .tagged([service_tag.clone(), text("@unsubscribe")])
            .given(setup(&["tui", "kaka", "kakapo"], "1"))
            .when(wildcard())
            .then(expect(&["tui", "kaka", "kakapo"], "1"))
            .when(StepAction::Unsubscribe {
                service: text(service),
            })
            .and(StepAction::StateUpdated {
                service: text(service),
                version: text("2"),
            })
            .then(StepAction::ExpectNoResponse {
                service: text(service),
            }),
        Scenario::new(format!("{service}: a single resource moves to a new version"))
            .tagged(ALL_VARIANTS)
            .tagged([service_tag, text("@wip")])
            .given(setup(&["tui", "kaka", "kakapo"], "1"))
            .when(StepAction::Pending {
                description: format!(
                    "the resource \"kaka\" of service \"{service}\" is updated to version \"2\""
                ),
            })
            .then(StepAction::Pending {
                description: text(
                    "the Client receives only the resource \"kaka\" and version \"2\" for service",
                ),
            }),
    ]
}

/// Reads a JSON array of scenarios. Steps without a location are located by
/// their position in the file.
pub fn load_scenarios(path: &Path) -> Result<Vec<Scenario>, CatalogError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut scenarios: Vec<Scenario> =
        serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    for (scenario_index, scenario) in scenarios.iter_mut().enumerate() {
        for (step_index, step) in scenario.steps.iter_mut().enumerate() {
            if step.location.is_empty() {
                step.location = format!(
                    "{}#{}.{}",
                    path.display(),
                    scenario_index + 1,
                    step_index + 1
                );
            }
        }
    }
    Ok(scenarios)
}
