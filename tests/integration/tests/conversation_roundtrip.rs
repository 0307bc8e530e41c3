use std::sync::Arc;
use std::time::Duration;

use xds_audit::{AuditLog, Direction, InMemoryAuditLog, SqliteAuditLog};
use xds_runner::{
    InMemoryConnector, InMemoryControlPlane, KindRegistry, Session, SessionConfig,
};
use xds_suite::{builtin, SuiteConfig, SuiteOrchestrator, TagExpression};
use xds_types::{type_url, DiscoveryRequest, Variant};

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn session_config(variant: Variant) -> SessionConfig {
    SessionConfig {
        variant,
        step_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        quiet_period: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

async fn connected_session(variant: Variant, audit: Arc<dyn AuditLog>) -> Session {
    let plane = Arc::new(InMemoryControlPlane::new());
    let mut session = Session::new(
        session_config(variant),
        Arc::new(KindRegistry::standard()),
        Arc::new(InMemoryConnector::new(plane)),
        audit,
    )
    .expect("session");
    session.connect_all().await.expect("connect");
    session
}

/// Wildcard listener subscription through two versions, then termination.
async fn listener_exchange(session: &mut Session) -> Vec<DiscoveryRequest> {
    let all = names(&["tui", "kaka", "kakapo"]);
    session.program_state(&all, "1").await.expect("program");
    session.subscribe("listener", &[]).await.expect("subscribe");
    session
        .wait_for_resources("listener", &all, "1")
        .await
        .expect("version 1");
    session.wait_for_ack("listener").await.expect("ack 1");

    session.update_state("2").await.expect("update");
    session
        .wait_for_resources("listener", &all, "2")
        .await
        .expect("version 2");
    session.wait_for_ack("listener").await.expect("ack 2");

    assert!(session
        .terminate_conversation("listener")
        .await
        .expect("terminate"));
    session.cache("listener").await.expect("cache").requests
}

#[tokio::test]
async fn listener_versions_are_acknowledged_in_order_and_audited() {
    let dir = tempfile::tempdir().expect("tempdir");
    let audit = Arc::new(SqliteAuditLog::new(dir.path().join("audit.sqlite")).expect("audit"));
    let mut session = connected_session(Variant::SotwNonAggregated, audit.clone()).await;

    let requests = listener_exchange(&mut session).await;
    assert_eq!(requests.len(), 3);
    assert!(requests[0].version_info.is_empty());
    assert!(requests[0].response_nonce.is_empty());
    assert_eq!(requests[1].version_info, "1");
    assert_eq!(requests[1].resource_names, names(&["tui", "kaka", "kakapo"]));
    assert_eq!(requests[1].response_nonce, "1");
    assert_eq!(requests[2].version_info, "2");
    assert_eq!(requests[2].response_nonce, "2");
    assert!(requests
        .iter()
        .all(|request| request.type_url == type_url::LISTENER && request.node_id == "test-id"));

    let id = session.conversation_id("listener").expect("conversation");
    let directions: Vec<Direction> = audit
        .records(&id)
        .await
        .expect("records")
        .into_iter()
        .map(|record| record.direction)
        .collect();
    assert_eq!(
        directions,
        vec![
            Direction::Sent,
            Direction::Received,
            Direction::Sent,
            Direction::Received,
            Direction::Sent,
        ]
    );
    assert!(audit
        .has_expected_resources(&id, "2", type_url::LISTENER, &names(&["tui", "kaka", "kakapo"]))
        .await
        .expect("query"));
    assert!(!audit
        .has_expected_resources(&id, "2", type_url::LISTENER, &names(&["tui", "kaka"]))
        .await
        .expect("query"));
}

#[tokio::test]
async fn aggregated_and_split_wiring_acknowledge_identically() {
    let mut split =
        connected_session(Variant::SotwNonAggregated, Arc::new(InMemoryAuditLog::new())).await;
    let mut aggregated =
        connected_session(Variant::SotwAggregated, Arc::new(InMemoryAuditLog::new())).await;

    let split_requests = listener_exchange(&mut split).await;
    let aggregated_requests = listener_exchange(&mut aggregated).await;
    assert_eq!(split_requests, aggregated_requests);
}

#[tokio::test]
async fn fresh_sessions_never_share_conversations() {
    let audit = Arc::new(InMemoryAuditLog::new());
    let mut first = connected_session(Variant::IncrementalNonAggregated, audit.clone()).await;
    first
        .program_state(&names(&["tui"]), "1")
        .await
        .expect("program");
    first.subscribe("CDS", &[]).await.expect("subscribe");
    first
        .wait_for_resources("CDS", &names(&["tui"]), "1")
        .await
        .expect("resources");
    let first_id = first.conversation_id("CDS").expect("conversation");
    first.teardown().await.expect("teardown");

    let mut second = first.fresh();
    assert!(second.conversation_id("CDS").is_none());
    second
        .program_state(&names(&["kaka"]), "1")
        .await
        .expect("program");
    second.subscribe("CDS", &[]).await.expect("subscribe");
    second
        .wait_for_resources("CDS", &names(&["kaka"]), "1")
        .await
        .expect("resources");

    let second_id = second.conversation_id("CDS").expect("conversation");
    assert_ne!(first_id, second_id);
    let cache = second.cache("CDS").await.expect("cache");
    assert!(cache
        .responses
        .iter()
        .all(|response| response.resources.len() == 1));
    assert!(!audit.records(&first_id).await.expect("records").is_empty());
    second.teardown().await.expect("teardown");
}

#[tokio::test]
async fn builtin_catalog_passes_against_the_in_memory_plane() {
    let plane = Arc::new(InMemoryControlPlane::new());
    let suite = SuiteOrchestrator::new(
        SuiteConfig {
            session: session_config(Variant::SotwNonAggregated),
            variants: Variant::ALL.to_vec(),
            base_tags: Some("@LDS && not @wip".parse::<TagExpression>().expect("tags")),
        },
        Arc::new(InMemoryConnector::new(plane)),
        Arc::new(InMemoryAuditLog::new()),
        builtin(),
    )
    .expect("suite");

    let results = suite.run_all().await;
    for variant in &results.results_by_variant {
        assert!(
            variant.failed_scenarios.is_empty(),
            "{}: {:?}",
            variant.variant,
            variant.failed_scenarios
        );
        assert!(variant.passed > 0);
    }
    assert_eq!(results.variants.len(), 4);
    assert_eq!(serde_json::to_value(&results).expect("json")["failed"], 0);
}
