//! A session owns the connections to the target and the companion adapter,
//! the node identity and one conversation per stream route.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use xds_audit::{AuditError, AuditLog};
use xds_types::{
    ordered_set, DiscoveryRequest, DiscoveryResponse, ProtocolMode, Snapshot, Variant,
};

use crate::ack::{AckBuilder, ParseError};
use crate::adapter::{AdapterError, CompanionAdapter};
use crate::binding::{BindingError, KindRegistry, ResourceKind, StreamRoute};
use crate::connector::{ConnectionError, ConnectionRole, Connector};
use crate::conversation::{Conversation, ConversationConfig, ConversationError, SessionCache};
use crate::transport::DiscoveryTransport;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("session is not connected to the {0}")]
    NotConnected(ConnectionRole),
    #[error("no conversation is streaming {0}")]
    NoConversation(String),
    #[error("no state has been programmed for node '{0}'")]
    NoState(String),
    #[error("no response received yet for {0}")]
    NoResponse(String),
    #[error("timed out after {timeout:?} waiting for {expectation}")]
    Timeout {
        expectation: String,
        timeout: Duration,
    },
    #[error("received a response at version '{version}' for {type_url} when none was expected")]
    UnexpectedResponse { version: String, type_url: String },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Settings shared by every session of one variant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub target_address: String,
    pub adapter_address: String,
    pub node_id: String,
    pub variant: Variant,
    pub dial_timeout: Duration,
    /// Upper bound on the lifetime of one stream.
    pub stream_deadline: Duration,
    /// How long a waiting step polls before it fails.
    pub step_timeout: Duration,
    pub drain_timeout: Duration,
    pub poll_interval: Duration,
    /// How long to listen before concluding that nothing arrives.
    pub quiet_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_address: ":18000".to_string(),
            adapter_address: ":17000".to_string(),
            node_id: "test-id".to_string(),
            variant: Variant::SotwNonAggregated,
            dial_timeout: Duration::from_secs(5),
            stream_deadline: Duration::from_secs(10),
            step_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
            quiet_period: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |message: &str| Err(SessionError::InvalidConfig(message.to_string()));
        if self.node_id.trim().is_empty() {
            return invalid("node_id must not be empty");
        }
        if self.target_address.trim().is_empty() {
            return invalid("target_address must not be empty");
        }
        if self.adapter_address.trim().is_empty() {
            return invalid("adapter_address must not be empty");
        }
        for (name, value) in [
            ("dial_timeout", self.dial_timeout),
            ("stream_deadline", self.stream_deadline),
            ("step_timeout", self.step_timeout),
            ("drain_timeout", self.drain_timeout),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(SessionError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

pub struct Session {
    id: String,
    config: SessionConfig,
    registry: Arc<KindRegistry>,
    connector: Arc<dyn Connector>,
    audit: Arc<dyn AuditLog>,
    target: Option<Arc<dyn DiscoveryTransport>>,
    adapter: Option<Arc<dyn CompanionAdapter>>,
    conversations: BTreeMap<&'static str, Conversation>,
    /// Current subscription per type URL; empty means wildcard.
    subscriptions: HashMap<String, Vec<String>>,
    state_history: Vec<Snapshot>,
    next_conversation: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("conversations", &self.conversations)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        registry: Arc<KindRegistry>,
        connector: Arc<dyn Connector>,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            id: next_id("session"),
            config,
            registry,
            connector,
            audit,
            target: None,
            adapter: None,
            conversations: BTreeMap::new(),
            subscriptions: HashMap::new(),
            state_history: Vec::new(),
            next_conversation: 1,
        })
    }

    /// A new session with the same configuration and connections, and no
    /// conversation, cache or programmed state.
    pub fn fresh(&self) -> Self {
        Self {
            id: next_id("session"),
            config: self.config.clone(),
            registry: self.registry.clone(),
            connector: self.connector.clone(),
            audit: self.audit.clone(),
            target: self.target.clone(),
            adapter: self.adapter.clone(),
            conversations: BTreeMap::new(),
            subscriptions: HashMap::new(),
            state_history: Vec::new(),
            next_conversation: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn variant(&self) -> Variant {
        self.config.variant
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn is_connected(&self) -> bool {
        self.target.is_some() && self.adapter.is_some()
    }

    /// Dials `address` in `role`, bounded by the dial timeout.
    #[tracing::instrument(name = "xds_runner.session.connect", skip(self), fields(session = %self.id))]
    pub async fn connect(
        &mut self,
        role: ConnectionRole,
        address: &str,
    ) -> Result<(), SessionError> {
        let timeout = self.config.dial_timeout;
        match role {
            ConnectionRole::Target => {
                self.target = Some(self.connector.connect_target(address, timeout).await?);
            }
            ConnectionRole::Adapter => {
                self.adapter = Some(self.connector.connect_adapter(address, timeout).await?);
            }
        }
        Ok(())
    }

    /// Connects to the configured target and adapter.
    pub async fn connect_all(&mut self) -> Result<(), SessionError> {
        let target = self.config.target_address.clone();
        let adapter = self.config.adapter_address.clone();
        self.connect(ConnectionRole::Target, &target).await?;
        self.connect(ConnectionRole::Adapter, &adapter).await?;
        tracing::info!(
            target = %target,
            adapter = %adapter,
            aggregated = self.config.variant.is_aggregated(),
            incremental = self.config.variant.is_incremental(),
            "session connected"
        );
        Ok(())
    }

    /// Latest state programmed through the adapter.
    pub fn current_state(&self) -> Option<&Snapshot> {
        self.state_history.last()
    }

    /// Programs the starting state: every kind gets `names` at `version`.
    pub async fn program_state(
        &mut self,
        names: &[String],
        version: &str,
    ) -> Result<Snapshot, SessionError> {
        let snapshot = Snapshot::new(self.node_id(), version, names.iter().cloned());
        let adapter = self.adapter()?;
        let reply = adapter.set_state(&snapshot).await?;
        tracing::debug!(version, resources = ?snapshot.resource_names, reply = %reply, "state programmed");
        self.state_history.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Re-issues the current resources under a new version.
    pub async fn update_state(&mut self, version: &str) -> Result<Snapshot, SessionError> {
        let snapshot = self.require_state()?.with_version(version);
        self.push_update(snapshot).await
    }

    /// Adds `names` to every kind under a new version.
    pub async fn add_resources(
        &mut self,
        names: &[String],
        version: &str,
    ) -> Result<Snapshot, SessionError> {
        let snapshot = self
            .require_state()?
            .with_resources(names.iter().cloned(), version);
        self.push_update(snapshot).await
    }

    async fn push_update(&mut self, snapshot: Snapshot) -> Result<Snapshot, SessionError> {
        let adapter = self.adapter()?;
        let reply = adapter.update_state(&snapshot).await?;
        tracing::debug!(version = %snapshot.version, reply = %reply, "state updated");
        self.state_history.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Subscribes to `names` of `kind`; an empty list is a wildcard. Starts
    /// the conversation for the kind's route when none is streaming.
    #[tracing::instrument(name = "xds_runner.session.subscribe", skip(self), fields(session = %self.id))]
    pub async fn subscribe(&mut self, kind: &str, names: &[String]) -> Result<(), SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let route = self.route_for(&kind);
        let names = ordered_set(names.iter().cloned());
        let mut request = DiscoveryRequest::subscribe(self.node_id(), kind.type_url, names.clone());

        let streaming = self.active_conversation(&route).is_ok();
        if streaming {
            let conversation = self.active_conversation(&route)?;
            let cache = conversation.cache().await;
            if let Some(last) = cache.last_response_for(kind.type_url) {
                if route.mode == ProtocolMode::StateOfTheWorld {
                    request.version_info = last.version_info.clone();
                }
                request.response_nonce = last.nonce.clone();
            }
            conversation.send(request).await?;
        } else {
            self.start_conversation(&route, request).await?;
        }
        self.subscriptions.insert(kind.type_url.to_string(), names);
        Ok(())
    }

    /// Replaces the subscription for `kind` with `names`.
    #[tracing::instrument(name = "xds_runner.session.update_subscription", skip(self), fields(session = %self.id))]
    pub async fn update_subscription(
        &mut self,
        kind: &str,
        names: &[String],
    ) -> Result<(), SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let route = self.route_for(&kind);
        let names = ordered_set(names.iter().cloned());
        let current = self
            .subscriptions
            .get(kind.type_url)
            .cloned()
            .unwrap_or_default();
        let mut request = self.follow_up(&kind, &route).await?;

        match route.mode {
            ProtocolMode::StateOfTheWorld => request.resource_names = names.clone(),
            ProtocolMode::Incremental => {
                request.resource_names = names
                    .iter()
                    .filter(|name| !current.contains(name))
                    .cloned()
                    .collect();
                request.resource_names_unsubscribe = if current.is_empty() {
                    vec!["*".to_string()]
                } else {
                    current
                        .iter()
                        .filter(|name| !names.contains(name))
                        .cloned()
                        .collect()
                };
            }
        }
        self.active_conversation(&route)?.send(request).await?;
        self.subscriptions.insert(kind.type_url.to_string(), names);
        Ok(())
    }

    /// Drops every resource of `kind` from the subscription and waits the
    /// quiet period so the target observes it before the next update.
    #[tracing::instrument(name = "xds_runner.session.unsubscribe_all", skip(self), fields(session = %self.id))]
    pub async fn unsubscribe_all(&mut self, kind: &str) -> Result<(), SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let route = self.route_for(&kind);
        let current = self
            .subscriptions
            .get(kind.type_url)
            .cloned()
            .unwrap_or_default();
        let mut request = self.follow_up(&kind, &route).await?;

        match route.mode {
            // a single empty name unsubscribes from everything
            ProtocolMode::StateOfTheWorld => request.resource_names = vec![String::new()],
            ProtocolMode::Incremental => {
                request.resource_names_unsubscribe = if current.is_empty() {
                    vec!["*".to_string()]
                } else {
                    current
                };
            }
        }
        self.active_conversation(&route)?.send(request).await?;
        self.subscriptions.remove(kind.type_url);
        tokio::time::sleep(self.config.quiet_period).await;
        Ok(())
    }

    /// Waits until exactly `names` arrive for `kind` at `version`.
    ///
    /// State-of-the-world responses must deliver the whole set in one
    /// response; incremental responses may spread it over several.
    pub async fn wait_for_resources(
        &mut self,
        kind: &str,
        names: &[String],
        version: &str,
    ) -> Result<(), SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let expectation = Expectation::Resources {
            names: names.iter().cloned().collect(),
            version: version.to_string(),
            kind,
        };
        self.poll(&expectation).await
    }

    /// Waits for a single response for `kind` at `version` that holds
    /// exactly `names`.
    pub async fn wait_for_only_resources(
        &mut self,
        kind: &str,
        names: &[String],
        version: &str,
    ) -> Result<(), SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let expectation = Expectation::OnlyResources {
            names: names.iter().cloned().collect(),
            version: version.to_string(),
            kind,
        };
        self.poll(&expectation).await
    }

    /// Waits until the latest response for `kind` has been acknowledged and
    /// returns the acknowledging request.
    pub async fn wait_for_ack(&mut self, kind: &str) -> Result<DiscoveryRequest, SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let route = self.route_for(&kind);
        self.poll(&Expectation::Ack { kind: kind.clone() }).await?;

        let cache = self.active_conversation(&route)?.cache().await;
        cache
            .last_response_for(kind.type_url)
            .and_then(|last| {
                cache
                    .requests
                    .iter()
                    .rev()
                    .find(|request| request.response_nonce == last.nonce)
                    .cloned()
            })
            .ok_or_else(|| SessionError::NoResponse(kind.service.to_string()))
    }

    /// Listens for the quiet period and fails if any response for `version`
    /// of `kind` arrived.
    pub async fn expect_no_response(&mut self, kind: &str, version: &str) -> Result<(), SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let route = self.route_for(&kind);
        tokio::time::sleep(self.config.quiet_period).await;

        let conversation = self.conversation_mut(&route)?;
        if let Some(error) = conversation.try_next_error() {
            return Err(error.into());
        }
        let id = conversation.id().to_string();
        if self
            .audit
            .has_no_responses_for_version(&id, version, kind.type_url)
            .await?
        {
            Ok(())
        } else {
            Err(SessionError::UnexpectedResponse {
                version: version.to_string(),
                type_url: kind.type_url.to_string(),
            })
        }
    }

    /// Terminates the conversation carrying `kind` and reports whether a
    /// request was still unanswered when it closed.
    #[tracing::instrument(name = "xds_runner.session.terminate_conversation", skip(self), fields(session = %self.id))]
    pub async fn terminate_conversation(&mut self, kind: &str) -> Result<bool, SessionError> {
        let kind = self.registry.lookup(kind)?.clone();
        let route = self.route_for(&kind);
        let conversation = self
            .conversations
            .get_mut(route.method)
            .ok_or_else(|| SessionError::NoConversation(route.label.to_string()))?;
        conversation.terminate().await?;
        let id = conversation.id().to_string();
        Ok(self.audit.pending_request_outstanding(&id).await?)
    }

    /// Terminates every conversation and clears the node's state on the
    /// target. Every step runs even when an earlier one fails.
    #[tracing::instrument(name = "xds_runner.session.teardown", skip(self), fields(session = %self.id))]
    pub async fn teardown(&mut self) -> Result<(), SessionError> {
        let mut first_error: Option<SessionError> = None;
        for conversation in self.conversations.values_mut() {
            if let Err(error) = conversation.terminate().await {
                tracing::warn!(id = conversation.id(), error = %error, "conversation did not terminate cleanly");
                first_error.get_or_insert(error.into());
            }
        }
        if let Some(adapter) = self.adapter.clone() {
            match adapter.clear_state(&self.config.node_id).await {
                Ok(reply) => tracing::debug!(reply = %reply, "target state cleared"),
                Err(error) => {
                    tracing::warn!(error = %error, "cannot clear target state");
                    first_error.get_or_insert(error.into());
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Snapshot of the cache of the conversation carrying `kind`.
    pub async fn cache(&self, kind: &str) -> Result<SessionCache, SessionError> {
        let kind = self.registry.lookup(kind)?;
        let route = self.route_for(kind);
        Ok(self.conversation(&route)?.cache().await)
    }

    pub fn conversation_id(&self, kind: &str) -> Option<String> {
        let kind = self.registry.lookup(kind).ok()?;
        let route = self.route_for(kind);
        self.conversations
            .get(route.method)
            .map(|conversation| conversation.id().to_string())
    }

    fn route_for(&self, kind: &ResourceKind) -> StreamRoute {
        kind.route(self.config.variant, self.config.stream_deadline)
    }

    fn adapter(&self) -> Result<Arc<dyn CompanionAdapter>, SessionError> {
        self.adapter
            .clone()
            .ok_or(SessionError::NotConnected(ConnectionRole::Adapter))
    }

    fn require_state(&self) -> Result<&Snapshot, SessionError> {
        self.current_state()
            .ok_or_else(|| SessionError::NoState(self.config.node_id.clone()))
    }

    fn active_conversation(&self, route: &StreamRoute) -> Result<&Conversation, SessionError> {
        self.conversations
            .get(route.method)
            .filter(|conversation| conversation.is_streaming())
            .ok_or_else(|| SessionError::NoConversation(route.label.to_string()))
    }

    fn conversation(&self, route: &StreamRoute) -> Result<&Conversation, SessionError> {
        self.conversations
            .get(route.method)
            .ok_or_else(|| SessionError::NoConversation(route.label.to_string()))
    }

    fn conversation_mut(
        &mut self,
        route: &StreamRoute,
    ) -> Result<&mut Conversation, SessionError> {
        self.conversations
            .get_mut(route.method)
            .ok_or_else(|| SessionError::NoConversation(route.label.to_string()))
    }

    /// Follow-up request for `kind` echoing the latest response of its type.
    async fn follow_up(
        &self,
        kind: &ResourceKind,
        route: &StreamRoute,
    ) -> Result<DiscoveryRequest, SessionError> {
        let cache = self.active_conversation(route)?.cache().await;
        let last = cache
            .last_response_for(kind.type_url)
            .ok_or_else(|| SessionError::NoResponse(kind.service.to_string()))?;
        Ok(DiscoveryRequest {
            version_info: last.version_info.clone(),
            node_id: self.config.node_id.clone(),
            type_url: kind.type_url.to_string(),
            response_nonce: last.nonce.clone(),
            ..DiscoveryRequest::default()
        })
    }

    async fn start_conversation(
        &mut self,
        route: &StreamRoute,
        initial: DiscoveryRequest,
    ) -> Result<(), SessionError> {
        let transport = self
            .target
            .clone()
            .ok_or(SessionError::NotConnected(ConnectionRole::Target))?;
        if let Some(mut stale) = self.conversations.remove(route.method) {
            stale.terminate().await?;
        }

        let id = format!("{}/{}-{}", self.id, route.label, self.next_conversation);
        self.next_conversation += 1;
        let conversation = Conversation::start(
            ConversationConfig {
                id,
                node_id: self.config.node_id.clone(),
                route: route.clone(),
                drain_timeout: self.config.drain_timeout,
            },
            self.registry.clone(),
            self.audit.clone(),
            transport,
            initial,
        )
        .await?;
        self.conversations.insert(route.method, conversation);
        Ok(())
    }

    /// Re-evaluates `expectation` every poll interval until it holds, an
    /// error is queued on the conversation, or the step timeout elapses.
    async fn poll(&mut self, expectation: &Expectation) -> Result<(), SessionError> {
        let route = self.route_for(expectation.kind());
        let deadline = Instant::now() + self.config.step_timeout;
        loop {
            if let Some(error) = self.conversation_mut(&route)?.try_next_error() {
                return Err(error.into());
            }
            if self.evaluate(&route, expectation).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout {
                    expectation: expectation.to_string(),
                    timeout: self.config.step_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn evaluate(
        &self,
        route: &StreamRoute,
        expectation: &Expectation,
    ) -> Result<bool, SessionError> {
        let conversation = self.conversation(route)?;
        let builder = AckBuilder::new(self.registry.clone(), route.mode);
        match expectation {
            Expectation::Resources {
                kind,
                names,
                version,
            } if route.mode == ProtocolMode::StateOfTheWorld => {
                let expected: Vec<String> = names.iter().cloned().collect();
                Ok(self
                    .audit
                    .has_expected_resources(conversation.id(), version, kind.type_url, &expected)
                    .await?)
            }
            Expectation::Resources {
                kind,
                names,
                version,
            } => {
                let cache = conversation.cache().await;
                let mut received = BTreeSet::new();
                for response in responses_at(&cache, kind.type_url, version) {
                    received.extend(builder.resource_names(response)?);
                    for removed in &response.removed_resources {
                        received.remove(removed);
                    }
                }
                Ok(&received == names)
            }
            Expectation::OnlyResources {
                kind,
                names,
                version,
            } => {
                let cache = conversation.cache().await;
                for response in responses_at(&cache, kind.type_url, version) {
                    let received: BTreeSet<String> =
                        builder.resource_names(response)?.into_iter().collect();
                    if &received == names {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expectation::Ack { kind } => {
                let cache = conversation.cache().await;
                Ok(cache
                    .last_response_for(kind.type_url)
                    .is_some_and(|last| cache.is_acknowledged(&last.nonce)))
            }
        }
    }
}

/// What a waiting step polls for.
#[derive(Debug)]
enum Expectation {
    Resources {
        kind: ResourceKind,
        names: BTreeSet<String>,
        version: String,
    },
    OnlyResources {
        kind: ResourceKind,
        names: BTreeSet<String>,
        version: String,
    },
    Ack {
        kind: ResourceKind,
    },
}

impl Expectation {
    fn kind(&self) -> &ResourceKind {
        match self {
            Self::Resources { kind, .. } | Self::OnlyResources { kind, .. } | Self::Ack { kind } => {
                kind
            }
        }
    }
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resources {
                kind,
                names,
                version,
            } => write!(f, "{} {names:?} at version {version}", kind.service),
            Self::OnlyResources {
                kind,
                names,
                version,
            } => write!(f, "only {} {names:?} at version {version}", kind.service),
            Self::Ack { kind } => write!(
                f,
                "an acknowledgement for the latest {} response",
                kind.service
            ),
        }
    }
}

fn responses_at<'a>(
    cache: &'a SessionCache,
    type_url: &'a str,
    version: &'a str,
) -> impl Iterator<Item = &'a DiscoveryResponse> + 'a {
    cache
        .responses
        .iter()
        .filter(move |response| response.type_url == type_url && response.version_info == version)
}

fn next_id(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let value = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{prefix}-{now_ns}-{value}")
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionConfig, SessionError};
    use crate::binding::KindRegistry;
    use crate::connector::ConnectionRole;
    use crate::memory::{AdapterCall, InMemoryConnector, InMemoryControlPlane};
    use std::sync::Arc;
    use std::time::Duration;
    use xds_audit::{AuditLog, Direction, InMemoryAuditLog};
    use xds_types::{type_url, Variant};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn config(variant: Variant) -> SessionConfig {
        SessionConfig {
            variant,
            step_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            quiet_period: Duration::from_millis(100),
            ..SessionConfig::default()
        }
    }

    fn session_with(
        config: SessionConfig,
        connector: InMemoryConnector,
    ) -> (Session, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let session = Session::new(
            config,
            Arc::new(KindRegistry::standard()),
            Arc::new(connector),
            audit.clone(),
        )
        .expect("session");
        (session, audit)
    }

    async fn connected(variant: Variant) -> (Session, Arc<InMemoryControlPlane>, Arc<InMemoryAuditLog>) {
        let plane = Arc::new(InMemoryControlPlane::new());
        let (mut session, audit) =
            session_with(config(variant), InMemoryConnector::new(plane.clone()));
        session.connect_all().await.expect("connect");
        (session, plane, audit)
    }

    #[test]
    fn default_config_targets_local_ports() {
        let config = SessionConfig::default();
        assert_eq!(config.target_address, ":18000");
        assert_eq!(config.adapter_address, ":17000");
        assert_eq!(config.node_id, "test-id");
        assert!(config.validate().is_ok());

        let invalid = SessionConfig {
            node_id: " ".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            invalid.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
        let invalid = SessionConfig {
            poll_interval: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(matches!(
            invalid.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn wildcard_subscription_tracks_versions_and_leaves_last_ack_unanswered() {
        let (mut session, _plane, audit) = connected(Variant::SotwNonAggregated).await;
        let all = names(&["tui", "kaka", "kakapo"]);

        session.program_state(&all, "1").await.expect("program");
        session.subscribe("CDS", &[]).await.expect("subscribe");
        session
            .wait_for_resources("CDS", &all, "1")
            .await
            .expect("version 1");
        session.wait_for_ack("CDS").await.expect("ack 1");

        session.update_state("2").await.expect("update");
        session
            .wait_for_resources("CDS", &all, "2")
            .await
            .expect("version 2");
        let ack = session.wait_for_ack("CDS").await.expect("ack 2");
        assert_eq!(ack.version_info, "2");
        assert_eq!(ack.response_nonce, "2");

        let id = session.conversation_id("CDS").expect("conversation");
        assert!(session
            .terminate_conversation("CDS")
            .await
            .expect("terminate"));

        let records = audit.records(&id).await.expect("records");
        let sent = records
            .iter()
            .filter(|record| record.direction == Direction::Sent)
            .count();
        assert_eq!(sent, 3);
        assert_eq!(records.len() - sent, 2);
    }

    #[tokio::test]
    async fn incremental_subscription_update_delivers_only_added_names() {
        let (mut session, _plane, _audit) = connected(Variant::IncrementalNonAggregated).await;
        session
            .program_state(&names(&["tui", "kaka", "kakapo"]), "1")
            .await
            .expect("program");

        session.subscribe("CDS", &names(&["tui"])).await.expect("subscribe");
        session
            .wait_for_resources("CDS", &names(&["tui"]), "1")
            .await
            .expect("tui");
        session.wait_for_ack("CDS").await.expect("ack");

        session
            .update_subscription("CDS", &names(&["tui", "kaka"]))
            .await
            .expect("update subscription");
        session
            .wait_for_only_resources("CDS", &names(&["kaka"]), "1")
            .await
            .expect("only kaka");
        session
            .wait_for_resources("CDS", &names(&["tui", "kaka"]), "1")
            .await
            .expect("union");
    }

    #[tokio::test]
    async fn unsubscribed_kind_receives_nothing_for_new_versions() {
        let (mut session, _plane, _audit) = connected(Variant::SotwNonAggregated).await;
        let all = names(&["tui", "kaka"]);
        session.program_state(&all, "1").await.expect("program");
        session.subscribe("LDS", &[]).await.expect("subscribe");
        session
            .wait_for_resources("LDS", &all, "1")
            .await
            .expect("version 1");
        session.wait_for_ack("LDS").await.expect("ack");

        session.unsubscribe_all("LDS").await.expect("unsubscribe");
        session.update_state("2").await.expect("update");
        session
            .expect_no_response("LDS", "2")
            .await
            .expect("nothing for version 2");
    }

    #[tokio::test]
    async fn aggregated_kinds_share_one_stream() {
        let (mut session, plane, _audit) = connected(Variant::SotwAggregated).await;
        let all = names(&["tui"]);
        session.program_state(&all, "1").await.expect("program");

        session.subscribe("CDS", &[]).await.expect("cds");
        session
            .wait_for_resources("CDS", &all, "1")
            .await
            .expect("cds resources");
        session.subscribe("LDS", &[]).await.expect("lds");
        session
            .wait_for_resources("LDS", &all, "1")
            .await
            .expect("lds resources");

        assert_eq!(plane.opened_routes().await.len(), 1);
        assert_eq!(session.conversation_id("CDS"), session.conversation_id("LDS"));
    }

    #[tokio::test]
    async fn waiting_for_a_missing_version_times_out() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let (mut session, _audit) = session_with(
            SessionConfig {
                step_timeout: Duration::from_millis(150),
                ..config(Variant::SotwNonAggregated)
            },
            InMemoryConnector::new(plane),
        );
        session.connect_all().await.expect("connect");
        session
            .program_state(&names(&["tui"]), "1")
            .await
            .expect("program");
        session.subscribe("RDS", &[]).await.expect("subscribe");

        let error = session
            .wait_for_resources("RDS", &names(&["tui"]), "7")
            .await
            .err()
            .expect("timeout");
        assert!(matches!(error, SessionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn undecodable_resources_fail_the_step_and_are_nacked() {
        let (mut session, plane, _audit) = connected(Variant::SotwNonAggregated).await;
        plane.serve_malformed(type_url::CLUSTER).await;
        session
            .program_state(&names(&["tui"]), "1")
            .await
            .expect("program");
        session.subscribe("CDS", &[]).await.expect("subscribe");

        let error = session
            .wait_for_resources("CDS", &names(&["tui"]), "1")
            .await
            .err()
            .expect("undecodable response");
        assert!(
            matches!(error, SessionError::Conversation(_) | SessionError::Audit(_)),
            "{error}"
        );

        let mut nack = None;
        for _ in 0..100 {
            nack = session
                .cache("CDS")
                .await
                .expect("cache")
                .requests
                .into_iter()
                .find(|request| request.is_nack());
            if nack.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let nack = nack.expect("nack");
        assert_eq!(nack.response_nonce, "1");
        assert!(nack.version_info.is_empty());
        session.teardown().await.expect("teardown");
    }

    #[tokio::test]
    async fn teardown_closes_conversations_and_clears_state() {
        let (mut session, plane, _audit) = connected(Variant::SotwNonAggregated).await;
        session
            .program_state(&names(&["tui"]), "1")
            .await
            .expect("program");
        session.subscribe("CDS", &[]).await.expect("subscribe");
        session.teardown().await.expect("teardown");

        assert_eq!(
            plane.adapter_calls().await.last(),
            Some(&AdapterCall::ClearState("test-id".to_string()))
        );
        let error = session
            .update_subscription("CDS", &names(&["tui"]))
            .await
            .err()
            .expect("closed");
        assert!(matches!(error, SessionError::NoConversation(_)));
    }

    #[tokio::test]
    async fn fresh_session_keeps_connections_but_no_state() {
        let (mut session, _plane, _audit) = connected(Variant::SotwNonAggregated).await;
        session
            .program_state(&names(&["tui"]), "1")
            .await
            .expect("program");

        let mut fresh = session.fresh();
        assert!(fresh.is_connected());
        assert_ne!(fresh.id(), session.id());
        assert!(fresh.current_state().is_none());
        assert!(matches!(
            fresh.update_state("2").await,
            Err(SessionError::NoState(_))
        ));
        assert!(fresh.conversation_id("CDS").is_none());
    }

    #[tokio::test]
    async fn operations_require_connections() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let (mut session, _audit) = session_with(
            config(Variant::SotwNonAggregated),
            InMemoryConnector::new(plane).refuse(":18000"),
        );
        assert!(matches!(
            session.program_state(&names(&["tui"]), "1").await,
            Err(SessionError::NotConnected(ConnectionRole::Adapter))
        ));
        assert!(matches!(
            session.subscribe("CDS", &[]).await,
            Err(SessionError::NotConnected(ConnectionRole::Target))
        ));
        assert!(matches!(
            session.connect_all().await,
            Err(SessionError::Connection(_))
        ));
        assert!(matches!(
            session.subscribe("XDS", &[]).await,
            Err(SessionError::Binding(_))
        ));
    }
}
