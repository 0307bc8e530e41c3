//! In-process control plane used to exercise the engine without a network.
//!
//! It behaves like a small conformant server: it answers the first request
//! for a type, a subscription change and a new snapshot version, and never
//! answers a plain ACK or a NACK.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use xds_types::{DiscoveryRequest, DiscoveryResponse, ProtocolMode, ResourceAny, Snapshot};

use crate::adapter::{AdapterError, CompanionAdapter};
use crate::binding::StreamRoute;
use crate::connector::{ConnectionError, ConnectionRole, Connector};
use crate::transport::{DiscoveryTransport, ResponseStream, StreamError};

/// A call received on the adapter surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    SetState(Snapshot),
    UpdateState(Snapshot),
    ClearState(String),
}

#[derive(Debug, Default)]
struct PlaneState {
    snapshots: HashMap<String, Snapshot>,
    calls: Vec<AdapterCall>,
    opened_routes: Vec<&'static str>,
    stream_failure: Option<StreamError>,
    malformed_types: HashSet<String>,
}

#[derive(Debug)]
pub struct InMemoryControlPlane {
    state: Arc<Mutex<PlaneState>>,
    generation: watch::Sender<u64>,
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlaneState::default())),
            generation: watch::Sender::new(0),
        }
    }
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter call so far, in order.
    pub async fn adapter_calls(&self) -> Vec<AdapterCall> {
        self.state.lock().await.calls.clone()
    }

    /// Methods of every stream opened so far.
    pub async fn opened_routes(&self) -> Vec<&'static str> {
        self.state.lock().await.opened_routes.clone()
    }

    pub async fn snapshot(&self, node_id: &str) -> Option<Snapshot> {
        self.state.lock().await.snapshots.get(node_id).cloned()
    }

    /// Fails every stream opened from now on with `error` once the first
    /// request arrives.
    pub async fn fail_streams_with(&self, error: StreamError) {
        self.state.lock().await.stream_failure = Some(error);
    }

    /// Serves undecodable payloads for `type_url`.
    pub async fn serve_malformed(&self, type_url: &str) {
        self.state
            .lock()
            .await
            .malformed_types
            .insert(type_url.to_string());
    }

    async fn store(&self, call: AdapterCall) {
        let mut state = self.state.lock().await;
        match &call {
            AdapterCall::SetState(snapshot) | AdapterCall::UpdateState(snapshot) => {
                state
                    .snapshots
                    .insert(snapshot.node.clone(), snapshot.clone());
            }
            AdapterCall::ClearState(node_id) => {
                state.snapshots.remove(node_id);
            }
        }
        state.calls.push(call);
        drop(state);
        self.generation.send_modify(|generation| *generation += 1);
    }
}

#[async_trait]
impl CompanionAdapter for InMemoryControlPlane {
    async fn set_state(&self, snapshot: &Snapshot) -> Result<String, AdapterError> {
        self.store(AdapterCall::SetState(snapshot.clone())).await;
        Ok(format!("state set for {}", snapshot.node))
    }

    async fn update_state(&self, snapshot: &Snapshot) -> Result<String, AdapterError> {
        self.store(AdapterCall::UpdateState(snapshot.clone())).await;
        Ok(format!("state updated for {}", snapshot.node))
    }

    async fn clear_state(&self, node_id: &str) -> Result<String, AdapterError> {
        self.store(AdapterCall::ClearState(node_id.to_string()))
            .await;
        Ok(format!("state cleared for {node_id}"))
    }
}

#[async_trait]
impl DiscoveryTransport for InMemoryControlPlane {
    async fn open_stream(
        &self,
        route: &StreamRoute,
        requests: mpsc::Receiver<DiscoveryRequest>,
    ) -> Result<ResponseStream, StreamError> {
        let failure = {
            let mut state = self.state.lock().await;
            state.opened_routes.push(route.method);
            state.stream_failure.clone()
        };
        let (responses, stream) = mpsc::channel(16);
        let server = StreamServer {
            state: self.state.clone(),
            mode: route.mode,
            subscriptions: BTreeMap::new(),
            node_id: String::new(),
            next_nonce: 1,
        };
        tokio::spawn(server.serve(requests, self.generation.subscribe(), responses, failure));
        Ok(ReceiverStream::new(stream).boxed())
    }
}

#[derive(Debug, Default)]
struct Subscription {
    wildcard: bool,
    names: Vec<String>,
    active: bool,
    last_version: Option<String>,
    /// Names carried by each response, keyed by nonce.
    sent: HashMap<String, BTreeSet<String>>,
}

impl Subscription {
    fn wants(&self, name: &str) -> bool {
        self.wildcard || self.names.iter().any(|wanted| wanted == name)
    }
}

struct StreamServer {
    state: Arc<Mutex<PlaneState>>,
    mode: ProtocolMode,
    subscriptions: BTreeMap<String, Subscription>,
    node_id: String,
    next_nonce: u64,
}

impl StreamServer {
    async fn serve(
        mut self,
        mut requests: mpsc::Receiver<DiscoveryRequest>,
        mut generation: watch::Receiver<u64>,
        responses: mpsc::Sender<Result<DiscoveryResponse, StreamError>>,
        mut failure: Option<StreamError>,
    ) {
        loop {
            let outgoing = tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    if let Some(error) = failure.take() {
                        let _ = responses.send(Err(error)).await;
                        break;
                    }
                    self.handle_request(request).await
                }
                changed = generation.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.handle_state_change().await
                }
            };
            for response in outgoing {
                if responses.send(Ok(response)).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: DiscoveryRequest) -> Vec<DiscoveryResponse> {
        if !request.node_id.is_empty() {
            self.node_id = request.node_id.clone();
        }
        if request.is_nack() {
            return Vec::new();
        }
        let type_url = request.type_url.clone();
        let subscription = self.subscriptions.entry(type_url.clone()).or_default();

        let added = match self.mode {
            ProtocolMode::StateOfTheWorld => {
                if request.resource_names == [String::new()] {
                    *subscription = Subscription::default();
                    return Vec::new();
                }
                // an ACK echoes the names of the response it acknowledges;
                // only a different name set is a subscription change
                let requested: BTreeSet<String> = request.resource_names.iter().cloned().collect();
                let subscribed: BTreeSet<String> = subscription.names.iter().cloned().collect();
                let echoed = subscription.sent.get(&request.response_nonce) == Some(&requested);
                let changed = !subscription.active
                    || request.is_initial()
                    || (requested != subscribed && !echoed);
                if !changed {
                    return Vec::new();
                }
                subscription.active = true;
                subscription.wildcard = request.resource_names.is_empty();
                subscription.names = request.resource_names.clone();
                None
            }
            ProtocolMode::Incremental => {
                if request.is_initial() {
                    subscription.active = true;
                    subscription.wildcard = request.resource_names.is_empty();
                    subscription.names = request.resource_names.clone();
                    None
                } else {
                    let unsubscribe = &request.resource_names_unsubscribe;
                    if unsubscribe.iter().any(|name| name == "*" || name.is_empty()) {
                        *subscription = Subscription::default();
                    } else {
                        subscription
                            .names
                            .retain(|name| !unsubscribe.contains(name));
                    }
                    let added: Vec<String> = request
                        .resource_names
                        .iter()
                        .filter(|name| !subscription.names.contains(name))
                        .cloned()
                        .collect();
                    if added.is_empty() {
                        return Vec::new();
                    }
                    subscription.active = true;
                    subscription.names.extend(added.iter().cloned());
                    Some(added)
                }
            }
        };

        let state = self.state.lock().await;
        let Some(snapshot) = state.snapshots.get(&self.node_id).cloned() else {
            return Vec::new();
        };
        let malformed = state.malformed_types.contains(&type_url);
        drop(state);
        self.respond(&type_url, &snapshot, added.as_deref(), malformed)
            .into_iter()
            .collect()
    }

    async fn handle_state_change(&mut self) -> Vec<DiscoveryResponse> {
        let state = self.state.lock().await;
        let Some(snapshot) = state.snapshots.get(&self.node_id).cloned() else {
            return Vec::new();
        };
        let malformed_types = state.malformed_types.clone();
        drop(state);

        let stale: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, subscription)| {
                subscription.active
                    && subscription.last_version.as_deref() != Some(snapshot.version.as_str())
            })
            .map(|(type_url, _)| type_url.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|type_url| {
                let malformed = malformed_types.contains(&type_url);
                self.respond(&type_url, &snapshot, None, malformed)
            })
            .collect()
    }

    /// Builds a response for `type_url` restricted to `only` when given,
    /// otherwise to the whole subscription.
    fn respond(
        &mut self,
        type_url: &str,
        snapshot: &Snapshot,
        only: Option<&[String]>,
        malformed: bool,
    ) -> Option<DiscoveryResponse> {
        let subscription = self.subscriptions.get_mut(type_url)?;
        let names: Vec<String> = snapshot
            .resource_names
            .iter()
            .filter(|name| subscription.wants(name))
            .filter(|name| only.map_or(true, |only| only.contains(*name)))
            .cloned()
            .collect();
        let resources = names
            .iter()
            .map(|name| {
                if malformed {
                    ResourceAny {
                        type_url: type_url.to_string(),
                        value: vec![0x0a, 0xff],
                    }
                } else {
                    ResourceAny::named(type_url, name.clone())
                }
            })
            .collect();

        let nonce = self.next_nonce.to_string();
        self.next_nonce += 1;
        subscription.last_version = Some(snapshot.version.clone());
        subscription
            .sent
            .insert(nonce.clone(), names.into_iter().collect());
        Some(DiscoveryResponse {
            version_info: snapshot.version.clone(),
            type_url: type_url.to_string(),
            resources,
            removed_resources: Vec::new(),
            nonce,
        })
    }
}

/// Hands out the same in-memory plane for both roles. Addresses marked
/// unreachable fail to connect.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    plane: Arc<InMemoryControlPlane>,
    unreachable: HashSet<String>,
    delay: Option<Duration>,
}

impl InMemoryConnector {
    pub fn new(plane: Arc<InMemoryControlPlane>) -> Self {
        Self {
            plane,
            unreachable: HashSet::new(),
            delay: None,
        }
    }

    pub fn refuse(mut self, address: impl Into<String>) -> Self {
        self.unreachable.insert(address.into());
        self
    }

    /// Delays every dial, to exercise dial timeouts.
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn dial(
        &self,
        role: ConnectionRole,
        address: &str,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        if let Some(delay) = self.delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Err(ConnectionError::Timeout {
                    role,
                    address: address.to_string(),
                    timeout,
                });
            }
        }
        if self.unreachable.contains(address) {
            return Err(ConnectionError::Unreachable {
                role,
                address: address.to_string(),
                detail: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect_target(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn DiscoveryTransport>, ConnectionError> {
        self.dial(ConnectionRole::Target, address, timeout).await?;
        Ok(self.plane.clone())
    }

    async fn connect_adapter(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn CompanionAdapter>, ConnectionError> {
        self.dial(ConnectionRole::Adapter, address, timeout).await?;
        Ok(self.plane.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{AdapterCall, InMemoryConnector, InMemoryControlPlane};
    use crate::adapter::CompanionAdapter;
    use crate::binding::KindRegistry;
    use crate::connector::{ConnectionError, Connector};
    use crate::transport::DiscoveryTransport;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xds_types::{type_url, DiscoveryRequest, Snapshot, Variant};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn answers_initial_request_and_new_versions_but_not_acks() {
        let plane = InMemoryControlPlane::new();
        plane
            .set_state(&Snapshot::new("node-a", "1", names(&["tui", "kaka"])))
            .await
            .expect("set state");

        let route = KindRegistry::standard()
            .route("LDS", Variant::SotwNonAggregated, Duration::from_secs(5))
            .expect("route");
        let (tx, rx) = mpsc::channel(4);
        let mut stream = plane.open_stream(&route, rx).await.expect("open");

        tx.send(DiscoveryRequest::subscribe("node-a", type_url::LISTENER, Vec::new()))
            .await
            .expect("send");
        let first = stream.next().await.expect("item").expect("response");
        assert_eq!(first.version_info, "1");
        assert_eq!(first.nonce, "1");
        assert_eq!(first.resources.len(), 2);

        let mut ack = DiscoveryRequest::subscribe("node-a", type_url::LISTENER, Vec::new());
        ack.version_info = "1".to_string();
        ack.response_nonce = "1".to_string();
        tx.send(ack).await.expect("send ack");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err(),
            "a plain ACK must not be answered"
        );

        plane
            .update_state(&Snapshot::new("node-a", "2", names(&["tui", "kaka"])))
            .await
            .expect("update");
        let second = stream.next().await.expect("item").expect("response");
        assert_eq!(second.version_info, "2");
        assert_eq!(second.nonce, "2");

        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn clear_state_is_recorded() {
        let plane = InMemoryControlPlane::new();
        plane.clear_state("node-a").await.expect("clear");
        assert_eq!(
            plane.adapter_calls().await,
            vec![AdapterCall::ClearState("node-a".to_string())]
        );
        assert!(plane.snapshot("node-a").await.is_none());
    }

    #[tokio::test]
    async fn connector_refuses_marked_addresses() {
        let connector =
            InMemoryConnector::new(Arc::new(InMemoryControlPlane::new())).refuse(":17000");
        let error = connector
            .connect_target(":17000", Duration::from_millis(10))
            .await
            .err()
            .expect("refused");
        assert!(matches!(error, ConnectionError::Unreachable { .. }));
        assert!(connector
            .connect_adapter(":17001", Duration::from_millis(10))
            .await
            .is_ok());
    }
}
