//! The conversation engine: one bidirectional discovery stream, its
//! channel bundle and the tasks that drive the ACK handshake.
//!
//! A conversation owns four queues. The outbound queue carries requests
//! issued by the session, the inbound queue carries responses read off the
//! stream, the error queue surfaces every failure, and a `watch` flag is
//! the termination signal. Two tasks run per conversation: the receive task
//! reads the stream and records every response, and the control task
//! acknowledges each response before it looks at the next one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use xds_audit::{AuditError, AuditLog, Direction};
use xds_types::{ConversationState, DiscoveryRequest, DiscoveryResponse, StatusTransitionError};

use crate::ack::{build_nack, build_pass_through_ack, AckBuilder, ParseError};
use crate::binding::{KindRegistry, StreamRoute};
use crate::transport::{DiscoveryTransport, ResponseStream, StreamError};

const QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    State(#[from] StatusTransitionError),
    #[error("conversation {id} is {state:?} and cannot send requests")]
    NotStreaming { id: String, state: ConversationState },
}

/// Everything sent and received on one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCache {
    pub requests: Vec<DiscoveryRequest>,
    pub responses: Vec<DiscoveryResponse>,
    /// Names of the first subscription request.
    pub initial_resources: Vec<String>,
}

impl SessionCache {
    pub fn last_response_for(&self, type_url: &str) -> Option<&DiscoveryResponse> {
        self.responses
            .iter()
            .rev()
            .find(|response| response.type_url == type_url)
    }

    /// True once a request acknowledging `nonce` has been sent.
    pub fn is_acknowledged(&self, nonce: &str) -> bool {
        self.requests
            .iter()
            .any(|request| request.response_nonce == nonce)
    }
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub id: String,
    pub node_id: String,
    pub route: StreamRoute,
    /// Bound on joining the tasks once termination is signalled.
    pub drain_timeout: Duration,
}

pub struct Conversation {
    id: String,
    route: StreamRoute,
    state: Arc<watch::Sender<ConversationState>>,
    cache: Arc<Mutex<SessionCache>>,
    outbound: Option<mpsc::Sender<DiscoveryRequest>>,
    errors: mpsc::UnboundedReceiver<ConversationError>,
    done: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("state", &self.state())
            .finish()
    }
}

impl Conversation {
    /// Opens the stream, sends `initial` and starts the engine tasks.
    ///
    /// `initial` is queued before the stream is opened: a target may hold
    /// back its response headers until the first request arrives. Opening is
    /// bounded by the route's stream deadline.
    #[tracing::instrument(
        name = "xds_runner.conversation.start",
        skip(config, registry, audit, transport, initial),
        fields(id = %config.id, method = config.route.method)
    )]
    pub async fn start(
        config: ConversationConfig,
        registry: Arc<KindRegistry>,
        audit: Arc<dyn AuditLog>,
        transport: Arc<dyn DiscoveryTransport>,
        initial: DiscoveryRequest,
    ) -> Result<Self, ConversationError> {
        let state = Arc::new(watch::Sender::new(ConversationState::Idle));
        let cache = Arc::new(Mutex::new(SessionCache {
            initial_resources: initial.resource_names.clone(),
            ..SessionCache::default()
        }));
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let (done, done_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (sink, stream_requests) = mpsc::channel(QUEUE_CAPACITY);
        sink.send(initial.clone())
            .await
            .map_err(|_| StreamError::SendClosed)?;

        let opened = tokio::time::timeout(
            config.route.deadline,
            transport.open_stream(&config.route, stream_requests),
        )
        .await;
        let responses = match opened {
            Ok(Ok(responses)) => responses,
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => {
                tracing::warn!(id = %config.id, method = config.route.method, "stream did not open in time");
                return Err(StreamError::DeadlineElapsed(config.route.deadline).into());
            }
        };
        transition(&state, ConversationState::Streaming)?;

        let outlet = Outlet {
            id: config.id.clone(),
            audit: audit.clone(),
            cache: cache.clone(),
            errors: errors_tx.clone(),
            sink,
        };
        outlet.record(&initial).await;

        let receive = tokio::spawn(receive_loop(
            ReceiveContext {
                id: config.id.clone(),
                registry: registry.clone(),
                audit,
                cache: cache.clone(),
                inbound: inbound_tx,
                errors: errors_tx.clone(),
                state: state.clone(),
                deadline: config.route.deadline,
            },
            responses,
        ));
        let control = tokio::spawn(control_loop(
            ControlContext {
                node_id: config.node_id,
                builder: AckBuilder::new(registry, config.route.mode),
                outlet,
                errors: errors_tx,
            },
            inbound_rx,
            outbound_rx,
            done_rx,
        ));

        tracing::info!(id = %config.id, label = config.route.label, "conversation streaming");
        Ok(Self {
            id: config.id,
            route: config.route,
            state,
            cache,
            outbound: Some(outbound_tx),
            errors,
            done,
            tasks: vec![receive, control],
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &StreamRoute {
        &self.route
    }

    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == ConversationState::Streaming
    }

    /// Queues a session-originated request, such as a subscription change.
    pub async fn send(&self, request: DiscoveryRequest) -> Result<(), ConversationError> {
        let state = self.state();
        let outbound = match (&self.outbound, state) {
            (Some(outbound), ConversationState::Streaming) => outbound,
            _ => {
                return Err(ConversationError::NotStreaming {
                    id: self.id.clone(),
                    state,
                })
            }
        };
        outbound
            .send(request)
            .await
            .map_err(|_| ConversationError::Stream(StreamError::SendClosed))
    }

    pub async fn cache(&self) -> SessionCache {
        self.cache.lock().await.clone()
    }

    /// Next queued error, if any, without waiting.
    pub fn try_next_error(&mut self) -> Option<ConversationError> {
        self.errors.try_recv().ok()
    }

    /// Signals termination, closes the outbound queue and waits for both
    /// tasks. Tasks still running after the drain timeout are aborted.
    #[tracing::instrument(name = "xds_runner.conversation.terminate", skip(self), fields(id = %self.id))]
    pub async fn terminate(&mut self) -> Result<(), ConversationError> {
        if self.state() == ConversationState::Streaming {
            transition(&self.state, ConversationState::Draining)?;
        }
        self.done.send_replace(true);
        self.outbound.take();

        let deadline = Instant::now() + self.drain_timeout;
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                tracing::warn!(id = %self.id, "conversation task did not drain in time");
                abort.abort();
            }
        }
        transition(&self.state, ConversationState::Closed)?;
        tracing::debug!(id = %self.id, "conversation closed");
        Ok(())
    }
}

fn transition(
    state: &watch::Sender<ConversationState>,
    next: ConversationState,
) -> Result<(), StatusTransitionError> {
    let mut outcome = Ok(());
    state.send_if_modified(|current| match current.ensure_transition(next) {
        Ok(()) => {
            let changed = *current != next;
            *current = next;
            changed
        }
        Err(error) => {
            outcome = Err(error);
            false
        }
    });
    outcome
}

/// Records and writes requests to the stream.
struct Outlet {
    id: String,
    audit: Arc<dyn AuditLog>,
    cache: Arc<Mutex<SessionCache>>,
    errors: mpsc::UnboundedSender<ConversationError>,
    sink: mpsc::Sender<DiscoveryRequest>,
}

impl Outlet {
    /// Writes `request` to the stream. It is recorded only once a slot on the
    /// stream is reserved, so a closed stream leaves no trace of it.
    async fn send(&self, request: DiscoveryRequest) -> Result<(), StreamError> {
        let permit = self
            .sink
            .reserve()
            .await
            .map_err(|_| StreamError::SendClosed)?;
        self.record(&request).await;
        permit.send(request);
        Ok(())
    }

    async fn record(&self, request: &DiscoveryRequest) {
        match serde_json::to_value(request) {
            Ok(payload) => {
                if let Err(error) = self.audit.record(&self.id, Direction::Sent, payload).await {
                    let _ = self.errors.send(error.into());
                }
            }
            Err(error) => {
                let _ = self.errors.send(AuditError::from(error).into());
            }
        }
        self.cache.lock().await.requests.push(request.clone());
        tracing::debug!(
            id = %self.id,
            type_url = %request.type_url,
            version = %request.version_info,
            nonce = %request.response_nonce,
            nack = request.is_nack(),
            "request sent"
        );
    }
}

struct ReceiveContext {
    id: String,
    registry: Arc<KindRegistry>,
    audit: Arc<dyn AuditLog>,
    cache: Arc<Mutex<SessionCache>>,
    inbound: mpsc::Sender<DiscoveryResponse>,
    errors: mpsc::UnboundedSender<ConversationError>,
    state: Arc<watch::Sender<ConversationState>>,
    deadline: Duration,
}

async fn receive_loop(ctx: ReceiveContext, mut responses: ResponseStream) {
    let deadline = Instant::now() + ctx.deadline;
    loop {
        match tokio::time::timeout_at(deadline, responses.next()).await {
            Err(_) => {
                if *ctx.state.borrow() == ConversationState::Streaming {
                    let _ = ctx
                        .errors
                        .send(StreamError::DeadlineElapsed(ctx.deadline).into());
                }
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                tracing::warn!(id = %ctx.id, error = %error, "discovery stream failed");
                let _ = ctx.errors.send(error.into());
                break;
            }
            Ok(Some(Ok(response))) => {
                tracing::debug!(
                    id = %ctx.id,
                    type_url = %response.type_url,
                    version = %response.version_info,
                    nonce = %response.nonce,
                    resources = response.resources.len(),
                    "response received"
                );
                let payload = audit_payload(&ctx.registry, &response);
                if let Err(error) = ctx.audit.record(&ctx.id, Direction::Received, payload).await {
                    let _ = ctx.errors.send(error.into());
                }
                ctx.cache.lock().await.responses.push(response.clone());
                if ctx.inbound.send(response).await.is_err() {
                    break;
                }
            }
        }
    }

    // a stream that ends or fails on its own is not restartable
    if *ctx.state.borrow() == ConversationState::Streaming {
        let _ = transition(&ctx.state, ConversationState::Closed);
    }
}

struct ControlContext {
    node_id: String,
    builder: AckBuilder,
    outlet: Outlet,
    errors: mpsc::UnboundedSender<ConversationError>,
}

async fn control_loop(
    ctx: ControlContext,
    mut inbound: mpsc::Receiver<DiscoveryResponse>,
    mut outbound: mpsc::Receiver<DiscoveryRequest>,
    mut done: watch::Receiver<bool>,
) {
    let mut accepted_versions: HashMap<String, String> = HashMap::new();
    loop {
        let request = tokio::select! {
            biased;
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    break;
                }
                continue;
            }
            response = inbound.recv() => {
                let Some(response) = response else {
                    break;
                };
                acknowledge(&ctx, &mut accepted_versions, &response)
            }
            request = outbound.recv() => {
                let Some(request) = request else {
                    break;
                };
                request
            }
        };

        if let Err(error) = ctx.outlet.send(request).await {
            let _ = ctx.errors.send(error.into());
            break;
        }
    }
    // dropping the outlet half-closes the stream
}

fn acknowledge(
    ctx: &ControlContext,
    accepted_versions: &mut HashMap<String, String>,
    response: &DiscoveryResponse,
) -> DiscoveryRequest {
    match ctx.builder.build_ack(&ctx.node_id, response) {
        Ok(ack) => {
            accepted_versions.insert(response.type_url.clone(), response.version_info.clone());
            ack
        }
        // kind validity is asserted by scenarios, not enforced on the wire
        Err(ParseError::UnknownKind(type_url)) => {
            tracing::warn!(
                nonce = %response.nonce,
                type_url = %type_url,
                "acknowledging response of an unregistered kind"
            );
            accepted_versions.insert(type_url, response.version_info.clone());
            build_pass_through_ack(&ctx.node_id, response)
        }
        Err(error) => {
            tracing::warn!(
                nonce = %response.nonce,
                type_url = %response.type_url,
                error = %error,
                "rejecting response"
            );
            let last_accepted = accepted_versions
                .get(&response.type_url)
                .map(String::as_str)
                .unwrap_or_default();
            let nack = build_nack(&ctx.node_id, response, last_accepted, &error);
            let _ = ctx.errors.send(error.into());
            nack
        }
    }
}

/// JSON form of a response as stored in the audit log. Resources of a
/// known kind are reduced to their identity; anything else is passed
/// through as an opaque base64 payload.
pub fn audit_payload(registry: &KindRegistry, response: &DiscoveryResponse) -> Value {
    let kind = registry.by_type_url(&response.type_url).ok();
    let resources: Vec<Value> = response
        .resources
        .iter()
        .map(|resource| {
            let type_url = if resource.type_url.is_empty() {
                response.type_url.as_str()
            } else {
                resource.type_url.as_str()
            };
            let mut rendered = Map::new();
            rendered.insert("@type".to_string(), Value::from(type_url));
            match kind.and_then(|kind| Some((kind, kind.identity_of(resource).ok()?))) {
                Some((kind, identity)) => {
                    rendered.insert(kind.identity.json_key().to_string(), Value::from(identity));
                }
                None => {
                    rendered.insert("value".to_string(), Value::from(STANDARD.encode(&resource.value)));
                }
            }
            Value::Object(rendered)
        })
        .collect();

    json!({
        "version_info": response.version_info,
        "type_url": response.type_url,
        "nonce": response.nonce,
        "resources": resources,
        "removed_resources": response.removed_resources,
    })
}
