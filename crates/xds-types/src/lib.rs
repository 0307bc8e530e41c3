//! Shared data types for the xDS conformance harness.
//!
//! Holds the crate-owned discovery messages exchanged by the conversation
//! engine, the protobuf wire mirrors used on the RPC surface, protocol
//! variants and the result shapes produced by a suite run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod message;
pub mod results;
pub mod snapshot;
pub mod variant;
pub mod wire;

pub use message::{ordered_set, DiscoveryRequest, DiscoveryResponse, ErrorDetail, ResourceAny};
pub use results::{FailedScenario, StepStatus, SuiteResults, VariantResults};
pub use snapshot::Snapshot;
pub use variant::{ProtocolMode, Variant, VariantParseError};

/// Canonical type URLs for the resource kinds the harness knows about.
pub mod type_url {
    pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
    pub const ENDPOINT: &str =
        "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
    pub const SECRET: &str =
        "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
    pub const RUNTIME: &str = "type.googleapis.com/envoy.service.runtime.v3.Runtime";
}

/// Error returned when a conversation state transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Lifecycle state for one conversation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    Streaming,
    Draining,
    Closed,
}

impl ConversationState {
    /// Returns true when this state can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Idle, Self::Streaming)
                | (Self::Idle, Self::Closed)
                | (Self::Streaming, Self::Draining)
                | (Self::Streaming, Self::Closed)
                | (Self::Draining, Self::Closed)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "conversation_state",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    /// Returns true when the conversation can no longer be used.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}
