//! Builds the follow-up request for a received response.
//!
//! An acknowledgement depends only on the response being acknowledged, so
//! replaying a response always yields the same request.

use std::sync::Arc;

use thiserror::Error;
use xds_types::{ordered_set, DiscoveryRequest, DiscoveryResponse, ErrorDetail, ProtocolMode};

use crate::binding::KindRegistry;

/// `google.rpc.Code::INVALID_ARGUMENT`, carried by every NACK.
pub const NACK_STATUS_CODE: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no resource kind registered for type url '{0}'")]
    UnknownKind(String),
    #[error("resource declares type '{declared}' but the response carries '{expected}'")]
    TypeMismatch { declared: String, expected: String },
    #[error("cannot decode {type_url} resource: {detail}")]
    Malformed { type_url: String, detail: String },
    #[error("{type_url} resource has an empty '{field}'")]
    MissingIdentity {
        type_url: String,
        field: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct AckBuilder {
    registry: Arc<KindRegistry>,
    mode: ProtocolMode,
}

impl AckBuilder {
    pub fn new(registry: Arc<KindRegistry>, mode: ProtocolMode) -> Self {
        Self { registry, mode }
    }

    /// Identities of every resource in `response`, in order, deduplicated.
    pub fn resource_names(&self, response: &DiscoveryResponse) -> Result<Vec<String>, ParseError> {
        let kind = self
            .registry
            .by_type_url(&response.type_url)
            .map_err(|_| ParseError::UnknownKind(response.type_url.clone()))?;
        let names = response
            .resources
            .iter()
            .map(|resource| kind.identity_of(resource))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ordered_set(names))
    }

    /// ACK for `response`. Incremental ACKs never change the subscription,
    /// so they carry no resource names.
    pub fn build_ack(
        &self,
        node_id: &str,
        response: &DiscoveryResponse,
    ) -> Result<DiscoveryRequest, ParseError> {
        let names = self.resource_names(response)?;
        let resource_names = match self.mode {
            ProtocolMode::StateOfTheWorld => names,
            ProtocolMode::Incremental => Vec::new(),
        };
        Ok(DiscoveryRequest {
            version_info: response.version_info.clone(),
            node_id: node_id.to_string(),
            resource_names,
            resource_names_unsubscribe: Vec::new(),
            type_url: response.type_url.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: None,
        })
    }
}

/// ACK for a response whose kind is not registered. Its resources are not
/// inspected, so it names none; version and nonce are echoed.
pub fn build_pass_through_ack(node_id: &str, response: &DiscoveryResponse) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: response.version_info.clone(),
        node_id: node_id.to_string(),
        resource_names: Vec::new(),
        resource_names_unsubscribe: Vec::new(),
        type_url: response.type_url.clone(),
        response_nonce: response.nonce.clone(),
        error_detail: None,
    }
}

/// NACK for `response`: echoes its nonce but keeps the last version the
/// client accepted for that type.
pub fn build_nack(
    node_id: &str,
    response: &DiscoveryResponse,
    last_accepted_version: &str,
    error: &ParseError,
) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: last_accepted_version.to_string(),
        node_id: node_id.to_string(),
        resource_names: Vec::new(),
        resource_names_unsubscribe: Vec::new(),
        type_url: response.type_url.clone(),
        response_nonce: response.nonce.clone(),
        error_detail: Some(ErrorDetail {
            code: NACK_STATUS_CODE,
            message: error.to_string(),
        }),
    }
}
