//! Resource kind descriptors and the registry that binds each kind to its
//! RPC stream method, type URL and identity rule.

use std::time::Duration;

use prost::Message;
use thiserror::Error;
use xds_types::wire::NamedResource;
use xds_types::{type_url, ProtocolMode, ResourceAny, Variant};

use crate::ack::ParseError;

pub const ADS_SOTW_METHOD: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";
pub const ADS_DELTA_METHOD: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/DeltaAggregatedResources";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("unknown resource kind '{0}'")]
    UnknownKind(String),
}

/// Field that names a resource inside its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityField {
    Name,
    ClusterName,
}

impl IdentityField {
    /// Key used for the identity in audit payloads.
    pub fn json_key(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::ClusterName => "cluster_name",
        }
    }
}

/// Everything the engine needs to know about one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    pub name: &'static str,
    /// Short service label, e.g. `LDS`.
    pub service: &'static str,
    pub type_url: &'static str,
    pub identity: IdentityField,
    pub sotw_method: &'static str,
    pub delta_method: &'static str,
}

impl ResourceKind {
    /// Extracts the identity of `resource`, failing when the payload does
    /// not belong to this kind or cannot be decoded.
    pub fn identity_of(&self, resource: &ResourceAny) -> Result<String, ParseError> {
        if !resource.type_url.is_empty() && resource.type_url != self.type_url {
            return Err(ParseError::TypeMismatch {
                declared: resource.type_url.clone(),
                expected: self.type_url.to_string(),
            });
        }
        let decoded = NamedResource::decode(resource.value.as_slice()).map_err(|error| {
            ParseError::Malformed {
                type_url: self.type_url.to_string(),
                detail: error.to_string(),
            }
        })?;
        if decoded.name.is_empty() {
            return Err(ParseError::MissingIdentity {
                type_url: self.type_url.to_string(),
                field: self.identity.json_key(),
            });
        }
        Ok(decoded.name)
    }

    /// Stream this kind travels on for `variant`.
    pub fn route(&self, variant: Variant, deadline: Duration) -> StreamRoute {
        let mode = variant.mode();
        let (method, label) = match (variant.is_aggregated(), mode) {
            (true, ProtocolMode::StateOfTheWorld) => (ADS_SOTW_METHOD, "ADS"),
            (true, ProtocolMode::Incremental) => (ADS_DELTA_METHOD, "ADS"),
            (false, ProtocolMode::StateOfTheWorld) => (self.sotw_method, self.service),
            (false, ProtocolMode::Incremental) => (self.delta_method, self.service),
        };
        StreamRoute {
            method,
            mode,
            aggregated: variant.is_aggregated(),
            deadline,
            label,
        }
    }
}

/// One gRPC stream a conversation runs over. Aggregated wiring maps every
/// kind to the same route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamRoute {
    pub method: &'static str,
    pub mode: ProtocolMode,
    pub aggregated: bool,
    pub deadline: Duration,
    pub label: &'static str,
}

/// Registry of kinds, looked up by name, service label or type URL.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: Vec<ResourceKind>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(ResourceKind {
            name: "listener",
            service: "LDS",
            type_url: type_url::LISTENER,
            identity: IdentityField::Name,
            sotw_method: "/envoy.service.listener.v3.ListenerDiscoveryService/StreamListeners",
            delta_method: "/envoy.service.listener.v3.ListenerDiscoveryService/DeltaListeners",
        });
        registry.register(ResourceKind {
            name: "cluster",
            service: "CDS",
            type_url: type_url::CLUSTER,
            identity: IdentityField::Name,
            sotw_method: "/envoy.service.cluster.v3.ClusterDiscoveryService/StreamClusters",
            delta_method: "/envoy.service.cluster.v3.ClusterDiscoveryService/DeltaClusters",
        });
        registry.register(ResourceKind {
            name: "route",
            service: "RDS",
            type_url: type_url::ROUTE,
            identity: IdentityField::Name,
            sotw_method: "/envoy.service.route.v3.RouteDiscoveryService/StreamRoutes",
            delta_method: "/envoy.service.route.v3.RouteDiscoveryService/DeltaRoutes",
        });
        registry.register(ResourceKind {
            name: "endpoint",
            service: "EDS",
            type_url: type_url::ENDPOINT,
            identity: IdentityField::ClusterName,
            sotw_method: "/envoy.service.endpoint.v3.EndpointDiscoveryService/StreamEndpoints",
            delta_method: "/envoy.service.endpoint.v3.EndpointDiscoveryService/DeltaEndpoints",
        });
        registry.register(ResourceKind {
            name: "secret",
            service: "SDS",
            type_url: type_url::SECRET,
            identity: IdentityField::Name,
            sotw_method: "/envoy.service.secret.v3.SecretDiscoveryService/StreamSecrets",
            delta_method: "/envoy.service.secret.v3.SecretDiscoveryService/DeltaSecrets",
        });
        registry.register(ResourceKind {
            name: "runtime",
            service: "RTDS",
            type_url: type_url::RUNTIME,
            identity: IdentityField::Name,
            sotw_method: "/envoy.service.runtime.v3.RuntimeDiscoveryService/StreamRuntime",
            delta_method: "/envoy.service.runtime.v3.RuntimeDiscoveryService/DeltaRuntime",
        });
        registry
    }

    /// Adds `kind`, replacing any kind with the same name.
    pub fn register(&mut self, kind: ResourceKind) {
        self.kinds.retain(|existing| existing.name != kind.name);
        self.kinds.push(kind);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.kinds.iter()
    }

    pub fn lookup(&self, key: &str) -> Result<&ResourceKind, BindingError> {
        let key = key.trim();
        self.kinds
            .iter()
            .find(|kind| {
                kind.name.eq_ignore_ascii_case(key)
                    || kind.service.eq_ignore_ascii_case(key)
                    || kind.type_url == key
            })
            .ok_or_else(|| BindingError::UnknownKind(key.to_string()))
    }

    pub fn by_type_url(&self, type_url: &str) -> Result<&ResourceKind, BindingError> {
        self.kinds
            .iter()
            .find(|kind| kind.type_url == type_url)
            .ok_or_else(|| BindingError::UnknownKind(type_url.to_string()))
    }

    pub fn route(
        &self,
        key: &str,
        variant: Variant,
        deadline: Duration,
    ) -> Result<StreamRoute, BindingError> {
        Ok(self.lookup(key)?.route(variant, deadline))
    }
}
