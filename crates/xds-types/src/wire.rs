//! Protobuf wire messages for the discovery RPC surface and the companion
//! adapter, plus conversions from the crate-owned shapes.
//!
//! Field tags follow `envoy.service.discovery.v3`. Only the fields the
//! harness reads or writes are declared; prost skips the rest on decode.

use std::collections::HashMap;

use crate::message::{DiscoveryRequest as Request, DiscoveryResponse as Response, ResourceAny};
use crate::snapshot::Snapshot as StateSnapshot;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub cluster: String,
}

/// `google.rpc.Status`, used as the NACK error detail.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub response_nonce: String,
    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<::prost_types::Any>,
    #[prost(bool, tag = "3")]
    pub canary: bool,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaDiscoveryRequest {
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,
    #[prost(string, tag = "2")]
    pub type_url: String,
    #[prost(string, repeated, tag = "3")]
    pub resource_names_subscribe: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub resource_names_unsubscribe: Vec<String>,
    #[prost(map = "string, string", tag = "5")]
    pub initial_resource_versions: HashMap<String, String>,
    #[prost(string, tag = "6")]
    pub response_nonce: String,
    #[prost(message, optional, tag = "7")]
    pub error_detail: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(message, optional, tag = "2")]
    pub resource: Option<::prost_types::Any>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, repeated, tag = "4")]
    pub aliases: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaDiscoveryResponse {
    #[prost(string, tag = "1")]
    pub system_version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<Resource>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
    #[prost(string, repeated, tag = "6")]
    pub removed_resources: Vec<String>,
}

/// Decoding view shared by every standard resource kind: the identity is
/// field 1 (`name`, or `cluster_name` for cluster load assignments).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NamedResource {
    #[prost(string, tag = "1")]
    pub name: String,
}

fn node_for(node_id: &str) -> Option<Node> {
    (!node_id.is_empty()).then(|| Node {
        id: node_id.to_string(),
        cluster: String::new(),
    })
}

impl From<&Request> for DiscoveryRequest {
    fn from(request: &Request) -> Self {
        Self {
            version_info: request.version_info.clone(),
            node: node_for(&request.node_id),
            resource_names: request.resource_names.clone(),
            type_url: request.type_url.clone(),
            response_nonce: request.response_nonce.clone(),
            error_detail: request.error_detail.as_ref().map(|detail| Status {
                code: detail.code,
                message: detail.message.clone(),
            }),
        }
    }
}

impl From<&Request> for DeltaDiscoveryRequest {
    fn from(request: &Request) -> Self {
        Self {
            node: node_for(&request.node_id),
            type_url: request.type_url.clone(),
            resource_names_subscribe: request.resource_names.clone(),
            resource_names_unsubscribe: request.resource_names_unsubscribe.clone(),
            initial_resource_versions: HashMap::new(),
            response_nonce: request.response_nonce.clone(),
            error_detail: request.error_detail.as_ref().map(|detail| Status {
                code: detail.code,
                message: detail.message.clone(),
            }),
        }
    }
}

impl From<::prost_types::Any> for ResourceAny {
    fn from(any: ::prost_types::Any) -> Self {
        Self {
            type_url: any.type_url,
            value: any.value,
        }
    }
}

impl From<DiscoveryResponse> for Response {
    fn from(response: DiscoveryResponse) -> Self {
        Self {
            version_info: response.version_info,
            type_url: response.type_url,
            resources: response.resources.into_iter().map(ResourceAny::from).collect(),
            removed_resources: Vec::new(),
            nonce: response.nonce,
        }
    }
}

impl From<DeltaDiscoveryResponse> for Response {
    fn from(response: DeltaDiscoveryResponse) -> Self {
        let type_url = response.type_url;
        let resources = response
            .resources
            .into_iter()
            .map(|resource| match resource.resource {
                Some(any) => ResourceAny::from(any),
                // name-only entries still carry an identity
                None => ResourceAny::named(type_url.clone(), resource.name),
            })
            .collect();
        Self {
            version_info: response.system_version_info,
            type_url,
            resources,
            removed_resources: response.removed_resources,
            nonce: response.nonce,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Endpoint {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub cluster: String,
    #[prost(string, tag = "3")]
    pub address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Cluster {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub connect_timeout_seconds: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Route {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Listener {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Runtime {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Secret {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Desired state handed to the companion adapter.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    #[prost(string, tag = "1")]
    pub node: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(message, repeated, tag = "3")]
    pub endpoints: Vec<Endpoint>,
    #[prost(message, repeated, tag = "4")]
    pub clusters: Vec<Cluster>,
    #[prost(message, repeated, tag = "5")]
    pub routes: Vec<Route>,
    #[prost(message, repeated, tag = "6")]
    pub listeners: Vec<Listener>,
    #[prost(message, repeated, tag = "7")]
    pub runtimes: Vec<Runtime>,
    #[prost(message, repeated, tag = "8")]
    pub secrets: Vec<Secret>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetStateResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateStateResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearRequest {
    #[prost(string, tag = "1")]
    pub node: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearResponse {
    #[prost(string, tag = "1")]
    pub response: String,
}

impl From<&StateSnapshot> for Snapshot {
    fn from(snapshot: &StateSnapshot) -> Self {
        let names = &snapshot.resource_names;
        Self {
            node: snapshot.node.clone(),
            version: snapshot.version.clone(),
            endpoints: names
                .iter()
                .map(|name| Endpoint {
                    name: name.clone(),
                    cluster: name.clone(),
                    address: StateSnapshot::address_for(name),
                })
                .collect(),
            clusters: names
                .iter()
                .map(|name| Cluster {
                    name: name.clone(),
                    connect_timeout_seconds: 5,
                })
                .collect(),
            routes: names.iter().map(|name| Route { name: name.clone() }).collect(),
            listeners: names
                .iter()
                .map(|name| Listener {
                    name: name.clone(),
                    address: StateSnapshot::address_for(name),
                })
                .collect(),
            runtimes: names.iter().map(|name| Runtime { name: name.clone() }).collect(),
            secrets: names.iter().map(|name| Secret { name: name.clone() }).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, NamedResource};
    use crate::message::{DiscoveryRequest as Request, DiscoveryResponse as Response, ErrorDetail};
    use crate::type_url;
    use prost::Message;

    #[test]
    fn sotw_request_omits_node_when_id_is_empty() {
        let mut request = Request::subscribe("", type_url::CLUSTER, Vec::new());
        request.response_nonce = "3".to_string();
        let wire = DiscoveryRequest::from(&request);
        assert!(wire.node.is_none());
        assert_eq!(wire.response_nonce, "3");
    }

    #[test]
    fn delta_request_maps_names_to_subscribe_list_and_keeps_nack() {
        let mut request = Request::subscribe(
            "node-a",
            type_url::ENDPOINT,
            vec!["a".to_string(), "b".to_string()],
        );
        request.resource_names_unsubscribe = vec!["c".to_string()];
        request.error_detail = Some(ErrorDetail {
            code: 3,
            message: "bad payload".to_string(),
        });

        let wire = DeltaDiscoveryRequest::from(&request);
        assert_eq!(wire.resource_names_subscribe, vec!["a", "b"]);
        assert_eq!(wire.resource_names_unsubscribe, vec!["c"]);
        assert_eq!(wire.node.expect("node").id, "node-a");
        assert_eq!(wire.error_detail.expect("status").message, "bad payload");
    }

    #[test]
    fn delta_response_uses_system_version_and_name_only_resources() {
        let wire = DeltaDiscoveryResponse {
            system_version_info: "7".to_string(),
            resources: vec![super::Resource {
                name: "kaka".to_string(),
                ..Default::default()
            }],
            type_url: type_url::LISTENER.to_string(),
            nonce: "n-1".to_string(),
            removed_resources: vec!["tui".to_string()],
        };

        let response = Response::from(wire);
        assert_eq!(response.version_info, "7");
        assert_eq!(response.removed_resources, vec!["tui"]);
        let decoded =
            NamedResource::decode(response.resources[0].value.as_slice()).expect("decode name");
        assert_eq!(decoded.name, "kaka");
    }
}
