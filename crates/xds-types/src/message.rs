//! Crate-owned discovery messages.
//!
//! These are independent of the generated protobuf layer; [`crate::wire`]
//! converts them to and from the state-of-the-world and incremental wire
//! shapes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost::Message;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::wire::NamedResource;

/// Error details carried by a negative acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
}

/// A request sent by the harness to the system under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Empty on the first request for a type URL.
    pub version_info: String,
    pub node_id: String,
    /// Ordered set; empty means wildcard.
    pub resource_names: Vec<String>,
    /// Incremental variants only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names_unsubscribe: Vec<String>,
    pub type_url: String,
    /// Echoes the nonce of the response being acknowledged.
    pub response_nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest {
    /// Builds the first request of a subscription for `type_url`.
    pub fn subscribe(
        node_id: impl Into<String>,
        type_url: impl Into<String>,
        resource_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            type_url: type_url.into(),
            resource_names: ordered_set(resource_names),
            ..Self::default()
        }
    }

    pub fn is_initial(&self) -> bool {
        self.response_nonce.is_empty()
    }

    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }

    pub fn is_wildcard(&self) -> bool {
        self.resource_names.is_empty()
    }
}

/// Opaque typed resource payload, equivalent to `google.protobuf.Any`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAny {
    pub type_url: String,
    #[serde(serialize_with = "serialize_base64", deserialize_with = "deserialize_base64")]
    pub value: Vec<u8>,
}

impl ResourceAny {
    /// Encodes a resource whose identity lives in protobuf field 1.
    ///
    /// Listener, cluster, route configuration, cluster load assignment,
    /// secret and runtime messages all keep their name there.
    pub fn named(type_url: impl Into<String>, name: impl Into<String>) -> Self {
        let payload = NamedResource { name: name.into() };
        Self {
            type_url: type_url.into(),
            value: payload.encode_to_vec(),
        }
    }
}

/// A response received from the system under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub type_url: String,
    pub resources: Vec<ResourceAny>,
    /// Incremental variants only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_resources: Vec<String>,
    pub nonce: String,
}

/// Deduplicates `names` while keeping first-seen order.
pub fn ordered_set(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn serialize_base64<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(value))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::{ordered_set, DiscoveryRequest, ResourceAny};
    use crate::type_url;
    use serde_json::json;

    #[test]
    fn subscribe_builds_initial_wildcard_request() {
        let request = DiscoveryRequest::subscribe("node-a", type_url::LISTENER, Vec::new());
        assert!(request.is_initial());
        assert!(request.is_wildcard());
        assert!(!request.is_nack());
        assert!(request.version_info.is_empty());
        assert_eq!(request.node_id, "node-a");
    }

    #[test]
    fn ordered_set_keeps_first_occurrence() {
        let names = ordered_set(
            ["tui", "kaka", "tui", "kakapo", "kaka"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(names, vec!["tui", "kaka", "kakapo"]);
    }

    #[test]
    fn resource_payload_serializes_as_base64() {
        let resource = ResourceAny {
            type_url: type_url::CLUSTER.to_string(),
            value: vec![0x0a, 0x01, 0x41],
        };
        let value = serde_json::to_value(&resource).expect("serialize");
        assert_eq!(
            value,
            json!({ "type_url": type_url::CLUSTER, "value": "CgFB" })
        );
        let decoded: ResourceAny = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, resource);
    }

    #[test]
    fn nack_requests_serialize_error_detail_only_when_present() {
        let request = DiscoveryRequest::subscribe("node-a", type_url::ROUTE, Vec::new());
        let value = serde_json::to_value(&request).expect("serialize");
        assert!(value.get("error_detail").is_none());
        assert!(value.get("resource_names_unsubscribe").is_none());
    }
}
