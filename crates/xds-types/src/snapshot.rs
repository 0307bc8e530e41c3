use serde::{Deserialize, Serialize};

use crate::message::ordered_set;

/// Resource state programmed into the system under test through the
/// companion adapter. Every resource kind receives the same names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node: String,
    pub version: String,
    pub resource_names: Vec<String>,
}

impl Snapshot {
    pub fn new(
        node: impl Into<String>,
        version: impl Into<String>,
        resource_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            node: node.into(),
            version: version.into(),
            resource_names: ordered_set(resource_names),
        }
    }

    /// Same resources, new version. Enough to make a conformant server push.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }

    /// Adds `resources` and bumps the version.
    pub fn with_resources(
        &self,
        resources: impl IntoIterator<Item = String>,
        version: impl Into<String>,
    ) -> Self {
        let names = self.resource_names.iter().cloned().chain(resources);
        Self {
            node: self.node.clone(),
            version: version.into(),
            resource_names: ordered_set(names),
        }
    }

    pub(crate) fn address_for(name: &str) -> String {
        format!("{name}.conformance.internal")
    }
}
