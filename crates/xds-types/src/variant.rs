use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape of the discovery conversation on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMode {
    StateOfTheWorld,
    Incremental,
}

/// The four protocol variants a suite run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    #[serde(rename = "sotw non-aggregated")]
    SotwNonAggregated,
    #[serde(rename = "sotw aggregated")]
    SotwAggregated,
    #[serde(rename = "incremental non-aggregated")]
    IncrementalNonAggregated,
    #[serde(rename = "incremental aggregated")]
    IncrementalAggregated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown protocol variant '{0}'")]
pub struct VariantParseError(pub String);

impl Variant {
    /// Run order for a full suite.
    pub const ALL: [Variant; 4] = [
        Variant::SotwNonAggregated,
        Variant::SotwAggregated,
        Variant::IncrementalNonAggregated,
        Variant::IncrementalAggregated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SotwNonAggregated => "sotw non-aggregated",
            Self::SotwAggregated => "sotw aggregated",
            Self::IncrementalNonAggregated => "incremental non-aggregated",
            Self::IncrementalAggregated => "incremental aggregated",
        }
    }

    /// File-name friendly form of [`Variant::name`].
    pub fn slug(self) -> String {
        self.name().replace(' ', "-")
    }

    pub fn is_aggregated(self) -> bool {
        matches!(self, Self::SotwAggregated | Self::IncrementalAggregated)
    }

    pub fn mode(self) -> ProtocolMode {
        match self {
            Self::SotwNonAggregated | Self::SotwAggregated => ProtocolMode::StateOfTheWorld,
            Self::IncrementalNonAggregated | Self::IncrementalAggregated => {
                ProtocolMode::Incremental
            }
        }
    }

    pub fn is_incremental(self) -> bool {
        self.mode() == ProtocolMode::Incremental
    }

    /// Scenario tags selecting this variant, one per word of its name.
    pub fn tags(self) -> Vec<String> {
        self.name()
            .split(' ')
            .map(|word| format!("@{word}"))
            .collect()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = VariantParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', " ");
        let normalized = normalized.replace("non aggregated", "non-aggregated");
        Self::ALL
            .into_iter()
            .find(|variant| variant.name() == normalized)
            .ok_or_else(|| VariantParseError(value.to_string()))
    }
}
