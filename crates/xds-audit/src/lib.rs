//! Append-only audit log of every discovery request and response exchanged
//! by a conversation, with the queries conformance assertions run against it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use xds_types::type_url;

mod sqlite;

pub use sqlite::SqliteAuditLog;

/// Result type for audit log operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors returned by audit log implementations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("cannot decode audited payload ({context}): {detail}")]
    Decode {
        context: &'static str,
        detail: String,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("audit store connection is poisoned")]
    Poisoned,
    #[error("audit store task failed: {0}")]
    Task(String),
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// One immutable entry of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence_id: u64,
    pub conversation_id: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub raw_payload: Value,
}

/// Audit contract shared by the conversation engine and scenario assertions.
///
/// Every operation is scoped to one conversation so that concurrent or
/// sequential conversations never see each other's traffic.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends an entry. Received payloads must carry `version_info`,
    /// `type_url` and a `resources` array.
    async fn record(
        &self,
        conversation_id: &str,
        direction: Direction,
        payload: Value,
    ) -> AuditResult<AuditRecord>;

    /// Every entry of `conversation_id` in sequence order.
    async fn records(&self, conversation_id: &str) -> AuditResult<Vec<AuditRecord>>;

    /// True when the resource identities received for `version`/`type_url`
    /// are exactly `expected` and all of them came in one response.
    async fn has_expected_resources(
        &self,
        conversation_id: &str,
        version: &str,
        type_url: &str,
        expected: &[String],
    ) -> AuditResult<bool>;

    /// True when no response carrying `version` for `type_url` was received.
    async fn has_no_responses_for_version(
        &self,
        conversation_id: &str,
        version: &str,
        type_url: &str,
    ) -> AuditResult<bool>;

    /// True when more requests were sent than responses received.
    async fn pending_request_outstanding(&self, conversation_id: &str) -> AuditResult<bool>;
}

/// Name of the field holding a resource's identity in an audited payload.
pub fn identity_field(resource_type_url: &str) -> &'static str {
    if resource_type_url == type_url::ENDPOINT {
        "cluster_name"
    } else {
        "name"
    }
}

/// Version and type URL of a received payload.
pub(crate) fn response_key(payload: &Value) -> AuditResult<(String, String)> {
    let field = |name: &'static str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AuditError::Decode {
                context: "response",
                detail: format!("missing string field '{name}'"),
            })
    };
    let version = field("version_info")?;
    let type_url = field("type_url")?;
    if !payload.get("resources").is_some_and(Value::is_array) {
        return Err(AuditError::Decode {
            context: "response",
            detail: "missing 'resources' array".to_string(),
        });
    }
    Ok((version, type_url))
}

/// Compares rows of `(response id, identity)` against `expected`.
pub(crate) fn matches_expected<I>(rows: I, expected: &[String]) -> AuditResult<bool>
where
    I: IntoIterator<Item = (u64, Option<String>)>,
{
    let mut responses = BTreeSet::new();
    let mut identities = BTreeSet::new();
    for (response_id, identity) in rows {
        let Some(identity) = identity else {
            return Err(AuditError::Decode {
                context: "resource identity",
                detail: format!("response {response_id} holds a resource without an identity"),
            });
        };
        responses.insert(response_id);
        identities.insert(identity);
    }
    if responses.len() != 1 {
        return Ok(false);
    }
    let expected: BTreeSet<String> = expected.iter().cloned().collect();
    Ok(identities == expected)
}

/// In-memory implementation for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    inner: RwLock<AuditInner>,
}

#[derive(Debug, Default)]
struct AuditInner {
    next_sequence_id: u64,
    records: Vec<AuditRecord>,
    by_conversation: HashMap<String, Vec<usize>>,
    responses_by_key: HashMap<(String, String, String), Vec<usize>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(
        &self,
        conversation_id: &str,
        direction: Direction,
        payload: Value,
    ) -> AuditResult<AuditRecord> {
        let key = match direction {
            Direction::Received => Some(response_key(&payload)?),
            Direction::Sent => None,
        };

        let mut inner = self.inner.write().await;
        inner.next_sequence_id += 1;
        let record = AuditRecord {
            sequence_id: inner.next_sequence_id,
            conversation_id: conversation_id.to_string(),
            direction,
            timestamp: Utc::now(),
            raw_payload: payload,
        };
        let position = inner.records.len();
        inner.records.push(record.clone());
        inner
            .by_conversation
            .entry(conversation_id.to_string())
            .or_default()
            .push(position);
        if let Some((version, type_url)) = key {
            inner
                .responses_by_key
                .entry((conversation_id.to_string(), version, type_url))
                .or_default()
                .push(position);
        }
        Ok(record)
    }

    async fn records(&self, conversation_id: &str) -> AuditResult<Vec<AuditRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_conversation
            .get(conversation_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|position| inner.records[*position].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn has_expected_resources(
        &self,
        conversation_id: &str,
        version: &str,
        type_url: &str,
        expected: &[String],
    ) -> AuditResult<bool> {
        let inner = self.inner.read().await;
        let key = (
            conversation_id.to_string(),
            version.to_string(),
            type_url.to_string(),
        );
        let Some(positions) = inner.responses_by_key.get(&key) else {
            return Ok(false);
        };

        let field = identity_field(type_url);
        let mut rows = Vec::new();
        for position in positions {
            let record = &inner.records[*position];
            let resources = record
                .raw_payload
                .get("resources")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            rows.extend(resources.iter().map(|resource| {
                (
                    record.sequence_id,
                    resource
                        .get(field)
                        .and_then(Value::as_str)
                        .map(str::to_string),
                )
            }));
        }
        matches_expected(rows, expected)
    }

    async fn has_no_responses_for_version(
        &self,
        conversation_id: &str,
        version: &str,
        type_url: &str,
    ) -> AuditResult<bool> {
        let inner = self.inner.read().await;
        let key = (
            conversation_id.to_string(),
            version.to_string(),
            type_url.to_string(),
        );
        Ok(inner
            .responses_by_key
            .get(&key)
            .map_or(true, |positions| positions.is_empty()))
    }

    async fn pending_request_outstanding(&self, conversation_id: &str) -> AuditResult<bool> {
        let inner = self.inner.read().await;
        let (mut sent, mut received) = (0usize, 0usize);
        for position in inner
            .by_conversation
            .get(conversation_id)
            .into_iter()
            .flatten()
        {
            match inner.records[*position].direction {
                Direction::Sent => sent += 1,
                Direction::Received => received += 1,
            }
        }
        Ok(sent > received)
    }
}
