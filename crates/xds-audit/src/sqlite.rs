//! SQLite-backed `AuditLog` with a JSON projection view over responses.

use crate::{
    matches_expected, response_key, AuditError, AuditLog, AuditRecord, AuditResult, Direction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xds_types::type_url;

/// Durable audit store. One connection is held behind a mutex and every
/// statement runs on the blocking pool, off the async workers.
#[derive(Debug)]
pub struct SqliteAuditLog {
    db_path: PathBuf,
    connection: Arc<Mutex<Connection>>,
}

impl SqliteAuditLog {
    /// Opens (or creates) the store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> AuditResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection = open_connection(&db_path)?;
        initialize_schema(&connection)?;
        Ok(Self {
            db_path,
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, operation: F) -> AuditResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AuditResult<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = connection.lock().map_err(|_| AuditError::Poisoned)?;
            operation(&mut connection)
        })
        .await
        .map_err(|error| AuditError::Task(error.to_string()))?
    }
}

fn open_connection(path: &Path) -> AuditResult<Connection> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> AuditResult<()> {
    connection.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS audit_sequence (
            sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
            direction TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS raw_request (
            sequence_id INTEGER PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_raw_request_conversation
            ON raw_request (conversation_id, sequence_id);

        CREATE TABLE IF NOT EXISTS raw_response (
            sequence_id INTEGER PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_raw_response_conversation
            ON raw_response (conversation_id, sequence_id);

        CREATE VIEW IF NOT EXISTS response_resource AS
        SELECT
            raw_response.sequence_id AS response_id,
            raw_response.conversation_id AS conversation_id,
            json_extract(raw_response.body, '$.version_info') AS version,
            json_extract(raw_response.body, '$.type_url') AS type_url,
            CASE json_extract(raw_response.body, '$.type_url')
                WHEN '{endpoint}' THEN json_extract(resource.value, '$.cluster_name')
                ELSE json_extract(resource.value, '$.name')
            END AS resource
        FROM raw_response, json_each(raw_response.body, '$.resources') AS resource;
        "#,
        endpoint = type_url::ENDPOINT,
    ))?;
    Ok(())
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn record(
        &self,
        conversation_id: &str,
        direction: Direction,
        payload: Value,
    ) -> AuditResult<AuditRecord> {
        if direction == Direction::Received {
            response_key(&payload)?;
        }

        let timestamp = Utc::now();
        let body = serde_json::to_string(&payload)?;
        let owner = conversation_id.to_string();
        let sequence_id = self
            .with_connection(move |connection| {
                let transaction = connection.transaction()?;
                transaction.execute(
                    "INSERT INTO audit_sequence (direction) VALUES (?1)",
                    params![direction_to_db(direction)],
                )?;
                let sequence_id = transaction.last_insert_rowid();
                let table = match direction {
                    Direction::Sent => "raw_request",
                    Direction::Received => "raw_response",
                };
                transaction.execute(
                    &format!(
                        "INSERT INTO {table} (sequence_id, conversation_id, recorded_at, body) \
                         VALUES (?1, ?2, ?3, ?4)"
                    ),
                    params![sequence_id, owner, timestamp_to_db(timestamp), body],
                )?;
                transaction.commit()?;
                Ok(sequence_id)
            })
            .await?;

        Ok(AuditRecord {
            sequence_id: i64_to_u64("sequence_id", sequence_id)?,
            conversation_id: conversation_id.to_string(),
            direction,
            timestamp,
            raw_payload: payload,
        })
    }

    async fn records(&self, conversation_id: &str) -> AuditResult<Vec<AuditRecord>> {
        let owner = conversation_id.to_string();
        let rows = self
            .with_connection(move |connection| {
                let mut statement = connection.prepare(
                    r#"
                    SELECT sequence_id, 'sent', recorded_at, body
                      FROM raw_request WHERE conversation_id = ?1
                    UNION ALL
                    SELECT sequence_id, 'received', recorded_at, body
                      FROM raw_response WHERE conversation_id = ?1
                    ORDER BY 1
                    "#,
                )?;
                let rows = statement
                    .query_map(params![owner], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(sequence_id, direction, recorded_at, body)| {
                Ok(AuditRecord {
                    sequence_id: i64_to_u64("sequence_id", sequence_id)?,
                    conversation_id: conversation_id.to_string(),
                    direction: direction_from_db(&direction)?,
                    timestamp: timestamp_from_db(&recorded_at)?,
                    raw_payload: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    async fn has_expected_resources(
        &self,
        conversation_id: &str,
        version: &str,
        type_url: &str,
        expected: &[String],
    ) -> AuditResult<bool> {
        let scope = (
            conversation_id.to_string(),
            version.to_string(),
            type_url.to_string(),
        );
        let rows = self
            .with_connection(move |connection| {
                let (conversation_id, version, type_url) = scope;
                let mut statement = connection.prepare(
                    r#"
                    SELECT response_id, resource
                      FROM response_resource
                     WHERE conversation_id = ?1 AND version = ?2 AND type_url = ?3
                     ORDER BY response_id
                    "#,
                )?;
                let rows = statement
                    .query_map(params![conversation_id, version, type_url], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let rows = rows
            .into_iter()
            .map(|(response_id, resource)| {
                Ok((i64_to_u64("response_id", response_id)?, resource))
            })
            .collect::<AuditResult<Vec<_>>>()?;
        matches_expected(rows, expected)
    }

    async fn has_no_responses_for_version(
        &self,
        conversation_id: &str,
        version: &str,
        type_url: &str,
    ) -> AuditResult<bool> {
        let scope = (
            conversation_id.to_string(),
            version.to_string(),
            type_url.to_string(),
        );
        let count: i64 = self
            .with_connection(move |connection| {
                let (conversation_id, version, type_url) = scope;
                let count = connection.query_row(
                    r#"
                    SELECT count(*) FROM raw_response
                     WHERE conversation_id = ?1
                       AND json_extract(body, '$.version_info') = ?2
                       AND json_extract(body, '$.type_url') = ?3
                    "#,
                    params![conversation_id, version, type_url],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count == 0)
    }

    async fn pending_request_outstanding(&self, conversation_id: &str) -> AuditResult<bool> {
        let owner = conversation_id.to_string();
        self.with_connection(move |connection| {
            let outstanding: bool = connection.query_row(
                r#"
                SELECT (SELECT count(*) FROM raw_request WHERE conversation_id = ?1)
                     > (SELECT count(*) FROM raw_response WHERE conversation_id = ?1)
                "#,
                params![owner],
                |row| row.get(0),
            )?;
            Ok(outstanding)
        })
        .await
    }
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> AuditResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn direction_to_db(direction: Direction) -> &'static str {
    match direction {
        Direction::Sent => "sent",
        Direction::Received => "received",
    }
}

fn direction_from_db(value: &str) -> AuditResult<Direction> {
    match value {
        "sent" => Ok(Direction::Sent),
        "received" => Ok(Direction::Received),
        _ => Err(AuditError::InvalidPersistedValue {
            field: "direction",
            value: value.to_string(),
        }),
    }
}

fn i64_to_u64(field: &'static str, value: i64) -> AuditResult<u64> {
    u64::try_from(value).map_err(|_| AuditError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
