//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 with microseconds and a `Z` suffix so they sort lexically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::access::ChannelAccessState;
use crate::error::DatabaseError;
use crate::pipeline::tracker::{PipelineStepRecord, StepStatus};
use crate::pipeline::types::{ClassificationResult, InboundEvent};
use crate::store::migrations;
use crate::store::traits::{Database, InsertOutcome, StoredMessage};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &impl serde::Serialize) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a libsql Row to a StoredMessage.
///
/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let attachments_str: String = row.get(6)?;
    let created_str: String = row.get(9)?;
    let processed_at: Option<String> = row.get(12).ok();
    let classification: Option<String> = row.get(13).ok();

    Ok(StoredMessage {
        id: row.get(0)?,
        external_id: row.get(1)?,
        channel_id: row.get(2)?,
        author_id: row.get(3)?,
        author_name: row.get(4)?,
        content: row.get(5)?,
        attachments: serde_json::from_str(&attachments_str).unwrap_or_default(),
        referenced_external_id: row.get(7).ok(),
        referenced_content: row.get(8).ok(),
        created_at: parse_datetime(&created_str),
        is_processed: row.get::<i64>(10)? != 0,
        processing_error: row.get(11).ok(),
        processed_at: parse_optional_datetime(&processed_at),
        result: classification.and_then(|c| serde_json::from_str(&c).ok()),
    })
}

/// Map a libsql Row to a PipelineStepRecord.
///
/// Column order matches STEP_COLUMNS.
fn row_to_step(row: &libsql::Row) -> Result<PipelineStepRecord, libsql::Error> {
    let status_str: String = row.get(4)?;
    let input_str: String = row.get(5)?;
    let output_str: Option<String> = row.get(6).ok();
    let details_str: String = row.get(7)?;
    let start_str: String = row.get(9)?;
    let end_str: Option<String> = row.get(10).ok();
    let cost_str: String = row.get(13)?;

    Ok(PipelineStepRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        step_name: row.get(2)?,
        step_order: row.get::<i64>(3)? as u32,
        status: status_str.parse().unwrap_or(StepStatus::Failed),
        input: serde_json::from_str(&input_str).unwrap_or(serde_json::Value::Null),
        output: output_str.and_then(|s| serde_json::from_str(&s).ok()),
        processing_details: serde_json::from_str(&details_str)
            .unwrap_or_else(|_| serde_json::json!({})),
        error: row.get(8).ok(),
        start_time: parse_datetime(&start_str),
        end_time: parse_optional_datetime(&end_str),
        duration_ms: row.get::<i64>(11).ok(),
        api_calls: row.get::<i64>(12)? as u32,
        cost_units: cost_str.parse().unwrap_or(Decimal::ZERO),
    })
}

/// Map a libsql Row to a ChannelAccessState.
fn row_to_channel_access(row: &libsql::Row) -> Result<ChannelAccessState, libsql::Error> {
    let blacklisted_since: Option<String> = row.get(3).ok();
    let last_checked_at: Option<String> = row.get(5).ok();

    Ok(ChannelAccessState {
        channel_id: row.get(0)?,
        accessible: row.get::<i64>(1)? != 0,
        consecutive_permission_errors: row.get::<i64>(2)? as u32,
        blacklisted_since: parse_optional_datetime(&blacklisted_since),
        reason: row.get(4).ok(),
        last_checked_at: parse_optional_datetime(&last_checked_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, external_id, channel_id, author_id, author_name, content, attachments, referenced_external_id, referenced_content, created_at, is_processed, processing_error, processed_at, classification";

const STEP_COLUMNS: &str = "id, message_id, step_name, step_order, status, input, output, processing_details, error, start_time, end_time, duration_ms, api_calls, cost_units";

const CHANNEL_ACCESS_COLUMNS: &str =
    "channel_id, accessible, consecutive_permission_errors, blacklisted_since, reason, last_checked_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, event: &InboundEvent) -> Result<InsertOutcome, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let attachments = to_json(&event.attachments)?;
        let (ref_id, ref_content) = match &event.referenced_event {
            Some(r) => (Some(r.id.as_str()), r.content.as_deref()),
            None => (None, None),
        };

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO messages (id, external_id, channel_id, author_id, author_name, content,
                    attachments, referenced_external_id, referenced_content, created_at, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    id.clone(),
                    event.id.clone(),
                    event.channel_id.clone(),
                    event.author.id.clone(),
                    event.author.display_name.clone(),
                    event.content.clone(),
                    attachments,
                    opt_text(ref_id),
                    opt_text(ref_content),
                    fmt_datetime(&event.timestamp),
                    fmt_datetime(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        if inserted > 0 {
            debug!(id = %id, external_id = %event.id, "Message inserted into DB");
            return Ok(InsertOutcome::Inserted(id));
        }

        match self.get_message_by_external_id(&event.id).await? {
            Some(existing) => Ok(InsertOutcome::Duplicate(existing.id)),
            None => Err(DatabaseError::Constraint(format!(
                "insert_message: {} neither inserted nor found",
                event.id
            ))),
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut messages = self
            .query_messages(
                "get_message",
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(messages.pop())
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut messages = self
            .query_messages(
                "get_message_by_external_id",
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
                params![external_id],
            )
            .await?;
        Ok(messages.pop())
    }

    async fn get_recent_messages(
        &self,
        channel_id: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.query_messages(
            "get_recent_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ?1 AND created_at < ?2
                 ORDER BY created_at DESC LIMIT ?3"
            ),
            params![channel_id, fmt_datetime(&before), limit as i64],
        )
        .await
    }

    async fn save_result(
        &self,
        id: &str,
        result: &ClassificationResult,
    ) -> Result<(), DatabaseError> {
        let classification = to_json(result)?;
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET is_processed = 1, processed_at = ?2, processing_error = ?3,
                    is_relevant = ?4, priority = ?5, category = ?6, classification = ?7
                 WHERE id = ?1",
                params![
                    id,
                    fmt_datetime(&Utc::now()),
                    opt_text(result.error.as_deref()),
                    result.is_relevant as i64,
                    result.priority as i64,
                    result.category.clone(),
                    classification,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_result: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        debug!(id, relevant = result.is_relevant, priority = result.priority, "Result saved");
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET processing_error = ?2, processed_at = ?3
                 WHERE id = ?1 AND is_processed = 0",
                params![id, error, fmt_datetime(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(updated > 0)
    }

    async fn list_failed_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.query_messages(
            "list_failed_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE processing_error IS NOT NULL
                 ORDER BY created_at ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
        .await
    }

    async fn list_unprocessed_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.query_messages(
            "list_unprocessed_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE is_processed = 0 AND processing_error IS NULL
                 ORDER BY created_at ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
        .await
    }

    async fn reset_for_reprocess(&self, id: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET processing_error = NULL, is_processed = 0, processed_at = NULL
                 WHERE id = ?1 AND processing_error IS NOT NULL",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_for_reprocess: {e}")))?;
        Ok(updated > 0)
    }

    // ── Pipeline steps ──────────────────────────────────────────────

    async fn insert_step(&self, step: &PipelineStepRecord) -> Result<(), DatabaseError> {
        let output = match &step.output {
            Some(v) => Some(to_json(v)?),
            None => None,
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO pipeline_steps ({STEP_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    step.id.clone(),
                    step.message_id.clone(),
                    step.step_name.clone(),
                    step.step_order as i64,
                    step.status.as_str(),
                    to_json(&step.input)?,
                    opt_text(output.as_deref()),
                    to_json(&step.processing_details)?,
                    opt_text(step.error.as_deref()),
                    fmt_datetime(&step.start_time),
                    opt_text(step.end_time.as_ref().map(fmt_datetime).as_deref()),
                    opt_int(step.duration_ms),
                    step.api_calls as i64,
                    step.cost_units.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("insert_step: {msg}"))
                } else {
                    DatabaseError::Query(format!("insert_step: {msg}"))
                }
            })?;
        Ok(())
    }

    async fn finish_step(&self, step: &PipelineStepRecord) -> Result<bool, DatabaseError> {
        let output = match &step.output {
            Some(v) => Some(to_json(v)?),
            None => None,
        };
        let updated = self
            .conn()
            .execute(
                "UPDATE pipeline_steps SET status = ?2, output = ?3, processing_details = ?4,
                    error = ?5, end_time = ?6, duration_ms = ?7, api_calls = ?8, cost_units = ?9
                 WHERE id = ?1 AND status = 'processing'",
                params![
                    step.id.clone(),
                    step.status.as_str(),
                    opt_text(output.as_deref()),
                    to_json(&step.processing_details)?,
                    opt_text(step.error.as_deref()),
                    opt_text(step.end_time.as_ref().map(fmt_datetime).as_deref()),
                    opt_int(step.duration_ms),
                    step.api_calls as i64,
                    step.cost_units.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_step: {e}")))?;
        Ok(updated > 0)
    }

    async fn fail_open_steps(&self, message_id: &str, error: &str) -> Result<usize, DatabaseError> {
        let now = fmt_datetime(&Utc::now());
        let updated = self
            .conn()
            .execute(
                "UPDATE pipeline_steps SET status = 'failed', error = ?2, end_time = ?3,
                    duration_ms = CAST((julianday(?3) - julianday(start_time)) * 86400000 AS INTEGER)
                 WHERE message_id = ?1 AND status = 'processing'",
                params![message_id, error, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_open_steps: {e}")))?;
        Ok(updated as usize)
    }

    async fn list_steps(&self, message_id: &str) -> Result<Vec<PipelineStepRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM pipeline_steps WHERE message_id = ?1 ORDER BY step_order ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_steps: {e}")))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_step(&row) {
                Ok(step) => steps.push(step),
                Err(e) => warn!("Skipping step row: {e}"),
            }
        }
        Ok(steps)
    }

    async fn max_step_order(&self, message_id: &str) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(step_order), 0) FROM pipeline_steps WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("max_step_order: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let max: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(max as u32)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("max_step_order: {e}"))),
        }
    }

    // ── Channel access ──────────────────────────────────────────────

    async fn list_channel_access(&self) -> Result<Vec<ChannelAccessState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHANNEL_ACCESS_COLUMNS} FROM channel_access ORDER BY channel_id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_channel_access: {e}")))?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_channel_access(&row) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Skipping channel_access row: {e}"),
            }
        }
        Ok(states)
    }

    async fn upsert_channel_access(&self, state: &ChannelAccessState) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO channel_access ({CHANNEL_ACCESS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(channel_id) DO UPDATE SET
                        accessible = excluded.accessible,
                        consecutive_permission_errors = excluded.consecutive_permission_errors,
                        blacklisted_since = excluded.blacklisted_since,
                        reason = excluded.reason,
                        last_checked_at = excluded.last_checked_at"
                ),
                params![
                    state.channel_id.clone(),
                    state.accessible as i64,
                    state.consecutive_permission_errors as i64,
                    opt_text(state.blacklisted_since.as_ref().map(fmt_datetime).as_deref()),
                    opt_text(state.reason.as_deref()),
                    opt_text(state.last_checked_at.as_ref().map(fmt_datetime).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_channel_access: {e}")))?;
        Ok(())
    }

    async fn delete_channel_access(&self, channel_id: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM channel_access WHERE channel_id = ?1",
                params![channel_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_channel_access: {e}")))?;
        Ok(deleted > 0)
    }

    async fn clear_channel_access(&self) -> Result<usize, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM channel_access", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_channel_access: {e}")))?;
        if deleted > 0 {
            info!(count = deleted, "Channel access table cleared");
        }
        Ok(deleted as usize)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::pipeline::types::{Author, ReferencedEvent};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn event(id: &str, channel: &str, content: &str, ts: DateTime<Utc>) -> InboundEvent {
        InboundEvent {
            id: id.to_string(),
            channel_id: channel.to_string(),
            author: Author {
                id: "u1".into(),
                display_name: "Alice".into(),
            },
            content: content.to_string(),
            attachments: Vec::new(),
            referenced_event: None,
            timestamp: ts,
        }
    }

    fn result(error: Option<&str>) -> ClassificationResult {
        ClassificationResult {
            is_relevant: true,
            priority: 4,
            category: "Trading Signal".into(),
            keywords: vec!["btc".into()],
            sentiment: "Bullish".into(),
            summary: "long btc".into(),
            confidence: 0.9,
            signal: None,
            context_message_ids: vec![],
            error: error.map(String::from),
        }
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn insert_is_idempotent_on_external_id() {
        let db = test_db().await;
        let e = event("e1", "c1", "hello world", Utc::now());

        let first = db.insert_message(&e).await.unwrap();
        let second = db.insert_message(&e).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        assert_eq!(second, InsertOutcome::Duplicate(first.id().to_string()));
    }

    #[tokio::test]
    async fn referenced_event_round_trips() {
        let db = test_db().await;
        let mut e = event("e1", "c1", "agree", Utc::now());
        e.referenced_event = Some(ReferencedEvent {
            id: "e0".into(),
            content: Some("btc to 100k".into()),
        });
        let id = db.insert_message(&e).await.unwrap();

        let stored = db.get_message(id.id()).await.unwrap().unwrap();
        assert_eq!(stored.referenced_external_id.as_deref(), Some("e0"));
        assert_eq!(stored.referenced_content.as_deref(), Some("btc to 100k"));
        assert!(!stored.is_processed);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn recent_messages_before_timestamp_newest_first() {
        let db = test_db().await;
        let base = Utc::now();
        for i in 0..5 {
            let e = event(&format!("e{i}"), "c1", &format!("msg {i}"), base + Duration::seconds(i));
            db.insert_message(&e).await.unwrap();
        }
        db.insert_message(&event("other", "c2", "x", base)).await.unwrap();

        let recent = db
            .get_recent_messages("c1", base + Duration::seconds(3), 2)
            .await
            .unwrap();
        let ids: Vec<&str> = recent.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1"]);
    }

    #[tokio::test]
    async fn save_result_marks_processed_with_error() {
        let db = test_db().await;
        let id = db
            .insert_message(&event("e1", "c1", "x", Utc::now()))
            .await
            .unwrap();

        db.save_result(id.id(), &result(Some("Empty response"))).await.unwrap();

        let stored = db.get_message(id.id()).await.unwrap().unwrap();
        assert!(stored.is_processed);
        assert!(stored.processed_at.is_some());
        assert_eq!(stored.processing_error.as_deref(), Some("Empty response"));
        assert_eq!(stored.result.unwrap().category, "Trading Signal");
    }

    #[tokio::test]
    async fn mark_failed_leaves_processed_messages_alone() {
        let db = test_db().await;
        let id = db
            .insert_message(&event("e1", "c1", "x", Utc::now()))
            .await
            .unwrap();
        db.save_result(id.id(), &result(None)).await.unwrap();

        assert!(!db.mark_failed(id.id(), "timed out").await.unwrap());
        assert!(!db.mark_failed("missing", "timed out").await.unwrap());

        let stored = db.get_message(id.id()).await.unwrap().unwrap();
        assert!(stored.is_processed);
        assert!(stored.processing_error.is_none());
        assert!(db.list_failed_messages(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_result_unknown_message_is_not_found() {
        let db = test_db().await;
        let err = db.save_result("missing", &result(None)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reprocess_reset_only_touches_failed_messages() {
        let db = test_db().await;
        let ok = db
            .insert_message(&event("e1", "c1", "x", Utc::now()))
            .await
            .unwrap();
        let bad = db
            .insert_message(&event("e2", "c1", "y", Utc::now()))
            .await
            .unwrap();
        db.save_result(ok.id(), &result(None)).await.unwrap();
        assert!(db.mark_failed(bad.id(), "timed out").await.unwrap());

        let failed = db.list_failed_messages(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, bad.id());

        assert!(!db.reset_for_reprocess(ok.id()).await.unwrap());
        assert!(db.reset_for_reprocess(bad.id()).await.unwrap());
        assert!(!db.reset_for_reprocess(bad.id()).await.unwrap());

        let unprocessed = db.list_unprocessed_messages(10).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].id, bad.id());
    }

    // ── Step tests ──────────────────────────────────────────────────

    fn step(message_id: &str, order: u32) -> PipelineStepRecord {
        PipelineStepRecord {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            step_name: "classify".into(),
            step_order: order,
            status: StepStatus::Processing,
            input: json!({"content": "btc"}),
            output: None,
            processing_details: json!({}),
            error: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            api_calls: 0,
            cost_units: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn finish_step_only_once() {
        let db = test_db().await;
        let mut s = step("m1", 1);
        db.insert_step(&s).await.unwrap();

        s.status = StepStatus::Completed;
        s.api_calls = 1;
        s.cost_units = "0.0015".parse().unwrap();
        assert!(db.finish_step(&s).await.unwrap());

        s.status = StepStatus::Failed;
        assert!(!db.finish_step(&s).await.unwrap());

        let steps = db.list_steps("m1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].api_calls, 1);
        assert_eq!(steps[0].cost_units.to_string(), "0.0015");
    }

    #[tokio::test]
    async fn duplicate_step_order_is_constraint_error() {
        let db = test_db().await;
        db.insert_step(&step("m1", 1)).await.unwrap();
        let err = db.insert_step(&step("m1", 1)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(db.max_step_order("m1").await.unwrap(), 1);
        assert_eq!(db.max_step_order("m2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fail_open_steps_closes_processing_only() {
        let db = test_db().await;
        db.insert_step(&step("m1", 1)).await.unwrap();
        let mut done = step("m1", 2);
        done.status = StepStatus::Skipped;
        db.insert_step(&done).await.unwrap();

        assert_eq!(db.fail_open_steps("m1", "timed out").await.unwrap(), 1);
        let steps = db.list_steps("m1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error.as_deref(), Some("timed out"));
        assert!(steps[0].duration_ms.is_some());
        assert_eq!(steps[1].status, StepStatus::Skipped);
    }

    // ── Channel access tests ────────────────────────────────────────

    #[tokio::test]
    async fn channel_access_upsert_and_clear() {
        let db = test_db().await;
        let mut state = ChannelAccessState::new("c1");
        state.accessible = false;
        state.consecutive_permission_errors = 3;
        state.blacklisted_since = Some(Utc::now());
        state.reason = Some("permission denied".into());
        db.upsert_channel_access(&state).await.unwrap();

        state.reason = Some("updated".into());
        db.upsert_channel_access(&state).await.unwrap();
        db.upsert_channel_access(&ChannelAccessState::new("c2")).await.unwrap();

        let all = db.list_channel_access().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].reason.as_deref(), Some("updated"));
        assert!(all[0].blacklisted_since.is_some());
        assert!(all[1].accessible);

        assert!(db.delete_channel_access("c1").await.unwrap());
        assert!(!db.delete_channel_access("c1").await.unwrap());
        assert_eq!(db.clear_channel_access().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_message(&event("e1", "c1", "x", Utc::now()))
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_message_by_external_id("e1").await.unwrap().is_some());
    }
}
