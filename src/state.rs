//! Durable processing state.
//!
//! The [`StateStore`] owns every [`ProcessingRecord`]. Other components
//! request transitions through it and never write the table directly.
//!
//! ```text
//!             register
//!                │
//!                ▼
//!   ┌────────► pending ──begin_processing──► processing ──complete──► completed
//!   │            ▲  ▲                            │
//!   │  recover_  │  └──────── fail ◄─────────────┘
//!   │ interrupted│              │
//!   │            │              ▼
//!   └────────────┴─reset_to_pending── failed
//! ```
//!
//! `begin_processing` is a single conditional `UPDATE`, so two workers
//! racing on the same id cannot both win. Registration and cursor advance
//! share one transaction: a message is never acknowledged upstream before
//! it is stored.
//!
//! Each store instance is a runner with its own owner id. Claiming a record
//! stamps the owner and refreshes the runner's lease in the `runners` table;
//! crash recovery only demotes records whose owner has no live lease, so a
//! second `vcap` process never takes work from a running one.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::models::{ContentType, ErrorClass, Message, ProcessingRecord, ProcessingStatus};

const RECORD_COLUMNS: &str = "message_id, status, attempts, last_error, error_class, content_type, outcome_json, created_at, updated_at";

/// Result of registering a message.
#[derive(Debug, Clone)]
pub struct Registration {
    pub record: ProcessingRecord,
    /// False when the message id was already known.
    pub is_new: bool,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
    owner: String,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runner id stamped on records this store claims.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Refresh this runner's lease.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_heartbeat(&mut tx, &self.owner).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop this runner's lease on clean shutdown.
    pub async fn release(&self) -> Result<()> {
        sqlx::query("DELETE FROM runners WHERE run_id = ?")
            .bind(&self.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register a message. Returns the existing record if already present.
    pub async fn register(&self, message: &Message) -> Result<ProcessingRecord> {
        Ok(self.register_with_cursor(message, None).await?.record)
    }

    /// Register a message and, in the same transaction, advance the
    /// source cursor to `cursor` (as `(source, value)`).
    pub async fn register_with_cursor(
        &self,
        message: &Message,
        cursor: Option<(&str, &str)>,
    ) -> Result<Registration> {
        self.register_in_tx(message, cursor, None).await
    }

    /// Register a placeholder for an item that cannot be processed, already
    /// `failed`, and advance the cursor, all in one transaction.
    pub async fn register_failed(
        &self,
        message: &Message,
        class: ErrorClass,
        error: &str,
        cursor: Option<(&str, &str)>,
    ) -> Result<Registration> {
        self.register_in_tx(message, cursor, Some((class, error))).await
    }

    async fn register_in_tx(
        &self,
        message: &Message,
        cursor: Option<(&str, &str)>,
        failure: Option<(ErrorClass, &str)>,
    ) -> Result<Registration> {
        let mut tx = self.pool.begin().await?;
        let is_new = insert_message(&mut tx, message).await?;
        if let (true, Some((class, error))) = (is_new, failure) {
            sqlx::query(
                r#"
                UPDATE processing_records
                SET status = 'failed', attempts = 1, last_error = ?, error_class = ?
                WHERE message_id = ?
                "#,
            )
            .bind(error)
            .bind(class.as_str())
            .bind(&message.id)
            .execute(&mut *tx)
            .await?;
        }
        if let Some((source, value)) = cursor {
            write_cursor(&mut tx, source, value).await?;
        }
        tx.commit().await?;

        let record = self
            .get(&message.id)
            .await?
            .with_context(|| format!("record missing after register: {}", message.id))?;
        Ok(Registration { record, is_new })
    }

    /// Atomically move `pending → processing` under this runner. Returns
    /// false if the record is in any other state (already taken, completed,
    /// failed, unknown).
    pub async fn begin_processing(&self, message_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        write_heartbeat(&mut tx, &self.owner).await?;
        let result = sqlx::query(
            r#"
            UPDATE processing_records SET status = 'processing', owner = ?, updated_at = ?
            WHERE message_id = ? AND status = 'pending'
            "#,
        )
        .bind(&self.owner)
        .bind(now)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a record this runner is processing completed with a JSON outcome.
    pub async fn complete(&self, message_id: &str, outcome: &serde_json::Value) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_records
            SET status = 'completed', outcome_json = ?, last_error = NULL, error_class = NULL,
                owner = NULL, updated_at = ?
            WHERE message_id = ? AND status = 'processing' AND owner = ?
            "#,
        )
        .bind(outcome.to_string())
        .bind(now)
        .bind(message_id)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!("cannot complete {}: record is not processing here", message_id);
        }
        Ok(())
    }

    /// Record a failure: increments attempts and sets `failed`. A
    /// `processing` record must belong to this runner.
    pub async fn fail(&self, message_id: &str, class: ErrorClass, error: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_records
            SET status = 'failed', attempts = attempts + 1, last_error = ?, error_class = ?,
                owner = NULL, updated_at = ?
            WHERE message_id = ?
              AND (status = 'pending' OR (status = 'processing' AND owner = ?))
            "#,
        )
        .bind(error)
        .bind(class.as_str())
        .bind(now)
        .bind(message_id)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!("cannot fail {}: record is not pending or processing here", message_id);
        }
        Ok(())
    }

    /// Explicit retry: `failed → pending`. Returns false if not failed.
    pub async fn reset_to_pending(&self, message_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE processing_records SET status = 'pending', updated_at = ? WHERE message_id = ? AND status = 'failed'",
        )
        .bind(now)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Reset every failed record except security rejections.
    pub async fn reset_failed(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_records SET status = 'pending', updated_at = ?
            WHERE status = 'failed' AND COALESCE(error_class, 'transient') != 'security'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Scheduled retry of transient failures below the attempt ceiling.
    pub async fn requeue_transient(&self, max_attempts: i64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_records SET status = 'pending', updated_at = ?
            WHERE status = 'failed' AND error_class = 'transient' AND attempts < ?
            "#,
        )
        .bind(now)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Crash recovery: demote `processing` records whose owner holds no
    /// lease refreshed within `lease_secs`. Records of live runners, this
    /// one included, are left alone.
    pub async fn recover_interrupted(&self, lease_secs: i64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE processing_records SET status = 'pending', owner = NULL, updated_at = ?
            WHERE status = 'processing'
              AND (owner IS NULL OR owner NOT IN (
                  SELECT run_id FROM runners WHERE heartbeat_at > ? OR run_id = ?
              ))
            "#,
        )
        .bind(now)
        .bind(now - lease_secs)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM runners WHERE heartbeat_at <= ? AND run_id != ?")
            .bind(now - lease_secs)
            .bind(&self.owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<ProcessingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM processing_records WHERE message_id = ?",
            RECORD_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Records in `status`, oldest first.
    pub async fn list_by_status(&self, status: ProcessingStatus) -> Result<Vec<ProcessingRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processing_records WHERE status = ? ORDER BY created_at, message_id",
            RECORD_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Count of records per status (statuses with zero rows included).
    pub async fn counts(&self) -> Result<Vec<(ProcessingStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM processing_records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts: Vec<(ProcessingStatus, i64)> =
            ProcessingStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let status: ProcessingStatus = row.get::<String, _>("status").parse()?;
            let n: i64 = row.get("n");
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = n;
            }
        }
        Ok(counts)
    }

    /// Load the immutable message behind a record.
    pub async fn load_message(&self, message_id: &str) -> Result<Option<Message>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT message_json FROM messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        json.map(|j| {
            serde_json::from_str(&j).with_context(|| format!("corrupt message row: {}", message_id))
        })
        .transpose()
    }

    pub async fn cursor(&self, source: &str) -> Result<Option<String>> {
        let result: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(result)
    }

    pub async fn set_cursor(&self, source: &str, value: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_cursor(&mut tx, source, value).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_message(tx: &mut Transaction<'_, Sqlite>, message: &Message) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let json = serde_json::to_string(message)?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO messages (id, source, sender_id, content_type, message_json, received_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&message.id)
    .bind(&message.source)
    .bind(&message.sender_id)
    .bind(message.content_type.as_str())
    .bind(&json)
    .bind(message.received_at.timestamp())
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO processing_records (message_id, status, attempts, content_type, created_at, updated_at)
        VALUES (?, 'pending', 0, ?, ?, ?)
        ON CONFLICT(message_id) DO NOTHING
        "#,
    )
    .bind(&message.id)
    .bind(message.content_type.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(inserted.rows_affected() == 1)
}

async fn write_cursor(tx: &mut Transaction<'_, Sqlite>, source: &str, value: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(value)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_heartbeat(tx: &mut Transaction<'_, Sqlite>, run_id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO runners (run_id, started_at, heartbeat_at) VALUES (?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at
        "#,
    )
    .bind(run_id)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> Result<ProcessingRecord> {
    let status: String = row.get("status");
    let content_type: String = row.get("content_type");
    let error_class: Option<String> = row.get("error_class");
    Ok(ProcessingRecord {
        message_id: row.get("message_id"),
        status: status.parse()?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        error_class: error_class.map(|c| c.parse()).transpose()?,
        content_type: content_type.parse::<ContentType>()?,
        outcome: row.get("outcome_json"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
