//! Append-only audit trail and human review queue.
//!
//! Every security check and every terminal pipeline outcome lands in
//! `audit_log`. The table rejects `UPDATE` and `DELETE` at the database
//! level, so entries are never mutated once written. SQLite serialises
//! concurrent appends.
//!
//! The review queue collects decisions a human should look at later
//! (low-confidence routing, ambiguous tag corrections) without blocking
//! the pipeline.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{AuditEntry, AuditKind, AuditOutcome};

/// A queued review item.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub id: i64,
    pub at: i64,
    pub message_id: String,
    pub reason: String,
    pub detail: serde_json::Value,
}

#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one entry. Returns its row id.
    pub async fn append(
        &self,
        message_id: &str,
        sender_id: Option<&str>,
        kind: AuditKind,
        check: &str,
        outcome: AuditOutcome,
        detail: &serde_json::Value,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (at, message_id, sender_id, kind, check_name, outcome, detail_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now)
        .bind(message_id)
        .bind(sender_id)
        .bind(kind.as_str())
        .bind(check)
        .bind(outcome.as_str())
        .bind(detail.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent entries first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, at, message_id, sender_id, kind, check_name, outcome, detail_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// All entries for one message, in append order.
    pub async fn for_message(&self, message_id: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, at, message_id, sender_id, kind, check_name, outcome, detail_json FROM audit_log WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn add_review(
        &self,
        message_id: &str,
        reason: &str,
        detail: &serde_json::Value,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO review_queue (at, message_id, reason, detail_json) VALUES (?, ?, ?, ?)")
            .bind(now)
            .bind(message_id)
            .bind(reason)
            .bind(detail.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reviews(&self, limit: i64) -> Result<Vec<ReviewItem>> {
        let rows = sqlx::query(
            "SELECT id, at, message_id, reason, detail_json FROM review_queue ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let detail: String = row.get("detail_json");
                ReviewItem {
                    id: row.get("id"),
                    at: row.get("at"),
                    message_id: row.get("message_id"),
                    reason: row.get("reason"),
                    detail: serde_json::from_str(&detail).unwrap_or(serde_json::json!({})),
                }
            })
            .collect())
    }

    pub async fn review_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM review_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let kind: String = row.get("kind");
    let outcome: String = row.get("outcome");
    let detail: String = row.get("detail_json");
    Ok(AuditEntry {
        id: row.get("id"),
        at: row.get("at"),
        message_id: row.get("message_id"),
        sender_id: row.get("sender_id"),
        kind: match kind.as_str() {
            "security_check" => AuditKind::SecurityCheck,
            "security_decision" => AuditKind::SecurityDecision,
            "pipeline_outcome" => AuditKind::PipelineOutcome,
            other => anyhow::bail!("unknown audit kind: {}", other),
        },
        check: row.get("check_name"),
        outcome: match outcome.as_str() {
            "pass" => AuditOutcome::Pass,
            "flagged" => AuditOutcome::Flagged,
            "fail" => AuditOutcome::Fail,
            other => anyhow::bail!("unknown audit outcome: {}", other),
        },
        detail: serde_json::from_str(&detail).unwrap_or(serde_json::json!({})),
    })
}
