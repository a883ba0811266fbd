use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Immutable inbound messages, stored as JSON
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            content_type TEXT NOT NULL,
            message_json TEXT NOT NULL,
            received_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One state-machine row per message
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_records (
            message_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            error_class TEXT,
            content_type TEXT NOT NULL,
            outcome_json TEXT,
            owner TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before claim ownership existed
    let has_owner: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('processing_records') WHERE name = 'owner'",
    )
    .fetch_one(pool)
    .await?;
    if has_owner == 0 {
        sqlx::query("ALTER TABLE processing_records ADD COLUMN owner TEXT")
            .execute(pool)
            .await?;
    }

    // Live runners and their lease heartbeats
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            run_id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Source cursors
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only audit trail
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            at INTEGER NOT NULL,
            message_id TEXT NOT NULL,
            sender_id TEXT,
            kind TEXT NOT NULL,
            check_name TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS audit_log_no_update
        BEFORE UPDATE ON audit_log
        BEGIN
            SELECT RAISE(ABORT, 'audit_log is append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
        BEFORE DELETE ON audit_log
        BEGIN
            SELECT RAISE(ABORT, 'audit_log is append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    // Items flagged for human review (low confidence, ambiguous tags)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS review_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            at INTEGER NOT NULL,
            message_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            detail_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Paths written per message, so reprocessing overwrites instead of duplicating
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vault_outputs (
            message_id TEXT NOT NULL,
            role TEXT NOT NULL,
            path TEXT NOT NULL,
            written_at INTEGER NOT NULL,
            PRIMARY KEY (message_id, role),
            UNIQUE(path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_status ON processing_records(status, updated_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_message ON audit_log(message_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_review_message ON review_queue(message_id)")
        .execute(pool)
        .await?;

    Ok(())
}
