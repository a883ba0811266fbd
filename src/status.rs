//! Operator reporting: queue status, audit trail and review queue.
//!
//! Everything here prints to stdout as fixed-width tables so the output can
//! be read at a glance or piped through `grep`/`awk`.

use anyhow::Result;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::models::{ProcessingRecord, ProcessingStatus};
use crate::state::StateStore;

/// Longest reason shown in the failed-items table.
const REASON_WIDTH: usize = 60;

/// Print status counts, then every failed record with its reason.
pub async fn run_status(config: &Config, state: &StateStore, audit: &AuditLog) -> Result<()> {
    let counts = state.counts().await?;
    let failed = state.list_by_status(ProcessingStatus::Failed).await?;
    let reviews = audit.review_count().await?;
    let db_size = std::fs::metadata(&config.db.path).map(|m| m.len()).unwrap_or(0);

    println!("Vault Capture Status");
    println!("====================");
    println!();
    println!("  Database:    {} ({})", config.db.path.display(), format_bytes(db_size));
    println!("  Vault:       {}", config.vault.root.display());
    println!();
    print!("{}", format_counts(&counts));
    println!();
    println!("  Awaiting review: {}", reviews);

    if !failed.is_empty() {
        println!();
        println!("  Failed:");
        print!("{}", format_failed(&failed));
    }
    println!();
    Ok(())
}

/// The status-count table. Every status appears, including zero counts.
pub fn format_counts(counts: &[(ProcessingStatus, i64)]) -> String {
    let mut out = format!("  {:<12} {:>8}\n", "STATUS", "COUNT");
    out.push_str(&format!("  {}\n", "-".repeat(21)));
    let mut total = 0;
    for status in ProcessingStatus::ALL {
        let n = counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        total += n;
        out.push_str(&format!("  {:<12} {:>8}\n", status.as_str(), n));
    }
    out.push_str(&format!("  {:<12} {:>8}\n", "total", total));
    out
}

pub fn format_failed(records: &[ProcessingRecord]) -> String {
    let mut out = format!(
        "  {:<28} {:<10} {:<10} {:>8}   {}\n",
        "MESSAGE", "TYPE", "CLASS", "ATTEMPTS", "REASON"
    );
    out.push_str(&format!("  {}\n", "-".repeat(96)));
    for r in records {
        out.push_str(&format!(
            "  {:<28} {:<10} {:<10} {:>8}   {}\n",
            r.message_id,
            r.content_type.as_str(),
            r.error_class.map(|c| c.as_str()).unwrap_or("-"),
            r.attempts,
            truncate(r.last_error.as_deref().unwrap_or(""), REASON_WIDTH)
        ));
    }
    out
}

/// Print the most recent audit entries, newest first.
pub async fn run_audit(audit: &AuditLog, limit: i64) -> Result<()> {
    let entries = audit.recent(limit).await?;
    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    println!(
        "  {:<17} {:<28} {:<18} {:<17} {:<8} {}",
        "AT", "MESSAGE", "KIND", "CHECK", "OUTCOME", "DETAIL"
    );
    println!("  {}", "-".repeat(110));
    for e in &entries {
        println!(
            "  {:<17} {:<28} {:<18} {:<17} {:<8} {}",
            format_ts(e.at),
            e.message_id,
            e.kind.as_str(),
            e.check,
            e.outcome.as_str(),
            truncate(&e.detail.to_string(), REASON_WIDTH)
        );
    }
    Ok(())
}

/// Print items waiting for manual review, newest first.
pub async fn run_review(audit: &AuditLog, limit: i64) -> Result<()> {
    let items = audit.reviews(limit).await?;
    if items.is_empty() {
        println!("Review queue is empty.");
        return Ok(());
    }
    println!(
        "  {:>5} {:<17} {:<28} {:<16} {}",
        "ID", "AT", "MESSAGE", "REASON", "DETAIL"
    );
    println!("  {}", "-".repeat(96));
    for item in &items {
        println!(
            "  {:>5} {:<17} {:<28} {:<16} {}",
            item.id,
            format_ts(item.at),
            item.message_id,
            item.reason,
            truncate(&item.detail.to_string(), REASON_WIDTH)
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, ErrorClass};

    #[test]
    fn counts_table_lists_every_status() {
        let table = format_counts(&[(ProcessingStatus::Completed, 3), (ProcessingStatus::Failed, 1)]);
        assert!(table.contains("pending"));
        assert!(table.contains("processing"));
        let completed = table.lines().find(|l| l.trim_start().starts_with("completed")).unwrap();
        assert!(completed.trim_end().ends_with('3'));
        let total = table.lines().last().unwrap();
        assert!(total.trim_end().ends_with('4'));
    }

    #[test]
    fn failed_table_shows_reason_and_class() {
        let record = ProcessingRecord {
            message_id: "42:7".into(),
            status: ProcessingStatus::Failed,
            attempts: 2,
            last_error: Some("unsupported codec: audio/x-unknown".into()),
            error_class: Some(ErrorClass::Permanent),
            content_type: ContentType::Voice,
            outcome: None,
            created_at: 0,
            updated_at: 0,
        };
        let table = format_failed(&[record]);
        let row = table.lines().nth(2).unwrap();
        assert!(row.contains("42:7"));
        assert!(row.contains("permanent"));
        assert!(row.contains("unsupported codec"));
    }

    #[test]
    fn truncate_long_reasons() {
        let long = "x".repeat(100);
        let t = truncate(&long, 10);
        assert_eq!(t.chars().count(), 10);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("first\nsecond", 10), "first");
    }
}
