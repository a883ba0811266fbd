//! End-to-end capture flows through the library API, with recorded intent
//! fixtures standing in for the live classifier.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use vault_capture::classify::{write_fixture, IntentRequest, IntentResponse, ReplayOracle};
use vault_capture::config::{parse_config, Config};
use vault_capture::db;
use vault_capture::hints;
use vault_capture::models::{ContentType, ExtractedMetadata, ProcessingStatus};
use vault_capture::process::{MessageOutcome, Processor};
use vault_capture::source::LocalPayloads;
use vault_capture::vault::parse_note;

/// Minimal valid PDF with one line of text and correct xref offsets.
fn minimal_pdf(text: &str) -> Vec<u8> {
    let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", text);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::new();
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>".to_string(),
        format!("<< /Length {} >> stream\n{}\nendstream", stream.len(), stream),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj {} endobj\n", i + 1, body).as_bytes());
    }
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(format!("trailer << /Size {} /Root 1 0 R >>\nstartxref\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(format!("{}\n%%EOF\n", xref_start).as_bytes());
    out
}

fn config(root: &Path, extra: &str) -> Config {
    parse_config(&format!(
        r#"[db]
path = "{root}/vcap.sqlite"

[vault]
root = "{root}/vault"

[sync]
target_dir = "{root}/sync"

[classifier]
provider = "replay"
fixtures_dir = "{root}/fixtures"
{extra}
"#,
        root = root.display(),
        extra = extra
    ))
    .unwrap()
}

async fn processor(cfg: &Config) -> Processor {
    let pool = db::open(cfg).await.unwrap();
    let fixtures = cfg.classifier.fixtures_dir.clone().unwrap();
    Processor::with_parts(
        cfg,
        pool,
        Arc::new(LocalPayloads),
        Arc::new(ReplayOracle::new(fixtures)),
        None,
        None,
    )
    .unwrap()
}

fn record(cfg: &Config, text: &str, content_type: ContentType, filename: Option<&str>, response: IntentResponse) {
    let request = IntentRequest {
        residual_text: hints::parse(text).residual_text,
        content_type,
        filename: filename.map(str::to_string),
    };
    write_fixture(cfg.classifier.fixtures_dir.as_deref().unwrap(), &request, &response).unwrap();
}

#[tokio::test]
async fn receipt_pdf_is_renamed_archived_and_synced() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path(), "");
    let caption = "archive this receipt from Bunnings for plumbing $45.99";

    let pdf = tmp.path().join("invoice.pdf");
    std::fs::write(&pdf, minimal_pdf("Bunnings Warehouse tax invoice")).unwrap();
    record(
        &cfg,
        caption,
        ContentType::Document,
        Some("invoice.pdf"),
        IntentResponse {
            pipeline: "receipt".into(),
            confidence: 0.93,
            metadata: ExtractedMetadata {
                vendor: Some("Bunnings".into()),
                category: Some("PLUMBING".into()),
                ..Default::default()
            },
            suggested_tags: vec!["home".into()],
        },
    );

    let p = processor(&cfg).await;
    let message = LocalPayloads::from_file(&pdf, Some(caption)).unwrap();
    assert_eq!(message.content_type, ContentType::Document);
    let ids = p.inject(std::slice::from_ref(&message)).await.unwrap();
    let summary = p.process_ids(&ids).await.unwrap();
    assert_eq!(summary.completed, 1, "{:?}", p.state().get(&message.id).await.unwrap());

    let stored = p.state().load_message(&message.id).await.unwrap().unwrap();
    let stem = format!(
        "RECEIPT - {} - Bunnings (45.99) - PLUMBING",
        stored.received_at.format("%Y%m%d")
    );
    let receipts = tmp.path().join("vault/Archive/Receipts");
    let artifact = receipts.join(format!("{}.pdf", stem));
    assert!(artifact.exists(), "missing {}", artifact.display());
    assert_eq!(std::fs::read(&artifact).unwrap(), std::fs::read(&pdf).unwrap());
    assert!(tmp.path().join("sync").join("Archive/Receipts").join(format!("{}.pdf", stem)).exists());

    let note = std::fs::read_to_string(receipts.join(format!("{}.md", stem))).unwrap();
    let (fm, body) = parse_note(&note).unwrap();
    assert_eq!(fm.get("pipeline").and_then(|v| v.as_str()), Some("receipt"));
    assert_eq!(fm.get("scope").and_then(|v| v.as_str()), Some("private"));
    assert_eq!(fm.get("vendor").and_then(|v| v.as_str()), Some("Bunnings"));
    assert_eq!(fm.get("amount").and_then(|v| v.as_f64()), Some(45.99));
    assert_eq!(fm.get("original_filename").and_then(|v| v.as_str()), Some("invoice.pdf"));
    assert!(body.contains(&format!("[[{}.pdf]]", stem)));

    let event = &p.notifier().buffer().recent(1)[0];
    assert_eq!(event.pipeline.as_deref(), Some("receipt"));
    assert_eq!(event.output_paths.len(), 3);
}

#[tokio::test]
async fn low_confidence_intent_falls_back_to_note_with_review() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path(), "");
    let text = "thinking about a long weekend in Lisbon";
    record(
        &cfg,
        text,
        ContentType::Text,
        None,
        IntentResponse {
            pipeline: "clip".into(),
            confidence: 0.41,
            metadata: ExtractedMetadata::default(),
            suggested_tags: vec!["travel".into()],
        },
    );

    let p = processor(&cfg).await;
    let message = LocalPayloads::from_text(text, None);
    p.inject(std::slice::from_ref(&message)).await.unwrap();
    let outcome = p.process_message(&message.id).await.unwrap();
    assert!(matches!(outcome, MessageOutcome::Completed { ref pipeline, .. } if pipeline == "note"));

    let reviews = p.audit().reviews(10).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].reason, "low_confidence");
    assert_eq!(reviews[0].detail["suggested_pipeline"], "clip");
}

#[tokio::test]
async fn missing_fixture_degrades_with_warning() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path(), "");
    let p = processor(&cfg).await;
    let message = LocalPayloads::from_text("unrecorded thought", None);
    p.inject(std::slice::from_ref(&message)).await.unwrap();
    p.process_message(&message.id).await.unwrap();

    let record = p.state().get(&message.id).await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    let outcome: serde_json::Value = serde_json::from_str(record.outcome.as_deref().unwrap()).unwrap();
    assert_eq!(outcome["pipeline"], "note");
    assert!(outcome["warnings"][0]
        .as_str()
        .unwrap()
        .starts_with("classification fell back to default"));
}

#[tokio::test]
async fn near_miss_tags_go_to_review_or_get_corrected() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path(), "\n[tags]\nvocabulary = [\"health\", \"finance\"]\n");
    let p = processor(&cfg).await;
    let message = LocalPayloads::from_text("/note checkup booked #helth", None);
    p.inject(std::slice::from_ref(&message)).await.unwrap();
    p.process_message(&message.id).await.unwrap();
    let reviews = p.audit().reviews(10).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].reason, "tag_correction");
    assert_eq!(reviews[0].detail["tag"], "helth");

    let tmp = TempDir::new().unwrap();
    let cfg = config(
        tmp.path(),
        "\n[tags]\nvocabulary = [\"health\", \"finance\"]\nauto_correct = true\n",
    );
    let p = processor(&cfg).await;
    p.inject(std::slice::from_ref(&message)).await.unwrap();
    let outcome = p.process_message(&message.id).await.unwrap();
    let MessageOutcome::Completed { paths, .. } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    let (fm, _) = parse_note(&std::fs::read_to_string(&paths[0]).unwrap()).unwrap();
    let tags: Vec<&str> = fm
        .get("tags")
        .and_then(|v| v.as_sequence())
        .unwrap()
        .iter()
        .filter_map(|t| t.as_str())
        .collect();
    assert!(tags.contains(&"health"));
    assert!(!tags.contains(&"helth"));
    assert!(fm.get("tag_corrections").is_some());
}

#[tokio::test]
async fn reprocessing_overwrites_own_note() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path(), "");
    let p = processor(&cfg).await;
    let message = LocalPayloads::from_text("/note same note twice", None);
    p.inject(std::slice::from_ref(&message)).await.unwrap();
    let first = p.process_message(&message.id).await.unwrap();

    // Completed records are not reprocessed; force one more run.
    sqlx::query("UPDATE processing_records SET status = 'pending' WHERE message_id = ?")
        .bind(&message.id)
        .execute(p.state().pool())
        .await
        .unwrap();
    let second = p.process_message(&message.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::read_dir(tmp.path().join("vault/Inbox")).unwrap().count(), 1);
}

#[tokio::test]
async fn compliant_archive_name_is_kept_verbatim() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(tmp.path(), "");
    let name = "CONTRACT - 20240208 - Lease.PDF";
    let file = tmp.path().join(name);
    std::fs::write(&file, minimal_pdf("Residential lease agreement")).unwrap();

    let p = processor(&cfg).await;
    let message = LocalPayloads::from_file(&file, Some("/archive")).unwrap();
    let ids = p.inject(std::slice::from_ref(&message)).await.unwrap();
    assert_eq!(p.process_ids(&ids).await.unwrap().completed, 1);

    let mut names: Vec<String> = std::fs::read_dir(tmp.path().join("vault/Archive"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["CONTRACT - 20240208 - Lease.PDF", "CONTRACT - 20240208 - Lease.md"]);
    assert!(tmp.path().join("sync/Archive").join(name).exists());
}
