//! Processing orchestration.
//!
//! Coordinates the capture flow for one message:
//!
//! ```text
//! begin_processing → caption hints → extract → transcript hints
//!     → security gate → classify → tag correction → pipeline
//!     → vault commit → complete → notify
//! ```
//!
//! Any stage may fail with a [`ProcessError`]; the record is then marked
//! `failed` with the error's class and never left in `processing`. Every
//! terminal outcome is audited and emitted as an event.
//!
//! Batches run on a small bounded pool (`processing.workers`). Registration
//! is independent of processing, so polling can keep registering while a
//! batch is in flight. A batch heartbeats the runner lease while it runs,
//! and one message's store error never stops the rest of the batch.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::classify::{oracle_from_config, IntentOracle, Router};
use crate::config::Config;
use crate::db;
use crate::error::ProcessError;
use crate::extract::{backends_from_config, ExtractInput, ExtractorRegistry, TranscriptionBackend, VisionBackend};
use crate::hints;
use crate::models::{
    AuditKind, AuditOutcome, Command, ContentType, Directive, ErrorClass, Message, ParsedHints, ProcessingStatus,
};
use crate::notify::{Event, Notifier};
use crate::pipelines::{Executors, PipelineInput};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::security::SecurityGate;
use crate::source::{poll_and_register, source_from_config, PollSummary, SourceAdapter};
use crate::state::StateStore;
use crate::tags::TagCorrector;
use crate::vault::VaultWriter;

/// How one message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Completed { pipeline: String, paths: Vec<String> },
    Failed { class: ErrorClass, reason: String },
    /// Not pending (already taken by another worker, or not found).
    Skipped,
}

/// Counters for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Result of a successful run, before the state transition.
struct Success {
    pipeline: String,
    title: String,
    tags: Vec<String>,
    paths: Vec<String>,
    warnings: Vec<String>,
    outcome: serde_json::Value,
}

pub struct Processor {
    config: Config,
    state: StateStore,
    audit: AuditLog,
    source: Arc<dyn SourceAdapter>,
    extractors: ExtractorRegistry,
    gate: SecurityGate,
    router: Router,
    tags: TagCorrector,
    executors: Executors,
    vault: VaultWriter,
    notifier: Notifier,
    reporter: Box<dyn ProgressReporter>,
}

impl Processor {
    /// Open the database and build every component the config names.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let source = source_from_config(config)?;
        Self::with_source(config, source).await
    }

    /// As [`from_config`](Self::from_config) with an explicit source adapter.
    pub async fn with_source(config: &Config, source: Arc<dyn SourceAdapter>) -> Result<Self> {
        let pool = db::open(config).await?;
        let oracle = oracle_from_config(&config.classifier)?;
        let (transcriber, vision) = backends_from_config(config)?;
        Self::with_parts(config, pool, source, oracle, transcriber, vision)
    }

    pub fn with_parts(
        config: &Config,
        pool: SqlitePool,
        source: Arc<dyn SourceAdapter>,
        oracle: Arc<dyn IntentOracle>,
        transcriber: Option<Arc<dyn TranscriptionBackend>>,
        vision: Option<Arc<dyn VisionBackend>>,
    ) -> Result<Self> {
        let audit = AuditLog::new(pool.clone());
        Ok(Self {
            config: config.clone(),
            state: StateStore::new(pool.clone()),
            gate: SecurityGate::new(&config.security, audit.clone())?,
            audit,
            source,
            extractors: ExtractorRegistry::from_config(config, transcriber, vision.clone())?,
            router: Router::new(oracle, config.classifier.confidence_threshold),
            tags: TagCorrector::from_config(&config.tags),
            executors: Executors::new(config.vault.clone(), vision),
            vault: VaultWriter::new(config, pool),
            notifier: Notifier::from_config(&config.notify)?,
            reporter: Box::new(NoProgress),
        })
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Crash recovery: return records held by dead runners to `pending`.
    /// Safe while other runners are live.
    pub async fn recover(&self) -> Result<u64> {
        let lease = self.config.processing.lease_secs as i64;
        let n = self.state.recover_interrupted(lease).await?;
        if n > 0 {
            warn!(recovered = n, "demoted interrupted records to pending");
        }
        Ok(n)
    }

    /// Give up this runner's lease. Call on clean exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.state.release().await
    }

    pub async fn poll(&self) -> Result<PollSummary> {
        let summary = poll_and_register(self.source.as_ref(), &self.state).await?;
        self.reporter.report(ProgressEvent::Polled {
            source: self.source.name().to_string(),
            registered: summary.registered,
        });
        Ok(summary)
    }

    /// Register injected messages. Returns the ids that are new.
    pub async fn inject(&self, messages: &[Message]) -> Result<Vec<String>> {
        let mut fresh = Vec::new();
        for message in messages {
            let reg = self.state.register_with_cursor(message, None).await?;
            if reg.is_new {
                fresh.push(message.id.clone());
            } else {
                info!(message_id = %message.id, status = %reg.record.status, "already registered");
            }
        }
        Ok(fresh)
    }

    /// Process every pending record.
    pub async fn process_pending(&self) -> Result<BatchSummary> {
        let ids: Vec<String> = self
            .state
            .list_by_status(ProcessingStatus::Pending)
            .await?
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        self.process_ids(&ids).await
    }

    /// Process the given records on the bounded worker pool.
    pub async fn process_ids(&self, ids: &[String]) -> Result<BatchSummary> {
        let total = ids.len() as u64;
        let mut summary = BatchSummary {
            total: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            return Ok(summary);
        }

        let mut results = stream::iter(ids)
            .map(|id| async move { (id, self.process_message(id).await) })
            .buffer_unordered(self.config.processing.workers);
        let beat = Duration::from_secs((self.config.processing.lease_secs / 3).max(1));
        let mut heartbeat = tokio::time::interval(beat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut done = 0u64;
        loop {
            tokio::select! {
                next = results.next() => {
                    let Some((id, result)) = next else { break };
                    done += 1;
                    match result {
                        Ok(MessageOutcome::Completed { .. }) => summary.completed += 1,
                        Ok(MessageOutcome::Failed { .. }) => summary.failed += 1,
                        Ok(MessageOutcome::Skipped) => summary.skipped += 1,
                        Err(e) => {
                            summary.failed += 1;
                            self.abandon(id, &e).await;
                        }
                    }
                    self.reporter.report(ProgressEvent::Processing { n: done, total });
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.state.heartbeat().await {
                        warn!(error = %format!("{:#}", e), "lease heartbeat failed");
                    }
                }
            }
        }

        info!(
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch complete"
        );
        Ok(summary)
    }

    /// Drive one record to a terminal state. `Err` only for state store failures.
    pub async fn process_message(&self, message_id: &str) -> Result<MessageOutcome> {
        if !self.state.begin_processing(message_id).await? {
            debug!(message_id, "not pending; skipping");
            return Ok(MessageOutcome::Skipped);
        }

        let message = match self.state.load_message(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                let err = ProcessError::Permanent("message body missing".to_string());
                return self.record_failure(message_id, None, None, err).await;
            }
            Err(e) => {
                let err = ProcessError::Permanent(format!("{:#}", e));
                return self.record_failure(message_id, None, None, err).await;
            }
        };

        match self.run(&message).await {
            Ok(success) => self.record_success(&message, success).await,
            Err(err) => {
                let content_type = message.content_type.as_str().to_string();
                self.record_failure(message_id, Some(&message.sender_id), Some(content_type), err)
                    .await
            }
        }
    }

    /// A store error left `message_id` without a terminal state. Fail it
    /// as transient if it is still ours; another runner may own it now.
    async fn abandon(&self, message_id: &str, err: &anyhow::Error) {
        let reason = format!("{:#}", err);
        error!(message_id, %reason, "processing aborted");
        if let Err(e) = self.state.fail(message_id, ErrorClass::Transient, &reason).await {
            warn!(message_id, error = %format!("{:#}", e), "could not mark aborted record failed");
        }
    }

    async fn run(&self, message: &Message) -> Result<Success, ProcessError> {
        let caption_hints = hints::parse(&message.hint_text());
        let caption_directives = directives_of(&caption_hints);

        let input = ExtractInput {
            message,
            residual_text: &caption_hints.residual_text,
            directives: &caption_directives,
        };
        let mut content = self.extractors.extract(&input, self.source.resolver()).await?;

        let scanned = if content.text.is_empty() {
            message.hint_text()
        } else {
            format!("{}\n{}", message.hint_text(), content.text)
        };

        // Dictated hints count as if typed after the caption.
        let (hints, directives) = if message.content_type == ContentType::Voice && !content.text.is_empty() {
            let merged = hints::parse(&scanned);
            content.text = hints::parse(&content.text).residual_text;
            let directives = directives_of(&merged);
            (merged, directives)
        } else {
            (caption_hints, caption_directives)
        };
        let decision = self
            .gate
            .check(&message.id, &message.sender_id, &scanned, &hints.commands)
            .await?;
        if !decision.allow {
            return Err(ProcessError::SecurityRejected(decision.reasons.join(", ")));
        }

        let classification = self
            .router
            .classify(&hints, &decision.commands, message.content_type, message.filename())
            .await;
        if let Some(review) = &classification.review {
            self.audit.add_review(&message.id, "low_confidence", review).await?;
        }

        let tag_outcome = self.tags.apply(&hints.tags);
        for review in &tag_outcome.reviews {
            self.audit
                .add_review(&message.id, "tag_correction", &serde_json::to_value(review).unwrap_or_default())
                .await?;
        }
        let mut tags: BTreeSet<String> = tag_outcome.tags.clone();
        tags.extend(classification.result.suggested_tags.iter().cloned());

        let mut warnings = content.warnings.clone();
        warnings.extend(classification.warnings.iter().cloned());
        if !decision.blocked_commands.is_empty() {
            warnings.push(format!("dropped unknown commands: {}", decision.blocked_commands.join(", ")));
        }

        let draft = self
            .executors
            .execute(&PipelineInput {
                message,
                content: &content,
                hints: &hints,
                classification: &classification.result,
                tags: &tags,
                directives: &directives,
                tag_corrections: &tag_outcome.corrections,
                warnings: &warnings,
            })
            .await?;
        let written = self.vault.commit(&message.id, &draft).await?;

        let paths = written.paths();
        let pipeline = draft.pipeline.as_str().to_string();
        Ok(Success {
            outcome: json!({
                "pipeline": pipeline,
                "title": draft.title,
                "classification_source": classification.result.source.as_str(),
                "confidence": classification.result.confidence,
                "output_paths": paths,
                "warnings": warnings,
            }),
            pipeline,
            title: draft.title,
            tags: tags.into_iter().collect(),
            paths,
            warnings,
        })
    }

    async fn record_success(&self, message: &Message, success: Success) -> Result<MessageOutcome> {
        self.state.complete(&message.id, &success.outcome).await?;
        self.audit
            .append(
                &message.id,
                Some(&message.sender_id),
                AuditKind::PipelineOutcome,
                "pipeline",
                AuditOutcome::Pass,
                &success.outcome,
            )
            .await?;
        info!(
            message_id = %message.id,
            pipeline = %success.pipeline,
            warnings = success.warnings.len(),
            "completed"
        );
        self.notifier
            .emit(Event {
                event_type: "capture.completed".to_string(),
                status: ProcessingStatus::Completed.as_str().to_string(),
                message_id: message.id.clone(),
                content_type: message.content_type.as_str().to_string(),
                pipeline: Some(success.pipeline.clone()),
                title: Some(success.title),
                tags: success.tags,
                source_metadata: source_metadata(message),
                output_paths: success.paths.clone(),
                error: None,
                error_class: None,
                timestamp: chrono::Utc::now().to_rfc3339(),
            })
            .await;
        Ok(MessageOutcome::Completed {
            pipeline: success.pipeline,
            paths: success.paths,
        })
    }

    async fn record_failure(
        &self,
        message_id: &str,
        sender_id: Option<&str>,
        content_type: Option<String>,
        err: ProcessError,
    ) -> Result<MessageOutcome> {
        let class = err.class();
        let reason = err.reason().to_string();
        self.state.fail(message_id, class, &reason).await?;
        let attempts = self.state.get(message_id).await?.map(|r| r.attempts).unwrap_or_default();
        let detail = json!({ "error_class": class.as_str(), "reason": reason, "attempts": attempts });
        self.audit
            .append(
                message_id,
                sender_id,
                AuditKind::PipelineOutcome,
                "pipeline",
                AuditOutcome::Fail,
                &detail,
            )
            .await?;
        match class {
            ErrorClass::Transient => warn!(message_id, attempts, %reason, "transient failure"),
            _ => error!(message_id, attempts, error_class = %class, %reason, "terminal failure"),
        }
        self.notifier
            .emit(Event {
                event_type: "capture.failed".to_string(),
                status: ProcessingStatus::Failed.as_str().to_string(),
                message_id: message_id.to_string(),
                content_type: content_type.unwrap_or_default(),
                pipeline: None,
                title: None,
                tags: Vec::new(),
                source_metadata: json!({ "sender_id": sender_id }),
                output_paths: Vec::new(),
                error: Some(reason.clone()),
                error_class: Some(class.as_str().to_string()),
                timestamp: chrono::Utc::now().to_rfc3339(),
            })
            .await;
        Ok(MessageOutcome::Failed { class, reason })
    }

    /// Explicit retry of one failed record, any class.
    pub async fn retry_message(&self, message_id: &str) -> Result<bool> {
        let reset = self.state.reset_to_pending(message_id).await?;
        if reset {
            info!(message_id, "reset to pending");
        }
        Ok(reset)
    }

    /// Reset every failed record except security rejections.
    pub async fn retry_failed(&self) -> Result<u64> {
        let n = self.state.reset_failed().await?;
        info!(reset = n, "failed records reset to pending");
        Ok(n)
    }

    /// One watch cycle: recover dead runners' records, requeue transient
    /// failures, poll, process.
    pub async fn cycle(&self) -> Result<BatchSummary> {
        self.recover().await?;
        let requeued = self
            .state
            .requeue_transient(self.config.processing.max_attempts)
            .await?;
        if requeued > 0 {
            info!(requeued, "requeued transient failures");
        }
        if let Err(e) = self.poll().await {
            warn!(error = %format!("{:#}", e), "poll failed; processing queued messages");
        }
        self.process_pending().await
    }

    /// Run [`cycle`](Self::cycle) every `interval` until `shutdown` resolves.
    pub async fn watch(&self, interval: Duration, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            match self.cycle().await {
                Ok(summary) => debug!(?summary, "watch cycle done"),
                Err(e) => error!(error = %format!("{:#}", e), "watch cycle failed"),
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("watch stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

fn directives_of(hints: &ParsedHints) -> Vec<Directive> {
    hints
        .commands
        .iter()
        .filter_map(|c| match Command::parse(c) {
            Command::Directive(d) => Some(d),
            _ => None,
        })
        .collect()
}

fn source_metadata(message: &Message) -> serde_json::Value {
    json!({
        "source": message.source,
        "sender_id": message.sender_id,
        "received_at": message.received_at.to_rfc3339(),
        "filename": message.filename(),
        "caption": message.caption,
    })
}
