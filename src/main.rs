//! # Vault Capture CLI (`vcap`)
//!
//! The `vcap` binary drives the capture pipeline: it polls the message
//! source, processes pending messages into the vault, and reports on the
//! queue, the audit trail and the review queue.
//!
//! ## Usage
//!
//! ```bash
//! vcap --config ./config/vcap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vcap init` | Create the SQLite database and run schema migrations |
//! | `vcap poll` | Fetch and register new messages from the source |
//! | `vcap process` | Process every pending message |
//! | `vcap watch --interval <s>` | Poll and process on a timer until Ctrl-C |
//! | `vcap status` | Table of status counts and failed items |
//! | `vcap retry --message-id <id>` | Reset one failed message to pending |
//! | `vcap retry --failed` | Reset failed messages, except security rejections |
//! | `vcap direct <path\|->` | Inject a file, directory or stdin and process it |
//! | `vcap audit` | Recent audit entries |
//! | `vcap review` | Items waiting for manual review |

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};

use vault_capture::audit::AuditLog;
use vault_capture::process::{BatchSummary, Processor};
use vault_capture::progress::ProgressMode;
use vault_capture::source::LocalPayloads;
use vault_capture::state::StateStore;
use vault_capture::{config, db, logging, migrate, status};

/// Vault Capture CLI: turn captured messages into knowledge-vault notes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vcap.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vcap",
    about = "Vault Capture: route captured messages into a markdown knowledge vault",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vcap.toml")]
    config: PathBuf,

    /// Progress on stderr: off, human or json. Defaults to human on a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Fetch new messages from the source and register them as pending.
    Poll,

    /// Process every pending message.
    Process,

    /// Poll and process repeatedly until interrupted.
    ///
    /// Each cycle also requeues transient failures that are still below
    /// `processing.max_attempts`.
    Watch {
        /// Seconds between cycles. Defaults to `processing.watch_interval_secs`.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show status counts and every failed message with its reason.
    Status,

    /// Reset failed messages to pending.
    #[command(group(ArgGroup::new("target").required(true).args(["message_id", "failed"])))]
    Retry {
        /// Reset this message, whatever its error class.
        #[arg(long)]
        message_id: Option<String>,

        /// Reset all transient and permanent failures.
        #[arg(long)]
        failed: bool,
    },

    /// Inject a file, a directory, or stdin (`-`) and process it now.
    Direct {
        /// File or directory path, or `-` for stdin.
        path: String,

        /// Caption text, parsed for hints like a message caption.
        #[arg(long)]
        caption: Option<String>,
    },

    /// Show recent audit entries.
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show items waiting for manual review.
    Review {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Poll => {
            let processor = Processor::from_config(&cfg).await?.with_reporter(progress.reporter());
            let summary = processor.poll().await?;
            println!(
                "Polled {} item(s): {} new, {} duplicate, {} malformed, {} skipped.",
                summary.polled, summary.registered, summary.duplicates, summary.malformed, summary.skipped
            );
        }
        Commands::Process => {
            let processor = Processor::from_config(&cfg).await?.with_reporter(progress.reporter());
            processor.recover().await?;
            let summary = processor.process_pending().await?;
            processor.shutdown().await?;
            print_summary(&summary);
        }
        Commands::Watch { interval } => {
            let processor = Processor::from_config(&cfg).await?.with_reporter(progress.reporter());
            processor.recover().await?;
            let secs = interval.unwrap_or(cfg.processing.watch_interval_secs).max(1);
            processor
                .watch(Duration::from_secs(secs), async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            processor.shutdown().await?;
        }
        Commands::Status => {
            let pool = db::open(&cfg).await?;
            let state = StateStore::new(pool.clone());
            let audit = AuditLog::new(pool.clone());
            status::run_status(&cfg, &state, &audit).await?;
            pool.close().await;
        }
        Commands::Retry { message_id, failed } => {
            let pool = db::open(&cfg).await?;
            let state = StateStore::new(pool.clone());
            if let Some(id) = message_id {
                if !state.reset_to_pending(&id).await? {
                    anyhow::bail!("message {} is not in failed state", id);
                }
                println!("Reset {} to pending.", id);
            } else if failed {
                let n = state.reset_failed().await?;
                println!("Reset {} failed message(s) to pending.", n);
            }
            pool.close().await;
        }
        Commands::Direct { path, caption } => {
            let messages = if path == "-" {
                let mut text = String::new();
                std::io::stdin().read_to_string(&mut text)?;
                vec![LocalPayloads::from_text(&text, caption.as_deref())]
            } else {
                LocalPayloads::scan(std::path::Path::new(&path), caption.as_deref(), &cfg.direct)?
            };
            let processor = Processor::with_source(&cfg, Arc::new(LocalPayloads))
                .await?
                .with_reporter(progress.reporter());
            processor.recover().await?;
            let fresh = processor.inject(&messages).await?;
            println!(
                "Injected {} message(s): {} new, {} already registered.",
                messages.len(),
                fresh.len(),
                messages.len() - fresh.len()
            );
            let summary = processor.process_ids(&fresh).await?;
            processor.shutdown().await?;
            print_summary(&summary);
        }
        Commands::Audit { limit } => {
            let pool = db::open(&cfg).await?;
            status::run_audit(&AuditLog::new(pool.clone()), limit).await?;
            pool.close().await;
        }
        Commands::Review { limit } => {
            let pool = db::open(&cfg).await?;
            status::run_review(&AuditLog::new(pool.clone()), limit).await?;
            pool.close().await;
        }
    }

    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "Processed {} message(s): {} completed, {} failed, {} skipped.",
        summary.total, summary.completed, summary.failed, summary.skipped
    );
}
