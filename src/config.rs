//! TOML configuration.
//!
//! Every section has serde defaults so a minimal file only needs `[db]` and
//! `[vault]`. Secrets are never read from the file: sections name the
//! environment variable that holds them.
//!
//! ```toml
//! [db]
//! path = "./data/vcap.sqlite"
//!
//! [vault]
//! root = "~/Vault"
//!
//! [source]
//! provider = "telegram"
//! token_env = "TELEGRAM_BOT_TOKEN"
//!
//! [classifier]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! confidence_threshold = 0.8
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub direct: DirectConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: String,
    #[serde(default = "default_clips_dir")]
    pub clips_dir: String,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
    #[serde(default = "default_receipts_dir")]
    pub receipts_dir: String,
}

fn default_inbox_dir() -> String {
    "Inbox".to_string()
}
fn default_clips_dir() -> String {
    "Clips".to_string()
}
fn default_archive_dir() -> String {
    "Archive".to_string()
}
fn default_receipts_dir() -> String {
    "Archive/Receipts".to_string()
}

/// External sync target for archive and receipt artifacts.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_provider")]
    pub provider: String,
    #[serde(default = "default_telegram_url")]
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            provider: default_source_provider(),
            base_url: default_telegram_url(),
            token_env: default_token_env(),
            poll_timeout_secs: default_poll_timeout(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_source_provider() -> String {
    "none".to_string()
}
fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_batch_limit() -> u32 {
    100
}

/// Globs applied when `vcap direct` is given a directory.
#[derive(Debug, Deserialize, Clone)]
pub struct DirectConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractConfig {
    #[serde(default)]
    pub transcription: BackendConfig,
    #[serde(default)]
    pub vision: BackendConfig,
    #[serde(default)]
    pub url: UrlFetchConfig,
}

/// An OpenAI-compatible model backend (transcription, vision, intent).
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_openai_url(),
            model: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackendConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct UrlFetchConfig {
    #[serde(default = "default_url_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Permit loopback/private hosts. Only meant for local test servers.
    #[serde(default)]
    pub allow_private_hosts: bool,
    /// Caption-track endpoint used for YouTube links.
    #[serde(default = "default_transcript_endpoint")]
    pub transcript_endpoint: String,
}

impl Default for UrlFetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_url_timeout(),
            max_bytes: default_max_bytes(),
            user_agent: default_user_agent(),
            allow_private_hosts: false,
            transcript_endpoint: default_transcript_endpoint(),
        }
    }
}

fn default_url_timeout() -> u64 {
    20
}
fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_transcript_endpoint() -> String {
    "https://www.youtube.com/api/timedtext".to_string()
}
fn default_user_agent() -> String {
    concat!("vault-capture/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: usize,
    #[serde(default = "default_per_hour")]
    pub per_hour: usize,
    #[serde(default)]
    pub extra_injection_patterns: Vec<String>,
    /// When non-empty, only these sender ids may capture.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            extra_injection_patterns: Vec::new(),
            allowed_senders: Vec::new(),
        }
    }
}

fn default_per_minute() -> usize {
    10
}
fn default_per_hour() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Directory of captured oracle responses (replay provider, or record target).
    #[serde(default)]
    pub fixtures_dir: Option<PathBuf>,
    /// Record live oracle responses into `fixtures_dir`.
    #[serde(default)]
    pub record: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_openai_url(),
            model: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            confidence_threshold: default_confidence_threshold(),
            fixtures_dir: None,
            record: false,
        }
    }
}

impl ClassifierConfig {
    /// The connection settings as a generic backend config.
    pub fn backend(&self) -> BackendConfig {
        BackendConfig {
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key_env: self.api_key_env.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct TagsConfig {
    #[serde(default)]
    pub vocabulary: Vec<String>,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub auto_correct: bool,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            vocabulary: Vec::new(),
            similarity_threshold: default_similarity_threshold(),
            auto_correct: false,
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    /// A runner that has not heartbeated for this long is considered dead
    /// and its in-flight records are recovered.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            watch_interval_secs: default_watch_interval(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_attempts() -> i64 {
    3
}
fn default_watch_interval() -> u64 {
    60
}
fn default_lease_secs() -> u64 {
    90
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub events_path: Option<PathBuf>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            events_path: None,
            webhook_url: None,
            webhook_secret_env: None,
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.classifier.confidence_threshold) {
        bail!("classifier.confidence_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.tags.similarity_threshold) {
        bail!("tags.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.processing.workers == 0 {
        bail!("processing.workers must be >= 1");
    }
    if config.processing.max_attempts < 1 {
        bail!("processing.max_attempts must be >= 1");
    }
    if config.processing.lease_secs < 3 {
        bail!("processing.lease_secs must be >= 3");
    }
    if config.security.per_minute == 0 || config.security.per_hour == 0 {
        bail!("security.per_minute and security.per_hour must be >= 1");
    }
    if config.security.per_minute > config.security.per_hour {
        bail!("security.per_minute must not exceed security.per_hour");
    }

    match config.source.provider.as_str() {
        "none" | "telegram" => {}
        other => bail!(
            "Unknown source provider: '{}'. Must be none or telegram.",
            other
        ),
    }

    for (name, backend) in [
        ("extract.transcription", &config.extract.transcription),
        ("extract.vision", &config.extract.vision),
    ] {
        match backend.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if backend.model.is_none() {
                    bail!("{}.model must be specified when provider is 'openai'", name);
                }
            }
            other => bail!(
                "Unknown {} provider: '{}'. Must be disabled or openai.",
                name,
                other
            ),
        }
    }

    match config.classifier.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.classifier.model.is_none() {
                bail!("classifier.model must be specified when provider is 'openai'");
            }
        }
        "replay" => {
            if config.classifier.fixtures_dir.is_none() {
                bail!("classifier.fixtures_dir must be set when provider is 'replay'");
            }
        }
        other => bail!(
            "Unknown classifier provider: '{}'. Must be disabled, openai, or replay.",
            other
        ),
    }
    if config.classifier.record && config.classifier.fixtures_dir.is_none() {
        bail!("classifier.record requires classifier.fixtures_dir");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/vcap.sqlite"

[vault]
root = "/tmp/vault"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.vault.inbox_dir, "Inbox");
        assert_eq!(cfg.classifier.confidence_threshold, 0.8);
        assert_eq!(cfg.processing.workers, 2);
        assert_eq!(cfg.source.provider, "none");
        assert!(!cfg.extract.vision.is_enabled());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let text = format!("{}\n[classifier]\nconfidence_threshold = 1.5\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn replay_requires_fixtures_dir() {
        let text = format!("{}\n[classifier]\nprovider = \"replay\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn openai_backend_requires_model() {
        let text = format!("{}\n[extract.vision]\nprovider = \"openai\"\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("extract.vision.model"));
    }
}
