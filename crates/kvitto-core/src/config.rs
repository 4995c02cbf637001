//! Process configuration.
//!
//! One explicit struct per concern, loaded from the environment once at
//! process start and validated eagerly. Adapters and stages receive the
//! sub-struct they need; there is no global settings object.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default mailbox filter expression.
pub const DEFAULT_MAILBOX_QUERY: &str = "has:attachment";

/// Default per-run attachment budget.
pub const DEFAULT_MAX_ATTACHMENTS: i64 = 200;

/// Default maximum attachment size (20 MiB).
pub const DEFAULT_MAX_SIZE_BYTES: i64 = 20 * 1024 * 1024;

/// Inline images below this size are presumed signature logos (32 KiB).
pub const DEFAULT_MIN_IMAGE_BYTES: i64 = 32 * 1024;

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    /// Absolute path of the storage root.
    pub storage_root: PathBuf,
    pub scan: ScanConfig,
    pub mailbox: MailboxConfig,
    pub embedding: EmbeddingConfig,
}

/// Directory scanner options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Subdirectory of the storage root to scan.
    pub subdir: String,
    /// Filename glob pattern.
    pub pattern: String,
    pub recursive: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            subdir: "incoming".to_string(),
            pattern: "*".to_string(),
            recursive: true,
        }
    }
}

/// Mailbox collector policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Provider filter expression.
    pub query: String,
    /// MIME allow-list; anything else is quarantined. Empty admits all.
    pub allowed_mime_types: Vec<String>,
    /// Attachments above this size are quarantined without download.
    pub max_size_bytes: i64,
    /// Inline images below this size are quarantined (signature heuristic).
    pub min_image_bytes: i64,
    /// Senders whose messages are skipped without inspecting attachments.
    pub blacklist_senders: Vec<String>,
    /// Per-run attachment budget.
    pub max_attachments: i64,
    /// Apply best-effort label mutation after processing a message.
    pub mark_processed: bool,
    /// Emit one JSON line per decision to the job's .jsonl log.
    pub verbose_decisions: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            query: DEFAULT_MAILBOX_QUERY.to_string(),
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "application/pdf".to_string(),
            ],
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            min_image_bytes: DEFAULT_MIN_IMAGE_BYTES,
            blacklist_senders: Vec::new(),
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
            mark_processed: true,
            verbose_decisions: false,
        }
    }
}

/// Embedding backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of an Ollama-compatible embedding endpoint.
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_secs: 60,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match env_opt(key) {
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| Error::Config(format!("{} must be an integer, got {:?}", key, v))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_opt(key) {
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(Error::Config(format!(
                "{} must be a boolean, got {:?}",
                key, other
            ))),
        },
        None => Ok(default),
    }
}

fn env_csv(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load from environment variables (a `.env` file is honored when
    /// present) and validate.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_opt("KVITTO_DATABASE_URL")
            .or_else(|| env_opt("DATABASE_URL"))
            .ok_or_else(|| Error::Config("KVITTO_DATABASE_URL is required".to_string()))?;

        let storage_root = env_opt("KVITTO_STORAGE_ROOT")
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config("KVITTO_STORAGE_ROOT is required".to_string()))?;

        let scan_defaults = ScanConfig::default();
        let mail_defaults = MailboxConfig::default();
        let embed_defaults = EmbeddingConfig::default();

        let allowed = env_csv("KVITTO_MAILBOX_ALLOWED_MIMES");

        let config = Self {
            database_url,
            storage_root,
            scan: ScanConfig {
                subdir: env_opt("KVITTO_SCAN_SUBDIR").unwrap_or(scan_defaults.subdir),
                pattern: env_opt("KVITTO_SCAN_PATTERN").unwrap_or(scan_defaults.pattern),
                recursive: env_bool("KVITTO_SCAN_RECURSIVE", scan_defaults.recursive)?,
            },
            mailbox: MailboxConfig {
                query: env_opt("KVITTO_MAILBOX_QUERY").unwrap_or(mail_defaults.query),
                allowed_mime_types: if allowed.is_empty() {
                    mail_defaults.allowed_mime_types
                } else {
                    allowed
                },
                max_size_bytes: env_i64(
                    "KVITTO_MAILBOX_MAX_SIZE_BYTES",
                    mail_defaults.max_size_bytes,
                )?,
                min_image_bytes: env_i64(
                    "KVITTO_MAILBOX_MIN_IMAGE_BYTES",
                    mail_defaults.min_image_bytes,
                )?,
                blacklist_senders: env_csv("KVITTO_MAILBOX_BLACKLIST"),
                max_attachments: env_i64(
                    "KVITTO_MAILBOX_MAX_ATTACHMENTS",
                    mail_defaults.max_attachments,
                )?,
                mark_processed: env_bool(
                    "KVITTO_MAILBOX_MARK_PROCESSED",
                    mail_defaults.mark_processed,
                )?,
                verbose_decisions: env_bool(
                    "KVITTO_MAILBOX_VERBOSE",
                    mail_defaults.verbose_decisions,
                )?,
            },
            embedding: EmbeddingConfig {
                base_url: env_opt("KVITTO_EMBED_URL").unwrap_or(embed_defaults.base_url),
                model: env_opt("KVITTO_EMBED_MODEL").unwrap_or(embed_defaults.model),
                timeout_secs: env_i64("KVITTO_EMBED_TIMEOUT_SECS", 60)? as u64,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants once at process start.
    pub fn validate(&self) -> Result<()> {
        if !self.storage_root.is_absolute() {
            return Err(Error::Config(format!(
                "storage root must be absolute: {}",
                self.storage_root.display()
            )));
        }
        if self.mailbox.max_size_bytes <= 0 {
            return Err(Error::Config(
                "mailbox max_size_bytes must be positive".to_string(),
            ));
        }
        if self.mailbox.min_image_bytes < 0 {
            return Err(Error::Config(
                "mailbox min_image_bytes must be non-negative".to_string(),
            ));
        }
        if self.mailbox.max_attachments <= 0 {
            return Err(Error::Config(
                "mailbox max_attachments must be positive".to_string(),
            ));
        }
        if self.scan.pattern.trim().is_empty() {
            return Err(Error::Config("scan pattern must not be empty".to_string()));
        }
        Ok(())
    }
}
