//! Configuration types and loading.
//!
//! Non-secret settings come from a JSON file (e.g. `~/.lessonbot/config.json`, missing file
//! means defaults). Secrets come only from the environment; see [`Secrets::from_env`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    /// Include the failure class and message in error replies to the chat.
    /// Overridden by LESSONBOT_DEBUG_ERRORS env.
    #[serde(default)]
    pub debug_errors: bool,

    /// When set, downloaded images are also written here as `<file_id>.<ext>`.
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
}

/// HTTP bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port (default 8080). Overridden by PORT env.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0"; the platform must reach the webhook).
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Public URL of `/webhook`. When set, `serve` registers it on start and removes it on shutdown.
    pub webhook_url: Option<String>,
    /// Secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Overridden by TELEGRAM_WEBHOOK_SECRET env.
    pub webhook_secret: Option<String>,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api_base(),
            webhook_url: None,
            webhook_secret: None,
        }
    }
}

/// Summarization model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiConfig {
    #[serde(default = "default_gemini_api_base")]
    pub api_base: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

fn default_gemini_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: default_gemini_api_base(),
            model: default_gemini_model(),
        }
    }
}

/// OCR settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionConfig {
    #[serde(default = "default_vision_api_base")]
    pub api_base: String,
    /// BCP-47 hints passed to the recognizer (e.g. ["ru", "en"]). Empty lets it detect.
    #[serde(default)]
    pub language_hints: Vec<String>,
}

fn default_vision_api_base() -> String {
    "https://vision.googleapis.com/v1".to_string()
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_base: default_vision_api_base(),
            language_hints: Vec::new(),
        }
    }
}

/// Document archival settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Drive folder for uploaded images. Omit to upload to the root of the authorized drive.
    pub drive_folder_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drive_folder_id: None,
        }
    }
}

/// Per-stage timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutsConfig {
    #[serde(default = "default_telegram_secs")]
    pub telegram_secs: u64,
    #[serde(default = "default_ocr_secs")]
    pub ocr_secs: u64,
    #[serde(default = "default_summarize_secs")]
    pub summarize_secs: u64,
    #[serde(default = "default_archive_secs")]
    pub archive_secs: u64,
}

fn default_telegram_secs() -> u64 {
    20
}

fn default_ocr_secs() -> u64 {
    30
}

fn default_summarize_secs() -> u64 {
    40
}

fn default_archive_secs() -> u64 {
    40
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            telegram_secs: default_telegram_secs(),
            ocr_secs: default_ocr_secs(),
            summarize_secs: default_summarize_secs(),
            archive_secs: default_archive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    120
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the listen port: env PORT overrides config.
pub fn resolve_port(config: &Config) -> u16 {
    non_empty(std::env::var("PORT").ok())
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.server.port)
}

/// Resolve the webhook secret: env TELEGRAM_WEBHOOK_SECRET overrides config.
pub fn resolve_webhook_secret(config: &Config) -> Option<String> {
    non_empty(std::env::var("TELEGRAM_WEBHOOK_SECRET").ok())
        .or_else(|| non_empty(config.telegram.webhook_secret.clone()))
}

/// Resolve debug error replies: env LESSONBOT_DEBUG_ERRORS ("1"/"true") overrides config.
pub fn resolve_debug_errors(config: &Config) -> bool {
    match non_empty(std::env::var("LESSONBOT_DEBUG_ERRORS").ok()) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => config.debug_errors,
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("LESSONBOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".lessonbot").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

pub const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_VISION_CREDENTIALS: &str = "GOOGLE_VISION_CREDENTIALS";
pub const ENV_DOC_ID: &str = "GOOGLE_DOC_ID";
pub const ENV_CLIENT_ID: &str = "GOOGLE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "GOOGLE_CLIENT_SECRET";
pub const ENV_REFRESH_TOKEN: &str = "GOOGLE_REFRESH_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

/// OAuth client used for Drive and Docs.
#[derive(Clone)]
pub struct OAuthClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Archival target and credentials.
#[derive(Clone)]
pub struct ArchiveSecrets {
    pub document_id: String,
    pub oauth: OAuthClientSecrets,
}

/// Process-wide secrets. Debug output is redacted.
#[derive(Clone)]
pub struct Secrets {
    pub bot_token: String,
    pub gemini_api_key: String,
    /// Service-account key JSON for the OCR service.
    pub vision_credentials: String,
    /// Present when archival is enabled.
    pub archive: Option<ArchiveSecrets>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("bot_token", &"<redacted>")
            .field("gemini_api_key", &"<redacted>")
            .field("vision_credentials", &"<redacted>")
            .field(
                "archive_document_id",
                &self.archive.as_ref().map(|a| a.document_id.as_str()),
            )
            .finish()
    }
}

impl Secrets {
    /// Read secrets from the process environment.
    pub fn from_env(archive_enabled: bool) -> Result<Self, ConfigError> {
        Self::from_lookup(archive_enabled, |k| std::env::var(k).ok())
    }

    /// Read secrets through `lookup`. Every missing or blank variable is reported at once.
    pub fn from_lookup(
        archive_enabled: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut require = |name: &'static str| -> String {
            match non_empty(lookup(name)) {
                Some(v) => v,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };
        let bot_token = require(ENV_BOT_TOKEN);
        let gemini_api_key = require(ENV_GEMINI_API_KEY);
        let vision_credentials = require(ENV_VISION_CREDENTIALS);
        let archive = if archive_enabled {
            Some(ArchiveSecrets {
                document_id: require(ENV_DOC_ID),
                oauth: OAuthClientSecrets {
                    client_id: require(ENV_CLIENT_ID),
                    client_secret: require(ENV_CLIENT_SECRET),
                    refresh_token: require(ENV_REFRESH_TOKEN),
                },
            })
        } else {
            None
        };
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        Ok(Self {
            bot_token,
            gemini_api_key,
            vision_credentials,
            archive,
        })
    }
}
