use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAi,
    Hash,
}

/// Service settings, read once at startup. Keys keep the spelling used by
/// existing `settings.json` files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "OPENAI_API_KEY")]
    pub openai_api_key: String,
    #[serde(rename = "METADATA_FILE_PATH")]
    pub metadata_file_path: PathBuf,
    #[serde(rename = "LOG_LEVEL")]
    pub log_level: String,
    #[serde(rename = "HOST")]
    pub host: String,
    #[serde(rename = "PORT")]
    pub port: u16,
    #[serde(rename = "DATABASES_DIR")]
    pub databases_dir: PathBuf,
    #[serde(rename = "EMBEDDING_PROVIDER")]
    pub embedding_provider: EmbeddingProvider,
    #[serde(rename = "EMBEDDING_MODEL")]
    pub embedding_model: String,
    #[serde(rename = "OPENAI_BASE_URL")]
    pub openai_base_url: String,
    #[serde(rename = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,
    #[serde(rename = "ALLOWED_ORIGIN")]
    pub allowed_origin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            metadata_file_path: PathBuf::from("database_metadata.json"),
            log_level: "INFO".to_string(),
            host: "0.0.0.0".to_string(),
            port: 5004,
            databases_dir: PathBuf::from("databases"),
            embedding_provider: EmbeddingProvider::OpenAi,
            embedding_model: "text-embedding-ada-002".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            request_timeout_secs: 60,
            allowed_origin: "https://chat.openai.com".to_string(),
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file yields the defaults; a file
    /// that exists but does not parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file {}", path.display()))?;
            serde_json::from_str::<Settings>(&raw)
                .with_context(|| format!("failed to parse settings file {}", path.display()))?
        } else {
            Settings::default()
        };

        if settings.openai_api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                settings.openai_api_key = key;
            }
        }

        Ok(settings)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Filter directive for the tracing subscriber, e.g. `INFO` -> `info`.
    pub fn log_filter(&self) -> String {
        self.log_level.to_lowercase()
    }
}
