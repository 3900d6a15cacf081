use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 25;
pub const DEFAULT_DOCUMENT_TEXT_LIMIT: usize = 3000;
const DEFAULT_IMPORT_SESSION_TTL_SECS: u64 = 60 * 60;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEV_SETTINGS_SECRET: &str = "cuentas-dev-secret-v1";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub openai: OpenAiConfig,
    pub import_batch_size: usize,
    /// Idle time after which an import session is dropped from memory.
    pub import_session_ttl: Duration,
    pub document_text_limit: usize,
    pub max_upload_bytes: usize,
    pub settings_secret: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        OpenAiConfig {
            api_key: None,
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_path: PathBuf::from("cuentas.sqlite"),
            openai: OpenAiConfig::default(),
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
            import_session_ttl: Duration::from_secs(DEFAULT_IMPORT_SESSION_TTL_SECS),
            document_text_limit: DEFAULT_DOCUMENT_TEXT_LIMIT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            settings_secret: DEV_SETTINGS_SECRET.to_string(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from the environment, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = AppConfig::default();

        let settings_secret = match env::var("CUENTAS_SETTINGS_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ => {
                tracing::warn!("CUENTAS_SETTINGS_SECRET not set, using development secret");
                defaults.settings_secret.clone()
            }
        };

        Ok(AppConfig {
            bind_addr: get_env("CUENTAS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_path: get_env("CUENTAS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            openai: OpenAiConfig {
                api_key: get_env("OPENAI_API_KEY"),
                model: get_env("OPENAI_MODEL").unwrap_or(defaults.openai.model),
                base_url: get_env("OPENAI_BASE_URL").unwrap_or(defaults.openai.base_url),
            },
            import_batch_size: positive_env("CUENTAS_IMPORT_BATCH_SIZE", defaults.import_batch_size)?,
            import_session_ttl: Duration::from_secs(
                positive_env("CUENTAS_IMPORT_SESSION_TTL_SECS", DEFAULT_IMPORT_SESSION_TTL_SECS as usize)? as u64,
            ),
            document_text_limit: positive_env("CUENTAS_DOCUMENT_TEXT_LIMIT", defaults.document_text_limit)?,
            max_upload_bytes: positive_env("CUENTAS_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            settings_secret,
        })
    }
}

fn get_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn positive_env(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(anyhow!("{} must be a positive integer, got '{}'", key, raw)),
        },
    }
}
