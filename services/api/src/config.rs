use secrecy::SecretString;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: SecretString,
    pub openai_base_url: Option<String>,
    pub chat_model: String,
    pub realtime_model: Option<String>,
    pub realtime_base_url: Option<String>,
    pub context_ttl: Duration,
    pub upstream_timeout: Duration,
    pub history_limit: usize,
    pub draft_debounce: Duration,
    pub prompts_dir: Option<PathBuf>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// A `.env` file in the current directory is read first when present.
    ///
    /// *   `BIND_ADDRESS`: Address to listen on. Defaults to "0.0.0.0:3000".
    /// *   `OPENAI_API_KEY`: Required. Used for both chat completions and realtime voice.
    /// *   `OPENAI_BASE_URL`: (Optional) Chat completions base URL.
    /// *   `CHAT_MODEL`: (Optional) Chat model. Defaults to "gpt-4o".
    /// *   `REALTIME_MODEL`, `REALTIME_BASE_URL`: (Optional) Realtime voice endpoint overrides.
    /// *   `CONTEXT_TTL_SECS`: (Optional) Context cache lifetime. Defaults to 300.
    /// *   `UPSTREAM_TIMEOUT_SECS`: (Optional) Voice upstream connect timeout. Defaults to 10.
    /// *   `HISTORY_LIMIT`: (Optional) Sessions returned by history. Defaults to 20.
    /// *   `DRAFT_DEBOUNCE_MS`: (Optional) Draft autosave delay. Defaults to 1000.
    /// *   `PROMPTS_DIR`: (Optional) Directory of `.md` prompt overrides.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{log_level_str}' is not a valid log level"),
            )
        })?;

        Ok(Self {
            bind_address: parse_or(
                &lookup,
                "BIND_ADDRESS",
                SocketAddr::from(([0, 0, 0, 0], 3000)),
            )?,
            openai_api_key: SecretString::from(openai_api_key),
            openai_base_url: lookup("OPENAI_BASE_URL"),
            chat_model: lookup("CHAT_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            realtime_model: lookup("REALTIME_MODEL"),
            realtime_base_url: lookup("REALTIME_BASE_URL"),
            context_ttl: Duration::from_secs(parse_or(&lookup, "CONTEXT_TTL_SECS", 300)?),
            upstream_timeout: Duration::from_secs(parse_or(&lookup, "UPSTREAM_TIMEOUT_SECS", 10)?),
            history_limit: parse_or(&lookup, "HISTORY_LIMIT", 20)?,
            draft_debounce: Duration::from_millis(parse_or(&lookup, "DRAFT_DEBOUNCE_MS", 1000)?),
            prompts_dir: lookup("PROMPTS_DIR").map(PathBuf::from),
            log_level,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}
