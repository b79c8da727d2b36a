use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::llm::TogetherProvider;
use crate::persona::{DEFAULT_ASSISTANT_NAME, Persona, Style};

// ============================================================================
// Config (server file)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Sessions unused for this long are dropped.
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            session_idle_timeout_seconds: default_session_idle_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_request_timeout() -> u64 {
    120
}

fn default_session_idle_timeout() -> u64 {
    30 * 60
}

// ============================================================================
// ProviderConfig (environment)
// ============================================================================

/// An API key that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Key with everything but the first and last four characters masked.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(****)")
    }
}

/// Provider and conversation settings, read once from the environment.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: ApiKey,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub request_timeout: Duration,
    pub persona: Persona,
    /// Whether `TEMPERATURE`/`TOP_P` were set explicitly and must survive style changes.
    pub sampling_pinned: SamplingPinned,
    /// Maximum number of non-system messages kept per conversation.
    pub memory_limit: Option<usize>,
    /// Directory for JSONL transcripts, when conversation logging is enabled.
    pub transcript_dir: Option<PathBuf>,
    pub streaming: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingPinned {
    pub temperature: bool,
    pub top_p: bool,
}

pub const DEFAULT_MODEL: &str = "mistralai/Mixtral-8x7B-Instruct-v0.1";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TOP_K: u32 = 40;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOG_DIR: &str = "logs";

impl ProviderConfig {
    /// Read configuration from the process environment, falling back to
    /// `./.env` for variables the environment does not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dotenv = read_dotenv(Path::new(".env"))?;
        Self::from_lookup(layered(|key| std::env::var(key).ok(), &dotenv))
    }

    /// Read configuration through `lookup`, validating every value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = var("TOGETHER_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let style = match var("CONVERSATION_STYLE") {
            Some(name) => name.parse::<Style>()?,
            None => Style::default(),
        };

        let temperature_var: Option<f32> = parse_opt(&var, "TEMPERATURE")?;
        let top_p_var: Option<f32> = parse_opt(&var, "TOP_P")?;

        let max_tokens: u32 = parse_opt(&var, "MAX_TOKENS")?.unwrap_or(DEFAULT_MAX_TOKENS);
        let top_k: u32 = parse_opt(&var, "TOP_K")?.unwrap_or(DEFAULT_TOP_K);
        let timeout_secs: u64 =
            parse_opt(&var, "REQUEST_TIMEOUT")?.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS);
        let memory_limit: Option<usize> = parse_opt(&var, "MEMORY_LIMIT")?;

        let transcript_dir = if parse_flag(&var, "LOG_CONVERSATIONS", false) {
            Some(PathBuf::from(
                var("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            ))
        } else {
            None
        };

        let config = Self {
            api_key: ApiKey(api_key),
            base_url: var("TOGETHER_BASE_URL")
                .unwrap_or_else(|| TogetherProvider::DEFAULT_BASE_URL.to_string()),
            model: var("TOGETHER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens,
            temperature: temperature_var.unwrap_or_else(|| style.temperature()),
            top_p: top_p_var.unwrap_or_else(|| style.top_p()),
            top_k,
            request_timeout: Duration::from_secs(timeout_secs),
            persona: Persona::new(
                DEFAULT_ASSISTANT_NAME,
                var("USERNAME").unwrap_or_else(|| "User".to_string()),
                style,
            ),
            sampling_pinned: SamplingPinned {
                temperature: temperature_var.is_some(),
                top_p: top_p_var.is_some(),
            },
            memory_limit,
            transcript_dir,
            streaming: parse_flag(&var, "STREAMING", true),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::out_of_range("MAX_TOKENS", self.max_tokens, "> 0"));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ConfigError::out_of_range(
                "TEMPERATURE",
                self.temperature,
                "[0, 1]",
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ConfigError::out_of_range("TOP_P", self.top_p, "(0, 1]"));
        }
        if self.top_k == 0 {
            return Err(ConfigError::out_of_range("TOP_K", self.top_k, "> 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::out_of_range("REQUEST_TIMEOUT", 0, "> 0"));
        }
        if self.memory_limit == Some(0) {
            return Err(ConfigError::out_of_range("MEMORY_LIMIT", 0, "> 0"));
        }
        Ok(())
    }

    /// Same configuration in another conversation style.
    ///
    /// Sampling parameters follow the style unless they were set explicitly.
    #[must_use]
    pub fn with_style(&self, style: Style) -> Self {
        let mut config = self.clone();
        config.persona = self.persona.with_style(style);
        if !self.sampling_pinned.temperature {
            config.temperature = style.temperature();
        }
        if !self.sampling_pinned.top_p {
            config.top_p = style.top_p();
        }
        config
    }
}

/// Parse a dotenv file. A missing file yields no entries.
pub fn read_dotenv(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    match dotenvy::from_path_iter(path) {
        Ok(iter) => {
            let entries = iter.collect::<Result<HashMap<_, _>, _>>()?;
            debug!(path = %path.display(), vars = entries.len(), "Loaded dotenv file");
            Ok(entries)
        }
        Err(e) if e.not_found() => {
            debug!(path = %path.display(), "No dotenv file");
            Ok(HashMap::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Look keys up in `primary` first, then in `fallback`.
fn layered<'a, F>(
    primary: F,
    fallback: &'a HashMap<String, String>,
) -> impl Fn(&str) -> Option<String> + 'a
where
    F: Fn(&str) -> Option<String> + 'a,
{
    move |key: &str| primary(key).or_else(|| fallback.get(key).cloned())
}

fn parse_opt<T, V>(var: &V, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_flag<V>(var: &V, key: &str, default: bool) -> bool
where
    V: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("failed to read .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),

    #[error("TOGETHER_API_KEY is not set")]
    MissingApiKey,

    #[error("invalid value for {key} ('{value}'): {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} out of range: {value} (expected {expected})")]
    OutOfRange {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Style(#[from] crate::persona::UnknownStyle),
}

impl ConfigError {
    fn out_of_range(key: &'static str, value: impl fmt::Display, expected: &'static str) -> Self {
        Self::OutOfRange {
            key,
            value: value.to_string(),
            expected,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
