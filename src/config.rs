//! Configuration loading and validation.
//!
//! Values come from an optional TOML file and the environment; environment
//! variables win over the file.

use crate::error::{ConfigError, Result};
use crate::storage::FallbackPolicy;

use anyhow::Context as _;
use serde::Deserialize;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";
const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

/// relaybot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,

    /// Model provider configuration.
    pub model: ModelConfig,

    /// History storage configuration.
    pub storage: StorageConfig,

    /// History retention and prompt window.
    pub history: HistoryConfig,

    /// System instruction prepended to every prompt. `None` uses the
    /// built-in persona.
    pub system_prompt: Option<String>,

    /// HTTP API settings.
    pub api: ApiConfig,

    /// Directory for rolling log files. Logs go to stdout when unset.
    pub log_dir: Option<PathBuf>,
}

/// Model provider configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Provider API key. `None` leaves the relay unable to answer.
    pub api_key: Option<String>,

    /// Chat-completions endpoint URL.
    pub endpoint: String,

    /// Model name as the provider knows it.
    pub model: String,

    pub max_tokens: u32,

    pub temperature: f32,

    /// Upper bound on one model call.
    pub timeout: Duration,

    /// Value of the `HTTP-Referer` header sent to the provider.
    pub referer: Option<String>,

    /// Value of the `X-Title` header sent to the provider.
    pub title: String,
}

/// History storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Durable backend connection string. Local file only when unset.
    pub database_url: Option<String>,

    /// Local fallback history file.
    pub history_file: PathBuf,

    /// Upper bound on each durable backend call.
    pub durable_timeout: Duration,

    pub fallback_policy: FallbackPolicy,

    /// How long a sticky downgrade lasts before the durable backend is
    /// probed again. `None` keeps it for the process lifetime.
    pub reprobe_interval: Option<Duration>,
}

/// History retention configuration.
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// Maximum messages kept per user.
    pub retention: usize,

    /// Maximum history messages sent to the model with each request.
    pub prompt_window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention: crate::conversation::history::DEFAULT_RETENTION,
            prompt_window: 50,
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Copy)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

/// On-disk TOML layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TomlConfig {
    data_dir: Option<PathBuf>,
    system_prompt: Option<String>,
    log_dir: Option<PathBuf>,
    model: TomlModelConfig,
    storage: TomlStorageConfig,
    history: TomlHistoryConfig,
    api: TomlApiConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TomlModelConfig {
    api_key: Option<String>,
    endpoint: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    referer: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TomlStorageConfig {
    database_url: Option<String>,
    history_file: Option<PathBuf>,
    durable_timeout_ms: Option<u64>,
    fallback_policy: Option<FallbackPolicy>,
    reprobe_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TomlHistoryConfig {
    retention: Option<usize>,
    prompt_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TomlApiConfig {
    bind: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        Self::resolve(TomlConfig::default(), |key| std::env::var(key).ok())
    }

    /// Load a TOML config file, then apply environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;

        let file: TomlConfig = toml::from_str(&contents).map_err(|error| ConfigError::Parse {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Default data directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("relaybot"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    fn resolve(file: TomlConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let data_dir = env("RELAYBOT_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(Self::default_data_dir);

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let api_key = env("OPENROUTER_API_KEY")
            .or(file.model.api_key)
            .filter(|key| key != PLACEHOLDER_API_KEY);

        let model = ModelConfig {
            api_key,
            endpoint: env("RELAYBOT_MODEL_ENDPOINT")
                .or(file.model.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.into()),
            model: env("RELAYBOT_MODEL")
                .or(file.model.model)
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            max_tokens: parse_env(&env, "RELAYBOT_MAX_TOKENS")?
                .or(file.model.max_tokens)
                .unwrap_or(2000),
            temperature: parse_env(&env, "RELAYBOT_TEMPERATURE")?
                .or(file.model.temperature)
                .unwrap_or(0.8),
            timeout: Duration::from_secs(
                parse_env(&env, "RELAYBOT_MODEL_TIMEOUT_SECS")?
                    .or(file.model.timeout_secs)
                    .unwrap_or(30),
            ),
            referer: env("RELAYBOT_HTTP_REFERER").or(file.model.referer),
            title: env("RELAYBOT_TITLE")
                .or(file.model.title)
                .unwrap_or_else(|| "relaybot".into()),
        };

        let fallback_policy = match env("RELAYBOT_FALLBACK_POLICY") {
            Some(value) => FallbackPolicy::parse(&value).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "RELAYBOT_FALLBACK_POLICY must be per_request or sticky, got {value:?}"
                ))
            })?,
            None => file.storage.fallback_policy.unwrap_or_default(),
        };

        let storage = StorageConfig {
            database_url: env("DATABASE_URL").or(file.storage.database_url),
            history_file: env("RELAYBOT_HISTORY_FILE")
                .map(PathBuf::from)
                .or(file.storage.history_file)
                .unwrap_or_else(|| data_dir.join("message_history.json")),
            durable_timeout: Duration::from_millis(
                parse_env(&env, "RELAYBOT_STORAGE_TIMEOUT_MS")?
                    .or(file.storage.durable_timeout_ms)
                    .unwrap_or(5_000),
            ),
            fallback_policy,
            reprobe_interval: parse_env(&env, "RELAYBOT_REPROBE_SECS")?
                .or(file.storage.reprobe_interval_secs)
                .map(Duration::from_secs),
        };

        let history = HistoryConfig {
            retention: parse_env(&env, "RELAYBOT_RETENTION")?
                .or(file.history.retention)
                .unwrap_or(HistoryConfig::default().retention),
            prompt_window: parse_env(&env, "RELAYBOT_PROMPT_WINDOW")?
                .or(file.history.prompt_window)
                .unwrap_or(HistoryConfig::default().prompt_window),
        };

        if history.retention == 0 {
            return Err(ConfigError::Invalid("history retention must be at least 1".into()).into());
        }
        if history.prompt_window == 0 {
            return Err(
                ConfigError::Invalid("history prompt window must be at least 1".into()).into(),
            );
        }

        let bind = match env("RELAYBOT_BIND") {
            Some(value) => value.parse::<SocketAddr>().map_err(|_| {
                ConfigError::Invalid(format!("RELAYBOT_BIND is not a socket address: {value:?}"))
            })?,
            None => match parse_env::<u16>(&env, "PORT")? {
                Some(port) => SocketAddr::from(([0, 0, 0, 0], port)),
                None => file
                    .api
                    .bind
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000))),
            },
        };

        Ok(Self {
            system_prompt: env("RELAYBOT_SYSTEM_PROMPT").or(file.system_prompt),
            log_dir: env("RELAYBOT_LOG_DIR").map(PathBuf::from).or(file.log_dir),
            data_dir,
            model,
            storage,
            history,
            api: ApiConfig { bind },
        })
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match env(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value: {value:?}")).into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve_with(file: TomlConfig, vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(file, move |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let config = resolve_with(TomlConfig::default(), &[("RELAYBOT_DATA_DIR", data_dir)])
            .unwrap();

        assert_eq!(config.history.retention, 50);
        assert_eq!(config.history.prompt_window, 50);
        assert_eq!(config.model.model, DEFAULT_MODEL);
        assert_eq!(config.model.timeout, Duration::from_secs(30));
        assert!(config.model.api_key.is_none());
        assert!(config.storage.database_url.is_none());
        assert_eq!(config.storage.fallback_policy, FallbackPolicy::PerRequest);
        assert_eq!(
            config.storage.history_file,
            dir.path().join("message_history.json")
        );
        assert_eq!(config.api.bind.port(), 8000);
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let file: TomlConfig = toml::from_str(&format!(
            r#"
            data_dir = {:?}

            [model]
            model = "from-file"

            [history]
            retention = 20

            [storage]
            fallback_policy = "sticky"
            reprobe_interval_secs = 60
            "#,
            dir.path().to_str().unwrap()
        ))
        .unwrap();

        let config = resolve_with(
            file,
            &[("RELAYBOT_MODEL", "from-env"), ("PORT", "9100")],
        )
        .unwrap();

        assert_eq!(config.model.model, "from-env");
        assert_eq!(config.history.retention, 20);
        assert_eq!(config.storage.fallback_policy, FallbackPolicy::Sticky);
        assert_eq!(config.storage.reprobe_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.api.bind.port(), 9100);
    }

    #[test]
    fn file_accepts_permanent_as_sticky() {
        let file: TomlConfig = toml::from_str(
            r#"
            [storage]
            fallback_policy = "permanent"
            "#,
        )
        .unwrap();

        assert_eq!(file.storage.fallback_policy, Some(FallbackPolicy::Sticky));
    }

    #[test]
    fn placeholder_api_key_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve_with(
            TomlConfig::default(),
            &[
                ("RELAYBOT_DATA_DIR", dir.path().to_str().unwrap()),
                ("OPENROUTER_API_KEY", "your_api_key_here"),
            ],
        )
        .unwrap();

        assert!(config.model.api_key.is_none());
    }

    #[test]
    fn rejects_zero_retention_and_bad_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let error = resolve_with(
            TomlConfig::default(),
            &[("RELAYBOT_DATA_DIR", data_dir), ("RELAYBOT_RETENTION", "0")],
        )
        .unwrap_err();
        assert!(error.to_string().contains("retention"));

        let error = resolve_with(
            TomlConfig::default(),
            &[("RELAYBOT_DATA_DIR", data_dir), ("RELAYBOT_MAX_TOKENS", "lots")],
        )
        .unwrap_err();
        assert!(error.to_string().contains("RELAYBOT_MAX_TOKENS"));

        let error = resolve_with(
            TomlConfig::default(),
            &[
                ("RELAYBOT_DATA_DIR", data_dir),
                ("RELAYBOT_FALLBACK_POLICY", "whenever"),
            ],
        )
        .unwrap_err();
        assert!(matches!(error, crate::Error::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let result: std::result::Result<TomlConfig, _> = toml::from_str("colour = \"blue\"");
        assert!(result.is_err());
    }
}
