use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pricing::DEFAULT_MODEL;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub guards: GuardsConfig,
    pub webhook: WebhookConfig,
    pub search: SearchConfig,
    pub finance: FinanceConfig,
    pub model: ModelConfig,
    pub streaming: StreamingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct GuardsConfig {
    /// Model used to price tool actions that carry no model of their own.
    pub default_model: String,
    pub idempotency_ttl_secs: u64,
    pub idempotency_max_entries: usize,
    /// Per-agent daily budget in EUR. Agents without an entry are uncapped.
    pub daily_budgets: HashMap<String, f64>,
}

/// Retry and breaker tuning shared by every downstream client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownstreamConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl DownstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub hmac_secret: Option<SecretString>,
    pub downstream: DownstreamConfig,
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub top_k: u32,
    pub cache_ttl_secs: u64,
    pub downstream: DownstreamConfig,
}

#[derive(Clone, Debug)]
pub struct FinanceConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub cache_ttl_secs: u64,
    pub downstream: DownstreamConfig,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub downstream: DownstreamConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamingConfig {
    pub retry_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub buffer: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub default_model: Option<String>,
    pub webhook_base_url: Option<String>,
    pub search_base_url: Option<String>,
    pub finance_base_url: Option<String>,
    pub model_base_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_owned(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            guards: GuardsConfig {
                default_model: DEFAULT_MODEL.to_owned(),
                idempotency_ttl_secs: 24 * 60 * 60,
                idempotency_max_entries: 10_000,
                daily_budgets: HashMap::new(),
            },
            webhook: WebhookConfig {
                base_url: None,
                api_key: None,
                hmac_secret: None,
                downstream: DownstreamConfig {
                    timeout_ms: 25_000,
                    max_attempts: 3,
                    backoff_ms: 1_000,
                    breaker_threshold: 5,
                    breaker_cooldown_ms: 60_000,
                },
            },
            search: SearchConfig {
                base_url: None,
                api_key: None,
                top_k: 6,
                cache_ttl_secs: 300,
                downstream: DownstreamConfig {
                    timeout_ms: 10_000,
                    max_attempts: 2,
                    backoff_ms: 750,
                    breaker_threshold: 4,
                    breaker_cooldown_ms: 45_000,
                },
            },
            finance: FinanceConfig {
                base_url: None,
                api_key: None,
                cache_ttl_secs: 60,
                downstream: DownstreamConfig {
                    timeout_ms: 8_000,
                    max_attempts: 2,
                    backoff_ms: 1_000,
                    breaker_threshold: 4,
                    breaker_cooldown_ms: 30_000,
                },
            },
            model: ModelConfig {
                base_url: None,
                api_key: None,
                downstream: DownstreamConfig {
                    timeout_ms: 60_000,
                    max_attempts: 2,
                    backoff_ms: 1_000,
                    breaker_threshold: 5,
                    breaker_cooldown_ms: 60_000,
                },
            },
            streaming: StreamingConfig {
                retry_ms: 2_500,
                heartbeat_interval_ms: 15_000,
                drain_timeout_ms: 10_000,
                buffer: 64,
            },
            logging: LoggingConfig { level: "info".to_owned(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl GatewayConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("neura.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(guards) = patch.guards {
            if let Some(default_model) = guards.default_model {
                self.guards.default_model = default_model;
            }
            if let Some(ttl) = guards.idempotency_ttl_secs {
                self.guards.idempotency_ttl_secs = ttl;
            }
            if let Some(max_entries) = guards.idempotency_max_entries {
                self.guards.idempotency_max_entries = max_entries;
            }
            if let Some(daily_budgets) = guards.daily_budgets {
                self.guards.daily_budgets.extend(daily_budgets);
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(base_url) = webhook.base_url {
                self.webhook.base_url = Some(base_url);
            }
            if let Some(api_key_value) = webhook.api_key {
                self.webhook.api_key = Some(secret_value(api_key_value));
            }
            if let Some(hmac_secret_value) = webhook.hmac_secret {
                self.webhook.hmac_secret = Some(secret_value(hmac_secret_value));
            }
            webhook.downstream.apply(&mut self.webhook.downstream);
        }

        if let Some(search) = patch.search {
            if let Some(base_url) = search.base_url {
                self.search.base_url = Some(base_url);
            }
            if let Some(api_key_value) = search.api_key {
                self.search.api_key = Some(secret_value(api_key_value));
            }
            if let Some(top_k) = search.top_k {
                self.search.top_k = top_k;
            }
            if let Some(cache_ttl_secs) = search.cache_ttl_secs {
                self.search.cache_ttl_secs = cache_ttl_secs;
            }
            search.downstream.apply(&mut self.search.downstream);
        }

        if let Some(finance) = patch.finance {
            if let Some(base_url) = finance.base_url {
                self.finance.base_url = Some(base_url);
            }
            if let Some(api_key_value) = finance.api_key {
                self.finance.api_key = Some(secret_value(api_key_value));
            }
            if let Some(cache_ttl_secs) = finance.cache_ttl_secs {
                self.finance.cache_ttl_secs = cache_ttl_secs;
            }
            finance.downstream.apply(&mut self.finance.downstream);
        }

        if let Some(model) = patch.model {
            if let Some(base_url) = model.base_url {
                self.model.base_url = Some(base_url);
            }
            if let Some(api_key_value) = model.api_key {
                self.model.api_key = Some(secret_value(api_key_value));
            }
            model.downstream.apply(&mut self.model.downstream);
        }

        if let Some(streaming) = patch.streaming {
            if let Some(retry_ms) = streaming.retry_ms {
                self.streaming.retry_ms = retry_ms;
            }
            if let Some(heartbeat_interval_ms) = streaming.heartbeat_interval_ms {
                self.streaming.heartbeat_interval_ms = heartbeat_interval_ms;
            }
            if let Some(drain_timeout_ms) = streaming.drain_timeout_ms {
                self.streaming.drain_timeout_ms = drain_timeout_ms;
            }
            if let Some(buffer) = streaming.buffer {
                self.streaming.buffer = buffer;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("NEURA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("NEURA_SERVER_PORT") {
            self.server.port = parse_u16("NEURA_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("NEURA_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("NEURA_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("NEURA_GUARDS_DEFAULT_MODEL") {
            self.guards.default_model = value;
        }
        if let Some(value) = read_env("NEURA_GUARDS_IDEMPOTENCY_TTL_SECS") {
            self.guards.idempotency_ttl_secs =
                parse_u64("NEURA_GUARDS_IDEMPOTENCY_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("NEURA_GUARDS_IDEMPOTENCY_MAX_ENTRIES") {
            self.guards.idempotency_max_entries =
                parse_u64("NEURA_GUARDS_IDEMPOTENCY_MAX_ENTRIES", &value)? as usize;
        }

        if let Some(value) = read_env("NEURA_WEBHOOK_BASE_URL") {
            self.webhook.base_url = Some(value);
        }
        if let Some(value) = read_env("NEURA_WEBHOOK_API_KEY") {
            self.webhook.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("NEURA_WEBHOOK_HMAC_SECRET") {
            self.webhook.hmac_secret = Some(secret_value(value));
        }
        apply_downstream_env("NEURA_WEBHOOK", &mut self.webhook.downstream)?;

        if let Some(value) = read_env("NEURA_SEARCH_BASE_URL") {
            self.search.base_url = Some(value);
        }
        if let Some(value) = read_env("NEURA_SEARCH_API_KEY") {
            self.search.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("NEURA_SEARCH_TOP_K") {
            self.search.top_k = parse_u32("NEURA_SEARCH_TOP_K", &value)?;
        }
        if let Some(value) = read_env("NEURA_SEARCH_CACHE_TTL_SECS") {
            self.search.cache_ttl_secs = parse_u64("NEURA_SEARCH_CACHE_TTL_SECS", &value)?;
        }
        apply_downstream_env("NEURA_SEARCH", &mut self.search.downstream)?;

        if let Some(value) = read_env("NEURA_FINANCE_BASE_URL") {
            self.finance.base_url = Some(value);
        }
        if let Some(value) = read_env("NEURA_FINANCE_API_KEY") {
            self.finance.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("NEURA_FINANCE_CACHE_TTL_SECS") {
            self.finance.cache_ttl_secs = parse_u64("NEURA_FINANCE_CACHE_TTL_SECS", &value)?;
        }
        apply_downstream_env("NEURA_FINANCE", &mut self.finance.downstream)?;

        if let Some(value) = read_env("NEURA_MODEL_BASE_URL") {
            self.model.base_url = Some(value);
        }
        if let Some(value) = read_env("NEURA_MODEL_API_KEY") {
            self.model.api_key = Some(secret_value(value));
        }
        apply_downstream_env("NEURA_MODEL", &mut self.model.downstream)?;

        if let Some(value) = read_env("NEURA_STREAMING_RETRY_MS") {
            self.streaming.retry_ms = parse_u64("NEURA_STREAMING_RETRY_MS", &value)?;
        }
        if let Some(value) = read_env("NEURA_STREAMING_HEARTBEAT_INTERVAL_MS") {
            self.streaming.heartbeat_interval_ms =
                parse_u64("NEURA_STREAMING_HEARTBEAT_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("NEURA_STREAMING_DRAIN_TIMEOUT_MS") {
            self.streaming.drain_timeout_ms =
                parse_u64("NEURA_STREAMING_DRAIN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("NEURA_STREAMING_BUFFER") {
            self.streaming.buffer = parse_u64("NEURA_STREAMING_BUFFER", &value)? as usize;
        }

        let log_level = read_env("NEURA_LOGGING_LEVEL").or_else(|| read_env("NEURA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("NEURA_LOGGING_FORMAT").or_else(|| read_env("NEURA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(default_model) = overrides.default_model {
            self.guards.default_model = default_model;
        }
        if let Some(base_url) = overrides.webhook_base_url {
            self.webhook.base_url = Some(base_url);
        }
        if let Some(base_url) = overrides.search_base_url {
            self.search.base_url = Some(base_url);
        }
        if let Some(base_url) = overrides.finance_base_url {
            self.finance.base_url = Some(base_url);
        }
        if let Some(base_url) = overrides.model_base_url {
            self.model.base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_guards(&self.guards)?;
        let webhook = &self.webhook;
        validate_downstream("webhook", webhook.base_url.as_deref(), &webhook.downstream)?;
        validate_secret("webhook.hmac_secret", webhook.hmac_secret.as_ref())?;
        validate_downstream("search", self.search.base_url.as_deref(), &self.search.downstream)?;
        if self.search.top_k == 0 {
            return Err(ConfigError::Validation(
                "search.top_k must be greater than zero".to_owned(),
            ));
        }
        let finance = &self.finance;
        validate_downstream("finance", finance.base_url.as_deref(), &finance.downstream)?;
        validate_downstream("model", self.model.base_url.as_deref(), &self.model.downstream)?;
        validate_streaming(&self.streaming)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("neura.toml"), PathBuf::from("config/neura.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn apply_downstream_env(
    prefix: &str,
    downstream: &mut DownstreamConfig,
) -> Result<(), ConfigError> {
    let key = format!("{prefix}_TIMEOUT_MS");
    if let Some(value) = read_env(&key) {
        downstream.timeout_ms = parse_u64(&key, &value)?;
    }
    let key = format!("{prefix}_MAX_ATTEMPTS");
    if let Some(value) = read_env(&key) {
        downstream.max_attempts = parse_u32(&key, &value)?;
    }
    let key = format!("{prefix}_BACKOFF_MS");
    if let Some(value) = read_env(&key) {
        downstream.backoff_ms = parse_u64(&key, &value)?;
    }
    let key = format!("{prefix}_BREAKER_THRESHOLD");
    if let Some(value) = read_env(&key) {
        downstream.breaker_threshold = parse_u32(&key, &value)?;
    }
    let key = format!("{prefix}_BREAKER_COOLDOWN_MS");
    if let Some(value) = read_env(&key) {
        downstream.breaker_cooldown_ms = parse_u64(&key, &value)?;
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_owned()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_owned(),
        ));
    }

    Ok(())
}

fn validate_guards(guards: &GuardsConfig) -> Result<(), ConfigError> {
    if guards.default_model.trim().is_empty() {
        return Err(ConfigError::Validation("guards.default_model must not be empty".to_owned()));
    }
    if guards.idempotency_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "guards.idempotency_ttl_secs must be greater than zero".to_owned(),
        ));
    }
    if guards.idempotency_max_entries == 0 {
        return Err(ConfigError::Validation(
            "guards.idempotency_max_entries must be greater than zero".to_owned(),
        ));
    }
    if let Some((agent, cap)) =
        guards.daily_budgets.iter().find(|(_, cap)| !cap.is_finite() || **cap < 0.0)
    {
        return Err(ConfigError::Validation(format!(
            "guards.daily_budgets.{agent} must be a finite amount >= 0 (got {cap})"
        )));
    }
    Ok(())
}

fn validate_downstream(
    section: &str,
    base_url: Option<&str>,
    downstream: &DownstreamConfig,
) -> Result<(), ConfigError> {
    if let Some(base_url) = base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "{section}.base_url must start with http:// or https://"
            )));
        }
    }
    if downstream.timeout_ms == 0 || downstream.timeout_ms > 300_000 {
        return Err(ConfigError::Validation(format!(
            "{section}.timeout_ms must be in range 1..=300000"
        )));
    }
    if downstream.max_attempts == 0 {
        return Err(ConfigError::Validation(format!(
            "{section}.max_attempts must be greater than zero"
        )));
    }
    if downstream.breaker_threshold == 0 {
        return Err(ConfigError::Validation(format!(
            "{section}.breaker_threshold must be greater than zero"
        )));
    }
    Ok(())
}

fn validate_secret(key: &str, secret: Option<&SecretString>) -> Result<(), ConfigError> {
    let blank = secret.map(|value| value.expose_secret().trim().is_empty()).unwrap_or(false);
    if blank {
        return Err(ConfigError::Validation(format!("{key} must not be blank when set")));
    }
    Ok(())
}

fn validate_streaming(streaming: &StreamingConfig) -> Result<(), ConfigError> {
    if streaming.heartbeat_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "streaming.heartbeat_interval_ms must be greater than zero".to_owned(),
        ));
    }
    if streaming.drain_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "streaming.drain_timeout_ms must be greater than zero".to_owned(),
        ));
    }
    if streaming.buffer == 0 {
        return Err(ConfigError::Validation(
            "streaming.buffer must be greater than zero".to_owned(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_owned(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    guards: Option<GuardsPatch>,
    webhook: Option<WebhookPatch>,
    search: Option<SearchPatch>,
    finance: Option<FinancePatch>,
    model: Option<ModelPatch>,
    streaming: Option<StreamingPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardsPatch {
    default_model: Option<String>,
    idempotency_ttl_secs: Option<u64>,
    idempotency_max_entries: Option<usize>,
    daily_budgets: Option<HashMap<String, f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct DownstreamPatch {
    timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
    breaker_threshold: Option<u32>,
    breaker_cooldown_ms: Option<u64>,
}

impl DownstreamPatch {
    fn apply(self, downstream: &mut DownstreamConfig) {
        if let Some(timeout_ms) = self.timeout_ms {
            downstream.timeout_ms = timeout_ms;
        }
        if let Some(max_attempts) = self.max_attempts {
            downstream.max_attempts = max_attempts;
        }
        if let Some(backoff_ms) = self.backoff_ms {
            downstream.backoff_ms = backoff_ms;
        }
        if let Some(breaker_threshold) = self.breaker_threshold {
            downstream.breaker_threshold = breaker_threshold;
        }
        if let Some(breaker_cooldown_ms) = self.breaker_cooldown_ms {
            downstream.breaker_cooldown_ms = breaker_cooldown_ms;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    hmac_secret: Option<String>,
    #[serde(flatten)]
    downstream: DownstreamPatch,
}

#[derive(Debug, Default, Deserialize)]
struct SearchPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    top_k: Option<u32>,
    cache_ttl_secs: Option<u64>,
    #[serde(flatten)]
    downstream: DownstreamPatch,
}

#[derive(Debug, Default, Deserialize)]
struct FinancePatch {
    base_url: Option<String>,
    api_key: Option<String>,
    cache_ttl_secs: Option<u64>,
    #[serde(flatten)]
    downstream: DownstreamPatch,
}

#[derive(Debug, Default, Deserialize)]
struct ModelPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    #[serde(flatten)]
    downstream: DownstreamPatch,
}

#[derive(Debug, Default, Deserialize)]
struct StreamingPatch {
    retry_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
