//! Configuration types for the Drill service.
//!
//! Configuration lives in a camelCase JSON file (`drill.json`). Every field
//! has a default, so an empty object or a missing file yields a runnable
//! development setup. Environment variables are applied on top by
//! [`Config::apply_env`].

use std::path::Path;
use std::time::Duration;

use drill_store::PoolConfig;
use serde::{Deserialize, Serialize};

use crate::error::{DrillError, Result};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "drill.json";

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Environment variable selecting the deployment environment.
pub const ENVIRONMENT_ENV: &str = "DRILL_ENV";

/// Longest backoff delay a config may ask for, in seconds (one day).
pub const MAX_RETRY_DELAY_SECS: f64 = 86_400.0;

// ============================================================================
// Defaults
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8000
}

fn default_base_url() -> String {
    drill_llm::DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    drill_llm::DEFAULT_MODEL.to_string()
}

const fn default_evaluation_max_tokens() -> u32 {
    1000
}

const fn default_evaluation_temperature() -> f32 {
    0.5
}

const fn default_evaluation_timeout_secs() -> u64 {
    60
}

const fn default_hint_max_tokens() -> u32 {
    500
}

const fn default_hint_temperature() -> f32 {
    0.7
}

const fn default_hint_timeout_secs() -> u64 {
    30
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_base_delay_secs() -> f64 {
    1.0
}

const fn default_max_delay_secs() -> f64 {
    60.0
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_database_path() -> String {
    "drill.db".to_string()
}

const fn default_min_connections() -> usize {
    1
}

const fn default_max_connections() -> usize {
    10
}

const fn default_checkout_timeout_secs() -> u64 {
    30
}

const fn default_max_lifetime_secs() -> u64 {
    3600
}

const fn default_max_idle_secs() -> u64 {
    600
}

const fn default_statement_timeout_ms() -> u64 {
    30_000
}

const fn default_max_hints() -> u32 {
    3
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_attempts() -> Option<u32> {
    Some(3)
}

const fn default_write_retries() -> u32 {
    5
}

const fn default_min_answer_length() -> usize {
    10
}

const fn default_max_answer_length() -> usize {
    10_000
}

const fn default_true() -> bool {
    true
}

// ============================================================================
// Config
// ============================================================================

/// Main configuration for the Drill service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Deployment environment; controls error detail in responses.
    #[serde(default)]
    pub environment: Environment,

    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Retry policy for provider calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Database and connection pool settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Session progression rules.
    #[serde(default)]
    pub progression: ProgressionConfig,
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `drill.json` in the current directory. If not found, returns
    /// the default configuration.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            DrillError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `drill.json` in a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the defaults. A file with invalid JSON returns
    /// `DrillError::ConfigParseError`; valid JSON with invalid values returns
    /// `DrillError::ConfigValidationError`.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(DrillError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| DrillError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ANTHROPIC_API_KEY` and `DRILL_ENV` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// The API key from the environment wins over the file.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(env) = lookup(ENVIRONMENT_ENV) {
            self.environment = Environment::from_str_case_insensitive(&env).ok_or_else(|| {
                DrillError::config_validation(
                    format!("invalid {ENVIRONMENT_ENV} value '{env}'"),
                    format!("Set {ENVIRONMENT_ENV} to 'development' or 'production'"),
                )
            })?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<()> {
        self.llm.validate()?;
        self.retry.validate()?;
        self.database.validate()?;
        self.progression.validate()?;
        Ok(())
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    /// Internal error details are included in responses (default).
    #[default]
    Development,
    /// Internal error details are withheld.
    Production,
}

impl Environment {
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    /// Returns `true` if internal details may be shown to clients.
    #[must_use]
    pub const fn exposes_details(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid environment '{s}': expected one of 'development', 'production'"
            ))
        })
    }
}

impl Serialize for Environment {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

// ============================================================================
// Sections
// ============================================================================

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Provider API key. `ANTHROPIC_API_KEY` overrides it.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Provider origin.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Token limit for answer evaluation.
    #[serde(default = "default_evaluation_max_tokens")]
    pub evaluation_max_tokens: u32,

    /// Sampling temperature for answer evaluation.
    #[serde(default = "default_evaluation_temperature")]
    pub evaluation_temperature: f32,

    /// Default timeout for answer evaluation, in seconds.
    #[serde(default = "default_evaluation_timeout_secs")]
    pub evaluation_timeout_secs: u64,

    /// Token limit for hint generation.
    #[serde(default = "default_hint_max_tokens")]
    pub hint_max_tokens: u32,

    /// Sampling temperature for hint generation.
    #[serde(default = "default_hint_temperature")]
    pub hint_temperature: f32,

    /// Default timeout for hint generation, in seconds.
    #[serde(default = "default_hint_timeout_secs")]
    pub hint_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            evaluation_max_tokens: default_evaluation_max_tokens(),
            evaluation_temperature: default_evaluation_temperature(),
            evaluation_timeout_secs: default_evaluation_timeout_secs(),
            hint_max_tokens: default_hint_max_tokens(),
            hint_temperature: default_hint_temperature(),
            hint_timeout_secs: default_hint_timeout_secs(),
        }
    }
}

impl LlmConfig {
    fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(DrillError::config_validation(
                "llm.model must not be empty",
                "Set llm.model to a provider model identifier in your drill.json",
            ));
        }
        for (name, value) in [
            ("llm.evaluationTemperature", self.evaluation_temperature),
            ("llm.hintTemperature", self.hint_temperature),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DrillError::config_validation(
                    format!("{name} must be between 0.0 and 1.0, got {value}"),
                    format!("Set {name} to a value between 0.0 and 1.0 in your drill.json"),
                ));
            }
        }
        if self.evaluation_timeout_secs == 0 || self.hint_timeout_secs == 0 {
            return Err(DrillError::config_validation(
                "llm timeouts must be greater than 0",
                "Set llm.evaluationTimeoutSecs and llm.hintTimeoutSecs to at least 1 in your drill.json",
            ));
        }
        if self.evaluation_max_tokens == 0 || self.hint_max_tokens == 0 {
            return Err(DrillError::config_validation(
                "llm token limits must be greater than 0",
                "Set llm.evaluationMaxTokens and llm.hintMaxTokens to at least 1 in your drill.json",
            ));
        }
        Ok(())
    }

    /// Default evaluation timeout.
    #[must_use]
    pub const fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    /// Default hint-generation timeout.
    #[must_use]
    pub const fn hint_timeout(&self) -> Duration {
        Duration::from_secs(self.hint_timeout_secs)
    }
}

/// Retry policy for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Additional attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,

    /// Backoff cap, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,

    /// HTTP statuses treated as transient.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if !(self.base_delay_secs.is_finite() && self.base_delay_secs > 0.0) {
            return Err(DrillError::config_validation(
                "retry.baseDelaySecs must be greater than 0",
                "Set retry.baseDelaySecs to a positive number of seconds in your drill.json",
            ));
        }
        if !self.max_delay_secs.is_finite() || self.max_delay_secs < self.base_delay_secs {
            return Err(DrillError::config_validation(
                "retry.maxDelaySecs must be at least retry.baseDelaySecs",
                "Raise retry.maxDelaySecs or lower retry.baseDelaySecs in your drill.json",
            ));
        }
        // Bounds base too, since base <= max.
        if self.max_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(DrillError::config_validation(
                format!("retry.maxDelaySecs must be at most {MAX_RETRY_DELAY_SECS} seconds"),
                "Lower retry.maxDelaySecs (and retry.baseDelaySecs) in your drill.json",
            ));
        }
        Ok(())
    }

    /// Backoff base as a `Duration`.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay_secs)
    }

    /// Backoff cap as a `Duration`.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs)
    }
}

/// Database and connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Connections opened at startup.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Maximum simultaneous connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long a caller waits for a free connection, in seconds.
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,

    /// Connection lifetime before recycling, in seconds.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    /// Idle time before a connection is closed, in seconds.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Per-statement deadline, in milliseconds.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            max_idle_secs: default_max_idle_secs(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(DrillError::config_validation(
                "database.path must not be empty",
                "Provide a database file path in your drill.json",
            ));
        }
        if self.max_connections == 0 {
            return Err(DrillError::config_validation(
                "database.maxConnections must be greater than 0",
                "Set database.maxConnections to at least 1 in your drill.json",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DrillError::config_validation(
                format!(
                    "database.minConnections ({}) exceeds database.maxConnections ({})",
                    self.min_connections, self.max_connections
                ),
                "Lower database.minConnections or raise database.maxConnections in your drill.json",
            ));
        }
        if self.statement_timeout_ms == 0 || self.checkout_timeout_secs == 0 {
            return Err(DrillError::config_validation(
                "database timeouts must be greater than 0",
                "Set database.statementTimeoutMs and database.checkoutTimeoutSecs to positive values",
            ));
        }
        Ok(())
    }

    /// Pool settings for the store.
    #[must_use]
    pub const fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            checkout_timeout: Duration::from_secs(self.checkout_timeout_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
            max_idle: Duration::from_secs(self.max_idle_secs),
            busy_timeout: Duration::from_millis(self.statement_timeout_ms),
        }
    }

    /// Per-statement deadline.
    #[must_use]
    pub const fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

/// Session progression rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionConfig {
    /// Hint levels available per exercise.
    #[serde(default = "default_max_hints")]
    pub max_hints: u32,

    /// Attempt cap per exercise; `null` removes the cap.
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_exercise: Option<u32>,

    /// Whether results report `shouldAdvance` for strong answers.
    #[serde(default = "default_true")]
    pub report_should_advance: bool,

    /// Optimistic write retries before giving up on a contended session.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Minimum answer length, in characters.
    #[serde(default = "default_min_answer_length")]
    pub min_answer_length: usize,

    /// Maximum answer length, in characters.
    #[serde(default = "default_max_answer_length")]
    pub max_answer_length: usize,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            max_hints: default_max_hints(),
            max_attempts_per_exercise: default_max_attempts(),
            report_should_advance: default_true(),
            write_retries: default_write_retries(),
            min_answer_length: default_min_answer_length(),
            max_answer_length: default_max_answer_length(),
        }
    }
}

impl ProgressionConfig {
    fn validate(&self) -> Result<()> {
        if self.max_hints == 0 {
            return Err(DrillError::config_validation(
                "progression.maxHints must be greater than 0",
                "Set progression.maxHints to at least 1 in your drill.json",
            ));
        }
        if self.max_attempts_per_exercise == Some(0) {
            return Err(DrillError::config_validation(
                "progression.maxAttemptsPerExercise must be greater than 0",
                "Set progression.maxAttemptsPerExercise to at least 1, or null for no cap",
            ));
        }
        if self.min_answer_length > self.max_answer_length {
            return Err(DrillError::config_validation(
                "progression.minAnswerLength exceeds progression.maxAnswerLength",
                "Lower progression.minAnswerLength or raise progression.maxAnswerLength",
            ));
        }
        Ok(())
    }
}
