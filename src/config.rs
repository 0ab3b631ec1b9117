//! Configuration parsing and validation for relaygate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;

use crate::pricing::{PricingNotFound, PricingTable, TokenPrice};
use crate::tracker::{BudgetPeriod, UnpricedPolicy};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub pricing: Vec<PricingConfig>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Request handling defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Input tokens assumed when projecting the cost of a request
    #[serde(default = "default_estimate_tokens")]
    pub default_input_tokens: u32,
    /// Output tokens assumed when a request does not set `max_tokens`
    #[serde(default = "default_estimate_tokens")]
    pub default_output_tokens: u32,
    /// What to do with calls that have no pricing entry
    #[serde(default)]
    pub unpriced: UnpricedPolicy,
    /// Start from the built-in pricing table before applying `[[pricing]]`
    #[serde(default = "default_true")]
    pub builtin_pricing: bool,
}

fn default_estimate_tokens() -> u32 {
    1000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_input_tokens: default_estimate_tokens(),
            default_output_tokens: default_estimate_tokens(),
            unpriced: UnpricedPolicy::default(),
            builtin_pricing: true,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Capacity of the usage persistence queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_db_path() -> String {
    "./relaygate.db".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The inner `SecretString` ensures the key value is:
/// - Zeroized in memory when dropped
/// - Never exposed via Debug or Display
/// - Only accessible via `.expose_secret()` (grep-auditable)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions`
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
}

/// Provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL for the provider's API (e.g., "https://api.openai.com/v1")
    pub url: String,
    /// Optional API key
    pub api_key: Option<ApiKey>,
    /// Upstream model id sent to this provider
    pub model: String,
    /// Logical models this provider serves (empty = all)
    #[serde(default, alias = "models")]
    pub logical_models: Vec<String>,
    /// Higher priority providers are tried first
    #[serde(default)]
    pub priority: i32,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts on 5xx/transport errors before failing over
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

/// A pricing override, in USD per million tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    pub provider: String,
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Spend ceiling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetConfig {
    /// Maximum spend per period in USD (unset = unlimited)
    pub ceiling: Option<f64>,
    #[serde(default)]
    pub period: BudgetPeriod,
}

/// Sliding-window rate limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests per caller per window
    #[serde(default = "default_per_caller")]
    pub per_caller: u32,
    /// Requests across all callers per window
    #[serde(default = "default_global")]
    pub global: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_per_caller() -> u32 {
    100
}

fn default_global() -> u32 {
    1000
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_caller: default_per_caller(),
            global: default_global(),
            window_secs: default_window_secs(),
        }
    }
}

/// Which store backs the shared cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Local,
    Redis,
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CacheBackendKind,
    /// e.g. "redis://127.0.0.1:6379"
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Per-operation timeout against the shared store
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// How long to serve from the local store after the shared store fails
    #[serde(default = "default_degraded_cooldown_ms")]
    pub degraded_cooldown_ms: u64,
    #[serde(default = "default_max_local_entries")]
    pub max_local_entries: usize,
}

fn default_key_prefix() -> String {
    "relaygate".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_op_timeout_ms() -> u64 {
    250
}

fn default_degraded_cooldown_ms() -> u64 {
    5000
}

fn default_max_local_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            op_timeout_ms: default_op_timeout_ms(),
            degraded_cooldown_ms: default_degraded_cooldown_ms(),
            max_local_entries: default_max_local_entries(),
        }
    }
}

/// Provider health tracking.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a provider is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Run the periodic probe task
    #[serde(default = "default_true")]
    pub probe_enabled: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    crate::health::DEFAULT_FAILURE_THRESHOLD
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            probe_enabled: true,
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, taking API keys literally.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, including pricing coverage.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.iter().all(|p| !p.enabled) {
            tracing::warn!("No enabled providers configured - gateway will reject all requests");
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Provider with empty name".to_string(),
                ));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if provider.model.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty model",
                    provider.name
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has zero timeout",
                    provider.name
                )));
            }
        }

        for entry in &self.pricing {
            if entry.input_per_million < 0.0 || entry.output_per_million < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Negative pricing for provider '{}' model '{}'",
                    entry.provider, entry.model
                )));
            }
        }

        if let Some(ceiling) = self.budget.ceiling {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Budget ceiling must be a non-negative number, got {}",
                    ceiling
                )));
            }
        }

        if self.rate_limit.enabled
            && (self.rate_limit.per_caller == 0
                || self.rate_limit.global == 0
                || self.rate_limit.window_secs == 0)
        {
            return Err(ConfigError::Validation(
                "Rate limits and window must be greater than zero".to_string(),
            ));
        }

        if self.cache.backend == CacheBackendKind::Redis && self.cache.redis_url.is_none() {
            return Err(ConfigError::Validation(
                "Cache backend 'redis' requires redis_url".to_string(),
            ));
        }

        if self.health.failure_threshold == 0 || self.health.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "Health failure_threshold and check_interval_secs must be greater than zero"
                    .to_string(),
            ));
        }

        self.check_pricing_coverage(&self.pricing_table())
    }

    fn check_pricing_coverage(&self, table: &PricingTable) -> Result<(), ConfigError> {
        if self.gateway.unpriced == UnpricedPolicy::ZeroCost {
            return Ok(());
        }
        for provider in self.active_providers() {
            table.get(&provider.name, &provider.model)?;
        }
        Ok(())
    }

    /// Built-in pricing (when enabled) overlaid with `[[pricing]]` entries.
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = if self.gateway.builtin_pricing {
            PricingTable::with_defaults()
        } else {
            PricingTable::new()
        };
        for entry in &self.pricing {
            table.insert(
                &entry.provider,
                &entry.model,
                TokenPrice::per_million(entry.input_per_million, entry.output_per_million),
            );
        }
        table
    }

    /// Enabled providers in configuration order.
    pub fn active_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("api_key for provider '{provider}' references '{var}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },

    #[error("{0}")]
    Pricing(#[from] PricingNotFound),
}

/// A `[[providers]]` entry as written, before its `api_key` is resolved.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    #[serde(default)]
    kind: ProviderKind,
    url: String,
    api_key: Option<String>,
    model: String,
    #[serde(default, alias = "models")]
    logical_models: Vec<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    max_retries: u32,
    #[serde(default = "default_true")]
    enabled: bool,
}

/// The config file as written. See [`Config::from_raw_with`].
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    gateway: GatewayConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    pricing: Vec<PricingConfig>,
    #[serde(default)]
    budget: BudgetConfig,
    #[serde(default)]
    rate_limit: RateLimitConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Derive the convention-based env var name for a provider:
/// `"azure-east"` becomes `RELAYGATE_AZURE_EAST_API_KEY`.
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' '], "_");
    format!("RELAYGATE_{}_API_KEY", upper_snake)
}

/// Turns each provider's raw `api_key` into a secret plus where it came from.
///
/// `lookup` stands in for the process environment so resolution can be
/// exercised against a fixed map.
struct KeyResolver<F> {
    lookup: F,
}

impl<F> KeyResolver<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(
        &self,
        provider: &str,
        raw_key: Option<&str>,
    ) -> Result<(Option<ApiKey>, KeySource), ConfigError> {
        match raw_key {
            Some(template) if template.contains("${") => {
                let key = self.expand(provider, template)?;
                Ok((Some(ApiKey::from(key)), KeySource::EnvExpanded))
            }
            Some(literal) => Ok((Some(ApiKey::from(literal)), KeySource::Literal)),
            None => {
                let var = convention_env_var_name(provider);
                Ok(match (self.lookup)(&var) {
                    Some(value) => (Some(ApiKey::from(value)), KeySource::Convention(var)),
                    None => (None, KeySource::None),
                })
            }
        }
    }

    /// Substitute every `${VAR}` in `template`. A lone `$` is kept as is.
    fn expand(&self, provider: &str, template: &str) -> Result<String, ConfigError> {
        let env_error = |var: &str, message: &str| ConfigError::EnvVar {
            var: var.to_string(),
            provider: provider.to_string(),
            message: message.to_string(),
        };

        let mut expanded = String::with_capacity(template.len());
        let mut rest = template;
        while let Some((literal, tail)) = rest.split_once("${") {
            expanded.push_str(literal);
            let (var, after) = tail
                .split_once('}')
                .ok_or_else(|| env_error("${", "reference is never closed with '}'"))?;
            if var.is_empty() {
                return Err(env_error("${}", "reference has an empty variable name"));
            }
            let value = (self.lookup)(var)
                .ok_or_else(|| env_error(var, "environment variable is not set"))?;
            expanded.push_str(&value);
            rest = after;
        }
        expanded.push_str(rest);
        Ok(expanded)
    }
}

impl Config {
    /// Resolve API keys from the process environment. See
    /// [`Config::from_raw_with`].
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Build the final config, resolving each provider's `api_key` through
    /// `lookup`: a `${VAR}` template is expanded, any other value is taken
    /// literally, and a missing key falls back to `RELAYGATE_<NAME>_API_KEY`.
    ///
    /// Returns the key source per provider, in configuration order.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolver = KeyResolver { lookup };
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        let providers = raw
            .providers
            .into_iter()
            .map(|rp| {
                let (api_key, source) = resolver.resolve(&rp.name, rp.api_key.as_deref())?;
                key_sources.push((rp.name.clone(), source));
                Ok(ProviderConfig {
                    name: rp.name,
                    kind: rp.kind,
                    url: rp.url,
                    api_key,
                    model: rp.model,
                    logical_models: rp.logical_models,
                    priority: rp.priority,
                    timeout_secs: rp.timeout_secs,
                    max_retries: rp.max_retries,
                    enabled: rp.enabled,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let config = Config {
            gateway: raw.gateway,
            database: raw.database,
            providers,
            pricing: raw.pricing,
            budget: raw.budget,
            rate_limit: raw.rate_limit,
            cache: raw.cache,
            health: raw.health,
            logging: raw.logging,
        };
        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file, resolve API keys from the
    /// environment, then validate.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;
        Ok((config, key_sources))
    }
}
