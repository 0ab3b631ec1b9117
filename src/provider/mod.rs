//! Upstream provider abstraction.
//!
//! The gateway treats every upstream as an opaque request/response service
//! behind [`LlmProvider`]. A [`ProviderHandle`] pairs that client with the
//! immutable [`ProviderDescriptor`] loaded from configuration.

mod openai;

pub use openai::OpenAiCompatible;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ProviderConfig, ProviderKind};
use crate::router::retry::is_retryable;
use crate::types::GenerationParams;

/// Text and token counts returned by a successful upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Failure of a single upstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("rate limited by upstream: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Upstream returned an error status, or the transport failed before
    /// any status was received (`status: None`).
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
}

impl ProviderError {
    /// Short category used in logs and health state.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Upstream { status: None, .. } => "transport",
            ProviderError::Upstream { .. } => "upstream",
        }
    }

    /// Whether another attempt against the same provider may succeed.
    ///
    /// Timeouts and upstream rate limits fail over immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Upstream { status: None, .. } => true,
            ProviderError::Upstream {
                status: Some(code), ..
            } => is_retryable(*code),
            ProviderError::Timeout { .. } | ProviderError::RateLimited { .. } => false,
        }
    }
}

/// A network-reachable model provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one completion. Implementations must give up after `timeout`.
    async fn call(
        &self,
        prompt: &str,
        params: &GenerationParams,
        model: &str,
        timeout: Duration,
    ) -> Result<Completion, ProviderError>;

    /// Cheap liveness check used by the health probe.
    async fn probe(&self, model: &str, timeout: Duration) -> Result<(), ProviderError> {
        let params = GenerationParams::new().with("max_tokens", 1);
        self.call("ping", &params, model, timeout).await.map(|_| ())
    }
}

/// Static routing attributes of a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Higher is tried first.
    pub priority: i32,
    /// Upstream model id sent to the provider and used for pricing.
    pub model: String,
    /// Logical models this provider serves. Empty serves every model.
    pub logical_models: Vec<String>,
    pub timeout: Duration,
    /// Extra attempts on retryable errors before failing over.
    pub max_retries: u32,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, priority: i32, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority,
            model: model.into(),
            logical_models: Vec::new(),
            timeout: Duration::from_secs(30),
            max_retries: 0,
        }
    }

    pub fn serves(&self, logical_model: &str) -> bool {
        self.logical_models.is_empty() || self.logical_models.iter().any(|m| m == logical_model)
    }
}

impl From<&ProviderConfig> for ProviderDescriptor {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            priority: config.priority,
            model: config.model.clone(),
            logical_models: config.logical_models.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        }
    }
}

/// Descriptor plus the client that talks to it.
#[derive(Clone)]
pub struct ProviderHandle {
    pub descriptor: ProviderDescriptor,
    pub client: Arc<dyn LlmProvider>,
}

impl ProviderHandle {
    pub fn new(descriptor: ProviderDescriptor, client: Arc<dyn LlmProvider>) -> Self {
        Self { descriptor, client }
    }

    /// Build the adapter named by `config.kind`.
    pub fn from_config(config: &ProviderConfig, http: reqwest::Client) -> Self {
        let client: Arc<dyn LlmProvider> = match config.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiCompatible::new(
                &config.name,
                &config.url,
                config.api_key.clone(),
                http,
            )),
        };
        Self::new(ProviderDescriptor::from(config), client)
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
