//! Error types for relaygate.

use crate::pricing::PricingNotFound;
use crate::ratelimit::RateLimitDenied;
use crate::router::retry::{format_attempts, AttemptFailure};
use crate::tracker::BudgetDenied;

/// Result type alias for relaygate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for relaygate.
///
/// Every variant is terminal for the request that produced it. Provider-level
/// failures never surface directly; they are collected into
/// [`Error::AllProvidersFailed`] once every candidate has been tried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No providers available for model '{model}'")]
    NoProviders { model: String },

    #[error("{0}")]
    RateLimited(#[from] RateLimitDenied),

    #[error("{0}")]
    BudgetExceeded(#[from] BudgetDenied),

    #[error("All providers failed: {}", format_attempts(.attempts))]
    AllProvidersFailed { attempts: Vec<AttemptFailure> },

    #[error("Pricing error: {0}")]
    PricingNotFound(#[from] PricingNotFound),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl Error {
    /// HTTP-style status code for front-ends that expose the gateway.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::NoProviders { .. } => 400,
            Error::RateLimited(_) => 429,
            Error::BudgetExceeded(_) => 402,
            Error::AllProvidersFailed { .. } => 502,
            Error::PricingNotFound(_) => 500,
            // Client closed request
            Error::Cancelled => 499,
            Error::Database(_) | Error::HttpClient(_) => 500,
        }
    }
}
