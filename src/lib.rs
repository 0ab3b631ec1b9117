//! relaygate - LLM gateway core
//!
//! Routes generation requests across a prioritized set of LLM providers with
//! response caching, per-caller rate limiting, cost tracking against a
//! budget, and health-aware failover.

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod pricing;
pub mod provider;
pub mod ratelimit;
pub mod router;
pub mod storage;
pub mod tracker;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use router::{Gateway, GatewayContext, GatewaySettings};
pub use types::{GenerateRequest, GenerateResponse, GenerationParams};
