//! Request routing across providers.
//!
//! Candidates are the providers serving the requested logical model, tried
//! in priority order with unhealthy providers moved to the back. Each
//! candidate gets its own timeout and retry budget before the next one is
//! tried.

pub mod candidates;
mod gateway;
pub mod retry;

pub use candidates::order_candidates;
pub use gateway::{Gateway, GatewayContext, GatewaySettings, GatewayTasks};
pub use retry::{is_retryable, AttemptFailure};
