//! Per-provider health tracking.
//!
//! Implements the Healthy -> Unhealthy -> Healthy lifecycle:
//! - **Healthy**: consecutive failures are counted
//! - **Unhealthy**: entered after `failure_threshold` consecutive failures
//! - one successful live call or probe returns the provider to Healthy
//!
//! Health is advisory. The router uses it only to push unhealthy providers
//! to the back of the candidate list; nothing is ever rejected because of it.

mod probe;

pub use probe::{probe_all, spawn_probe_task};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::provider::ProviderError;

/// Default number of consecutive failures that marks a provider unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Information about the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Category of the error (e.g., "timeout", "upstream").
    pub error_type: String,
    pub message: String,
}

impl From<&ProviderError> for LastError {
    fn from(err: &ProviderError) -> Self {
        Self {
            error_type: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Point-in-time view of one provider's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Times the provider went from healthy to unhealthy.
    pub trip_count: u32,
    pub success_rate: f64,
}

/// Health state machine for a single provider (not thread-safe on its own).
#[derive(Debug, Clone)]
pub(crate) struct ProviderHealth {
    pub(crate) healthy: bool,
    pub(crate) consecutive_failures: u32,
    pub(crate) last_check_time: Option<DateTime<Utc>>,
    pub(crate) last_success: Option<DateTime<Utc>>,
    pub(crate) last_failure: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<LastError>,
    pub(crate) total_requests: u64,
    pub(crate) successful_requests: u64,
    pub(crate) trip_count: u32,
}

impl ProviderHealth {
    pub(crate) fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_check_time: None,
            last_success: None,
            last_failure: None,
            last_error: None,
            total_requests: 0,
            successful_requests: 0,
            trip_count: 0,
        }
    }

    /// Fraction of successful outcomes; 1.0 before any outcome is recorded.
    pub(crate) fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub(crate) fn record_success(&mut self, provider_name: &str) {
        let now = Utc::now();
        let was_unhealthy = !self.healthy;

        self.healthy = true;
        self.consecutive_failures = 0;
        self.total_requests += 1;
        self.successful_requests += 1;
        self.last_success = Some(now);
        self.last_check_time = Some(now);

        if was_unhealthy {
            tracing::info!(
                provider = %provider_name,
                trip_count = self.trip_count,
                "provider RECOVERED: marked healthy",
            );
        }
    }

    pub(crate) fn record_failure(&mut self, provider_name: &str, error: LastError, threshold: u32) {
        let now = Utc::now();

        self.consecutive_failures += 1;
        self.total_requests += 1;
        self.last_failure = Some(now);
        self.last_check_time = Some(now);
        self.last_error = Some(error);

        if self.healthy && self.consecutive_failures >= threshold {
            self.healthy = false;
            self.trip_count += 1;

            tracing::warn!(
                provider = %provider_name,
                consecutive_failures = self.consecutive_failures,
                last_error = ?self.last_error,
                trip_count = self.trip_count,
                "provider UNHEALTHY: {} consecutive failures",
                self.consecutive_failures,
            );
        }
    }

    fn snapshot(&self, name: &str) -> HealthSnapshot {
        HealthSnapshot {
            name: name.to_string(),
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            last_check_time: self.last_check_time,
            last_success: self.last_success,
            last_failure: self.last_failure,
            last_error: self.last_error.clone(),
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            trip_count: self.trip_count,
            success_rate: self.success_rate(),
        }
    }
}

/// Concurrent health registry with one entry per configured provider.
///
/// Backed by [`DashMap`] so updates for one provider never contend with
/// reads of another.
pub struct HealthMonitor {
    providers: DashMap<String, ProviderHealth>,
    /// Configuration order, for stable snapshots.
    order: Vec<String>,
    failure_threshold: u32,
}

impl HealthMonitor {
    /// Create a monitor with every provider starting healthy.
    pub fn new(provider_names: &[String], failure_threshold: u32) -> Self {
        let providers = DashMap::with_capacity(provider_names.len());
        for name in provider_names {
            providers.insert(name.clone(), ProviderHealth::new());
        }
        Self {
            providers,
            order: provider_names.to_vec(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Unknown providers are reported healthy.
    pub fn is_healthy(&self, provider_name: &str) -> bool {
        self.providers
            .get(provider_name)
            .map(|entry| entry.healthy)
            .unwrap_or(true)
    }

    pub fn record_success(&self, provider_name: &str) {
        if let Some(mut entry) = self.providers.get_mut(provider_name) {
            entry.record_success(provider_name);
        }
    }

    pub fn record_failure(&self, provider_name: &str, error: &ProviderError) {
        if let Some(mut entry) = self.providers.get_mut(provider_name) {
            entry.record_failure(provider_name, LastError::from(error), self.failure_threshold);
        }
    }

    pub fn snapshot_of(&self, provider_name: &str) -> Option<HealthSnapshot> {
        self.providers
            .get(provider_name)
            .map(|entry| entry.snapshot(provider_name))
    }

    /// All providers in configuration order.
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        self.order
            .iter()
            .filter_map(|name| self.snapshot_of(name))
            .collect()
    }
}
