//! Periodic active probing of providers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::HealthMonitor;
use crate::provider::{ProviderError, ProviderHandle};

/// Probe every provider once, concurrently, and feed the outcomes to `monitor`.
///
/// Returns `(name, healthy_after_probe)` in the order of `providers`.
pub async fn probe_all(
    monitor: &HealthMonitor,
    providers: &[ProviderHandle],
    probe_timeout: Duration,
) -> Vec<(String, bool)> {
    let probes = providers.iter().map(|handle| async move {
        let outcome = tokio::time::timeout(
            probe_timeout,
            handle.client.probe(&handle.descriptor.model, probe_timeout),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout {
            after: probe_timeout,
        }));
        (handle.name(), outcome)
    });

    let mut results = Vec::with_capacity(providers.len());
    for (name, outcome) in join_all(probes).await {
        match outcome {
            Ok(()) => monitor.record_success(name),
            Err(err) => {
                tracing::debug!(provider = %name, error = %err, "health probe failed");
                monitor.record_failure(name, &err);
            }
        }
        results.push((name.to_string(), monitor.is_healthy(name)));
    }
    results
}

/// Spawn the background probe loop.
///
/// The first round runs one `interval` after spawning. The task exits when
/// `shutdown` is cancelled.
pub fn spawn_probe_task(
    monitor: Arc<HealthMonitor>,
    providers: Vec<ProviderHandle>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            providers = providers.len(),
            interval_secs = interval.as_secs(),
            "health probe task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let results = probe_all(&monitor, &providers, probe_timeout).await;
                    let unhealthy = results.iter().filter(|(_, healthy)| !healthy).count();
                    tracing::debug!(checked = results.len(), unhealthy, "health probe round complete");
                }
            }
        }

        tracing::info!("health probe task stopped");
    })
}
