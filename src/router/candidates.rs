//! Candidate selection and ordering.

use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::pricing::PricingNotFound;
use crate::provider::ProviderHandle;

/// Providers that serve `model`, in the order they should be tried.
///
/// Ordering: healthy before unhealthy, then descending priority, then
/// configuration order. Unhealthy providers are kept so that a request can
/// still succeed when every provider is marked down.
pub fn order_candidates<'a>(
    providers: &'a [ProviderHandle],
    model: &str,
    health: &HealthMonitor,
) -> Result<Vec<&'a ProviderHandle>> {
    let candidates = order_by(providers, model, |name| health.is_healthy(name));

    if candidates.is_empty() {
        return Err(Error::NoProviders {
            model: model.to_string(),
        });
    }
    Ok(candidates)
}

fn order_by<'a>(
    providers: &'a [ProviderHandle],
    model: &str,
    is_healthy: impl Fn(&str) -> bool,
) -> Vec<&'a ProviderHandle> {
    let mut candidates: Vec<(bool, &ProviderHandle)> = providers
        .iter()
        .filter(|p| p.descriptor.serves(model))
        .map(|p| (is_healthy(p.name()), p))
        .collect();

    // Stable sort keeps configuration order for equal keys
    candidates.sort_by(|(a_healthy, a), (b_healthy, b)| {
        b_healthy
            .cmp(a_healthy)
            .then_with(|| b.descriptor.priority.cmp(&a.descriptor.priority))
    });

    candidates.into_iter().map(|(_, p)| p).collect()
}

/// The most expensive serving provider's price for the given token counts.
///
/// Used to project the cost of a request before it is known which
/// candidate will answer it.
pub fn max_projected_cost(
    candidates: &[&ProviderHandle],
    price: impl Fn(&ProviderHandle) -> std::result::Result<f64, PricingNotFound>,
) -> std::result::Result<f64, PricingNotFound> {
    let mut max = 0.0_f64;
    for candidate in candidates {
        max = max.max(price(*candidate)?);
    }
    Ok(max)
}
