//! Request orchestration: cache, admission, failover, accounting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::candidates::{max_projected_cost, order_candidates};
use super::retry::{call_with_retries, AttemptFailure};
use crate::cache::{fingerprint, CachedResponse, ResponseCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{spawn_probe_task, HealthMonitor};
use crate::provider::{Completion, ProviderError, ProviderHandle};
use crate::ratelimit::RateLimiter;
use crate::storage::{self, spawn_usage_worker, SqliteUsageSink};
use crate::tracker::{TokenTracker, UsageRecord};
use crate::types::{GenerateRequest, GenerateResponse};

/// Shared components consulted on every request.
#[derive(Clone)]
pub struct GatewayContext {
    pub health: Arc<HealthMonitor>,
    pub tracker: Arc<TokenTracker>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
}

/// Estimation defaults used before a provider has answered.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub default_input_tokens: u32,
    /// Used when the request does not set `max_tokens`.
    pub default_output_tokens: u32,
    /// TTL for new cache entries. `None` uses the cache's default.
    pub cache_ttl: Option<Duration>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_input_tokens: 1000,
            default_output_tokens: 1000,
            cache_ttl: None,
        }
    }
}

/// Background tasks started by [`Gateway::from_config`].
pub struct GatewayTasks {
    shutdown: CancellationToken,
    probe: Option<JoinHandle<()>>,
    usage_worker: Option<JoinHandle<()>>,
}

impl GatewayTasks {
    /// Token that stops the probe task when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the probe task, drop `gateway`, then wait for the usage worker
    /// to flush whatever is still queued.
    pub async fn shutdown(self, gateway: Gateway) {
        self.shutdown.cancel();
        if let Some(probe) = self.probe {
            if let Err(e) = probe.await {
                tracing::warn!(error = %e, "health probe task ended abnormally");
            }
        }

        drop(gateway);
        if let Some(worker) = self.usage_worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "usage worker ended abnormally");
            }
        }
    }
}

/// Routes generation requests across providers.
pub struct Gateway {
    providers: Vec<ProviderHandle>,
    ctx: GatewayContext,
    settings: GatewaySettings,
}

impl Gateway {
    /// Assemble a gateway from already-built components.
    ///
    /// Fails if any provider's `(name, model)` cannot be priced under the
    /// tracker's unpriced policy.
    pub fn new(
        providers: Vec<ProviderHandle>,
        ctx: GatewayContext,
        settings: GatewaySettings,
    ) -> Result<Self> {
        ctx.tracker.validate_pricing(
            providers
                .iter()
                .map(|p| (p.name(), p.descriptor.model.as_str())),
        )?;

        if providers.is_empty() {
            tracing::warn!("gateway started without providers");
        }

        Ok(Self {
            providers,
            ctx,
            settings,
        })
    }

    /// Build every component from configuration and start background tasks.
    ///
    /// Historical usage for the current budget period is loaded from the
    /// database so that restarts do not reset spend.
    pub async fn from_config(config: &Config) -> Result<(Self, GatewayTasks)> {
        let shutdown = CancellationToken::new();

        let mut tracker = TokenTracker::new(
            config.pricing_table(),
            config.budget.clone(),
            config.gateway.unpriced,
        );

        let mut usage_worker = None;
        if let Some(db) = &config.database {
            let pool = storage::init_pool(&db.path).await?;
            tracing::info!(path = %db.path, "Database initialized");

            let since = config.budget.period.spend_period().since(Utc::now());
            let history = storage::usage::load_since(&pool, since).await?;
            let restored = tracker.restore(history);
            tracing::info!(records = restored, period = %config.budget.period, "usage restored");

            let (queue, handle) =
                spawn_usage_worker(Arc::new(SqliteUsageSink::new(pool)), db.queue_capacity);
            tracker = tracker.with_sink(queue);
            usage_worker = Some(handle);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let providers: Vec<ProviderHandle> = config
            .active_providers()
            .map(|p| ProviderHandle::from_config(p, http.clone()))
            .collect();
        let names: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();

        let limiter = if config.rate_limit.enabled {
            RateLimiter::new(
                config.rate_limit.per_caller,
                config.rate_limit.global,
                Duration::from_secs(config.rate_limit.window_secs),
            )
        } else {
            RateLimiter::disabled()
        };

        let ctx = GatewayContext {
            health: Arc::new(HealthMonitor::new(&names, config.health.failure_threshold)),
            tracker: Arc::new(tracker),
            cache: Arc::new(ResponseCache::from_config(&config.cache)),
            limiter: Arc::new(limiter),
        };

        let probe = (config.health.probe_enabled && !providers.is_empty()).then(|| {
            spawn_probe_task(
                ctx.health.clone(),
                providers.clone(),
                Duration::from_secs(config.health.check_interval_secs),
                Duration::from_secs(config.health.probe_timeout_secs),
                shutdown.clone(),
            )
        });

        let settings = GatewaySettings {
            default_input_tokens: config.gateway.default_input_tokens,
            default_output_tokens: config.gateway.default_output_tokens,
            cache_ttl: None,
        };

        let gateway = Self::new(providers, ctx, settings)?;
        tracing::info!(providers = gateway.providers.len(), "gateway ready");

        Ok((
            gateway,
            GatewayTasks {
                shutdown,
                probe,
                usage_worker,
            },
        ))
    }

    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    pub fn providers(&self) -> &[ProviderHandle] {
        &self.providers
    }

    /// Serve a request from cache or from the first candidate that answers.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.generate_inner(request, None).await
    }

    /// Like [`generate`](Self::generate), but gives up as soon as `cancel`
    /// fires. A call cancelled before its upstream answered records nothing.
    pub async fn generate_with_cancel(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse> {
        self.generate_inner(request, Some(cancel)).await
    }

    async fn generate_inner(
        &self,
        request: &GenerateRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<GenerateResponse> {
        let key = fingerprint(&request.model, &request.prompt, &request.params);

        if let Some(hit) = self.ctx.cache.get(&key).await {
            tracing::debug!(model = %request.model, caller = %request.caller, "served from cache");
            return Ok(GenerateResponse {
                text: hit.text,
                provider_used: hit.provider,
                input_tokens: hit.input_tokens,
                output_tokens: hit.output_tokens,
                cost: 0.0,
                cache_hit: true,
            });
        }

        self.ctx.limiter.try_acquire(&request.caller)?;

        let candidates = order_candidates(&self.providers, &request.model, &self.ctx.health)?;

        let input_estimate = self.settings.default_input_tokens;
        let output_estimate = request
            .params
            .max_tokens()
            .unwrap_or(self.settings.default_output_tokens);
        let projected = max_projected_cost(&candidates, |p| {
            self.ctx
                .tracker
                .cost_for(p.name(), &p.descriptor.model, input_estimate, output_estimate)
        })?;
        let reservation = self.ctx.tracker.reserve(projected)?;

        tracing::info!(
            model = %request.model,
            caller = %request.caller,
            candidates = candidates.len(),
            projected_cost = projected,
            "routing request"
        );

        let mut failures = Vec::new();
        for handle in candidates {
            let (outcome, attempts) = match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            tracing::info!(
                                provider = %handle.name(),
                                caller = %request.caller,
                                "request cancelled before provider answered"
                            );
                            return Err(Error::Cancelled);
                        }
                        result = self.call_candidate(handle, request) => result,
                    }
                }
                None => self.call_candidate(handle, request).await,
            };

            match outcome {
                Ok(completion) => {
                    self.ctx.health.record_success(handle.name());

                    let model = handle.descriptor.model.as_str();
                    let cost = match self.ctx.tracker.cost_for(
                        handle.name(),
                        model,
                        completion.input_tokens,
                        completion.output_tokens,
                    ) {
                        Ok(cost) => cost,
                        Err(e) => {
                            tracing::error!(error = %e, "pricing lookup failed after a successful call");
                            0.0
                        }
                    };
                    let record = UsageRecord::new(
                        handle.name(),
                        model,
                        &request.caller,
                        completion.input_tokens,
                        completion.output_tokens,
                        cost,
                    );

                    if cancel.is_some_and(|t| t.is_cancelled()) {
                        reservation.commit(record.mark_cancelled());
                        return Err(Error::Cancelled);
                    }
                    reservation.commit(record);

                    self.ctx
                        .cache
                        .set(
                            &key,
                            &CachedResponse {
                                text: completion.text.clone(),
                                provider: handle.name().to_string(),
                                input_tokens: completion.input_tokens,
                                output_tokens: completion.output_tokens,
                                cost,
                                created_at: Utc::now(),
                            },
                            self.settings.cache_ttl,
                        )
                        .await;

                    return Ok(GenerateResponse {
                        text: completion.text,
                        provider_used: handle.name().to_string(),
                        input_tokens: completion.input_tokens,
                        output_tokens: completion.output_tokens,
                        cost,
                        cache_hit: false,
                    });
                }
                Err(error) => {
                    self.ctx.health.record_failure(handle.name(), &error);
                    tracing::warn!(
                        provider = %handle.name(),
                        attempts,
                        error = %error,
                        "provider failed, trying next candidate"
                    );
                    failures.push(AttemptFailure {
                        provider: handle.name().to_string(),
                        attempts,
                        error,
                    });
                }
            }
        }

        Err(Error::AllProvidersFailed { attempts: failures })
    }

    /// One candidate's attempts, each bounded by the candidate's timeout.
    async fn call_candidate(
        &self,
        handle: &ProviderHandle,
        request: &GenerateRequest,
    ) -> (std::result::Result<Completion, ProviderError>, u32) {
        let timeout = handle.descriptor.timeout;
        let model = handle.descriptor.model.as_str();

        call_with_retries(handle.name(), handle.descriptor.max_retries, move || async move {
            tokio::time::timeout(
                timeout,
                handle
                    .client
                    .call(&request.prompt, &request.params, model, timeout),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout { after: timeout }))
        })
        .await
    }
}
