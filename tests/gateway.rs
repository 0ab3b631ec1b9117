//! Integration tests for request routing through the gateway.
//!
//! Verifies that:
//! - Timeouts fail over to the next priority and count against health
//! - Cache hits skip rate limiting, budget and providers entirely
//! - Rate limit and budget denials happen before any provider call
//! - Costs above their projection overshoot the ceiling by a bounded amount
//! - Unhealthy providers are tried last until they succeed again
//! - Cancelled requests leave no usage behind
//!
//! Providers are scripted in-process mocks behind the `LlmProvider` trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use relaygate::cache::ResponseCache;
use relaygate::config::BudgetConfig;
use relaygate::health::HealthMonitor;
use relaygate::pricing::{PricingTable, TokenPrice};
use relaygate::provider::{Completion, LlmProvider, ProviderDescriptor, ProviderError, ProviderHandle};
use relaygate::ratelimit::{LimitScope, RateLimiter};
use relaygate::storage::{spawn_usage_worker, SinkError, UsageSink};
use relaygate::tracker::{BudgetPeriod, TokenTracker, UnpricedPolicy, UsageRecord};
use relaygate::{Error, Gateway, GatewayContext, GatewaySettings, GenerateRequest, GenerationParams};

const MODEL: &str = "mock-model";

#[derive(Clone)]
enum Behavior {
    Reply,
    Fail(ProviderError),
    /// Fail this many calls, then reply.
    FailTimes(u32, ProviderError),
    Hang,
    /// Reply after `delay`, reporting `output_tokens` regardless of `max_tokens`.
    Slow { delay: Duration, output_tokens: u32 },
    /// Cancel the token, then reply as if the upstream had already billed.
    CancelThenReply(CancellationToken),
}

struct MockProvider {
    name: String,
    calls: AtomicU32,
    behavior: Mutex<Behavior>,
}

impl MockProvider {
    fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            behavior: Mutex::new(behavior),
        })
    }

    fn set(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply(&self, prompt: &str) -> Completion {
        Completion {
            text: format!("{}: {}", self.name, prompt),
            input_tokens: 10,
            output_tokens: 5,
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn call(
        &self,
        prompt: &str,
        _params: &GenerationParams,
        _model: &str,
        _timeout: Duration,
    ) -> Result<Completion, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Reply => Ok(self.reply(prompt)),
            Behavior::Fail(err) => Err(err),
            Behavior::FailTimes(times, err) if n < times => Err(err),
            Behavior::FailTimes(..) => Ok(self.reply(prompt)),
            Behavior::Hang => std::future::pending().await,
            Behavior::Slow {
                delay,
                output_tokens,
            } => {
                tokio::time::sleep(delay).await;
                Ok(Completion {
                    output_tokens,
                    ..self.reply(prompt)
                })
            }
            Behavior::CancelThenReply(token) => {
                token.cancel();
                Ok(self.reply(prompt))
            }
        }
    }
}

fn handle(mock: &Arc<MockProvider>, priority: i32) -> ProviderHandle {
    let mut descriptor = ProviderDescriptor::new(mock.name.clone(), priority, MODEL);
    descriptor.timeout = Duration::from_secs(1);
    ProviderHandle::new(descriptor, mock.clone())
}

/// 0.001 per output token, input tokens free.
fn pricing(mocks: &[&Arc<MockProvider>]) -> PricingTable {
    let mut table = PricingTable::new();
    for mock in mocks {
        table.insert(&mock.name, MODEL, TokenPrice::per_token(0.0, 0.001));
    }
    table
}

struct Setup {
    handles: Vec<ProviderHandle>,
    tracker: TokenTracker,
    limiter: RateLimiter,
    settings: GatewaySettings,
}

impl Setup {
    fn new(providers: &[(&Arc<MockProvider>, i32)]) -> Self {
        let mocks: Vec<&Arc<MockProvider>> = providers.iter().map(|(m, _)| *m).collect();
        Self {
            handles: providers.iter().map(|(m, p)| handle(m, *p)).collect(),
            tracker: TokenTracker::new(
                pricing(&mocks),
                BudgetConfig::default(),
                UnpricedPolicy::Refuse,
            ),
            limiter: RateLimiter::new(1000, 1000, Duration::from_secs(60)),
            settings: GatewaySettings {
                default_input_tokens: 0,
                default_output_tokens: 1000,
                cache_ttl: None,
            },
        }
    }

    fn build(self) -> Gateway {
        let names: Vec<String> = self.handles.iter().map(|h| h.name().to_string()).collect();
        let ctx = GatewayContext {
            health: Arc::new(HealthMonitor::new(&names, 3)),
            tracker: Arc::new(self.tracker),
            cache: Arc::new(ResponseCache::local(Duration::from_secs(60), 100)),
            limiter: Arc::new(self.limiter),
        };
        Gateway::new(self.handles, ctx, self.settings).unwrap()
    }
}

fn request(prompt: &str) -> GenerateRequest {
    GenerateRequest::new(MODEL, prompt).caller("tester")
}

fn server_error() -> ProviderError {
    ProviderError::Upstream {
        status: Some(503),
        message: "Provider returned 503 Service Unavailable: overloaded".to_string(),
    }
}

fn client_error() -> ProviderError {
    ProviderError::Upstream {
        status: Some(400),
        message: "Provider returned 400 Bad Request".to_string(),
    }
}

// ── Failover ──

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_over_to_next_priority() {
    let p3 = MockProvider::new("p3", Behavior::Hang);
    let p2 = MockProvider::new("p2", Behavior::Reply);
    let p1 = MockProvider::new("p1", Behavior::Reply);
    let gateway = Setup::new(&[(&p1, 1), (&p3, 3), (&p2, 2)]).build();

    let response = gateway.generate(&request("hello")).await.unwrap();

    assert_eq!(response.provider_used, "p2");
    assert_eq!(response.text, "p2: hello");
    assert!(!response.cache_hit);
    assert_eq!(p3.calls(), 1);
    assert_eq!(p2.calls(), 1);
    assert_eq!(p1.calls(), 0);

    let health = gateway.context().health.snapshot_of("p3").unwrap();
    assert_eq!(health.consecutive_failures, 1);
    assert!(health.healthy, "one timeout is below the threshold");
    assert_eq!(health.last_error.unwrap().error_type, "timeout");
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_failed_lists_every_cause() {
    let a = MockProvider::new("alpha", Behavior::Fail(client_error()));
    let b = MockProvider::new(
        "beta",
        Behavior::Fail(ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
            message: "slow down".to_string(),
        }),
    );
    let c = MockProvider::new("gamma", Behavior::Hang);
    let gateway = Setup::new(&[(&a, 3), (&b, 2), (&c, 1)]).build();

    let err = gateway.generate(&request("hello")).await.unwrap_err();
    assert_eq!(err.status_code(), 502);

    let Error::AllProvidersFailed { attempts } = &err else {
        panic!("expected AllProvidersFailed, got {:?}", err);
    };
    let tried: Vec<&str> = attempts.iter().map(|a| a.provider.as_str()).collect();
    assert_eq!(tried, vec!["alpha", "beta", "gamma"]);
    assert_eq!(attempts[0].error.kind(), "upstream");
    assert_eq!(attempts[1].error.kind(), "rate_limited");
    assert_eq!(attempts[2].error.kind(), "timeout");

    let message = err.to_string();
    assert!(message.contains("alpha"));
    assert!(message.contains("slow down"));
    assert!(message.contains("gamma: timeout"));

    // Nothing billed, nothing left reserved
    let tracker = &gateway.context().tracker;
    assert_eq!(tracker.record_count(), 0);
    assert_eq!(tracker.budget_status().reserved, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_errors_retry_same_provider() {
    let flaky = MockProvider::new("flaky", Behavior::FailTimes(2, server_error()));
    let backup = MockProvider::new("backup", Behavior::Reply);

    let mut setup = Setup::new(&[(&flaky, 2), (&backup, 1)]);
    setup.handles[0].descriptor.max_retries = 2;
    let gateway = setup.build();

    let start = tokio::time::Instant::now();
    let response = gateway.generate(&request("hello")).await.unwrap();

    assert_eq!(response.provider_used, "flaky");
    assert_eq!(flaky.calls(), 3);
    assert_eq!(backup.calls(), 0);
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_fails_over_without_retry() {
    let first = MockProvider::new("first", Behavior::Fail(client_error()));
    let second = MockProvider::new("second", Behavior::Reply);

    let mut setup = Setup::new(&[(&first, 2), (&second, 1)]);
    setup.handles[0].descriptor.max_retries = 3;
    let gateway = setup.build();

    let response = gateway.generate(&request("hello")).await.unwrap();
    assert_eq!(response.provider_used, "second");
    assert_eq!(first.calls(), 1);
}

#[tokio::test]
async fn test_no_provider_serves_model() {
    let only = MockProvider::new("only", Behavior::Reply);
    let mut setup = Setup::new(&[(&only, 1)]);
    setup.handles[0].descriptor.logical_models = vec!["smart".to_string()];
    let gateway = setup.build();

    let err = gateway
        .generate(&GenerateRequest::new("fast", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoProviders { ref model } if model == "fast"));
    assert_eq!(err.status_code(), 400);
    assert_eq!(only.calls(), 0);

    let ok = gateway
        .generate(&GenerateRequest::new("smart", "hello"))
        .await
        .unwrap();
    assert_eq!(ok.provider_used, "only");
}

// ── Health ──

#[tokio::test]
async fn test_unhealthy_provider_moves_last_until_success() {
    let a = MockProvider::new("a", Behavior::Fail(client_error()));
    let b = MockProvider::new("b", Behavior::Reply);
    let gateway = Setup::new(&[(&a, 2), (&b, 1)]).build();
    let health = gateway.context().health.clone();

    for i in 0..3 {
        let response = gateway.generate(&request(&format!("q{}", i))).await.unwrap();
        assert_eq!(response.provider_used, "b");
    }
    assert_eq!(a.calls(), 3);
    assert!(!health.is_healthy("a"));

    // Higher priority but unhealthy: b is tried first now
    let response = gateway.generate(&request("q3")).await.unwrap();
    assert_eq!(response.provider_used, "b");
    assert_eq!(a.calls(), 3);

    // Still a candidate when b fails, and one success restores it
    a.set(Behavior::Reply);
    b.set(Behavior::Fail(client_error()));
    let response = gateway.generate(&request("q4")).await.unwrap();
    assert_eq!(response.provider_used, "a");
    assert!(health.is_healthy("a"));
    assert_eq!(health.snapshot_of("a").unwrap().consecutive_failures, 0);
}

// ── Cache ──

#[tokio::test]
async fn test_cache_hit_skips_all_work() {
    let p = MockProvider::new("p", Behavior::Reply);
    let gateway = Setup::new(&[(&p, 1)]).build();
    let ctx = gateway.context().clone();

    let first = gateway
        .generate(&request("Summarize this.\r\nPlease.  "))
        .await
        .unwrap();
    assert!(!first.cache_hit);
    assert!((first.cost - 0.005).abs() < 1e-12);

    // Same request after prompt normalization
    let second = gateway
        .generate(&request("  Summarize this.\nPlease."))
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.text, first.text);
    assert_eq!(second.provider_used, "p");
    assert_eq!(second.cost, 0.0);

    assert_eq!(p.calls(), 1);
    assert_eq!(ctx.tracker.record_count(), 1);
    assert_eq!(ctx.limiter.usage("tester").caller_count, 1);

    let stats = ctx.cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_different_params_miss_cache() {
    let p = MockProvider::new("p", Behavior::Reply);
    let gateway = Setup::new(&[(&p, 1)]).build();

    let cold = request("hello").params(GenerationParams::new().with("temperature", 0.2));
    let warm = request("hello").params(GenerationParams::new().with("temperature", 0.9));

    gateway.generate(&cold).await.unwrap();
    let response = gateway.generate(&warm).await.unwrap();
    assert!(!response.cache_hit);
    assert_eq!(p.calls(), 2);
}

// ── Admission ──

#[tokio::test]
async fn test_rate_limited_before_any_provider_call() {
    let p = MockProvider::new("p", Behavior::Reply);
    let mut setup = Setup::new(&[(&p, 1)]);
    setup.limiter = RateLimiter::new(2, 100, Duration::from_secs(60));
    let gateway = setup.build();

    gateway.generate(&request("one")).await.unwrap();
    gateway.generate(&request("two")).await.unwrap();
    let err = gateway.generate(&request("three")).await.unwrap_err();

    assert_eq!(err.status_code(), 429);
    match err {
        Error::RateLimited(denied) => {
            assert_eq!(denied.scope, LimitScope::Caller);
            assert_eq!(denied.caller, "tester");
            assert_eq!(denied.limit, 2);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(p.calls(), 2);

    // Other callers have their own window
    let other = GenerateRequest::new(MODEL, "three").caller("someone-else");
    assert!(gateway.generate(&other).await.is_ok());
}

#[tokio::test]
async fn test_budget_denies_projection_over_ceiling() {
    let p = MockProvider::new("p", Behavior::Reply);
    let mut setup = Setup::new(&[(&p, 1)]);
    setup.tracker = TokenTracker::new(
        pricing(&[&p]),
        BudgetConfig {
            ceiling: Some(10.0),
            period: BudgetPeriod::Daily,
        },
        UnpricedPolicy::Refuse,
    );
    setup
        .tracker
        .restore([UsageRecord::new("p", MODEL, "earlier", 0, 9500, 9.5)]);
    let gateway = setup.build();

    // 1000 default output tokens at 0.001 projects $1.00
    let err = gateway.generate(&request("expensive")).await.unwrap_err();
    assert_eq!(err.status_code(), 402);
    match &err {
        Error::BudgetExceeded(denied) => {
            assert_eq!(denied.ceiling, 10.0);
            assert!((denied.spent - 9.5).abs() < 1e-9);
            assert!((denied.projected - 1.0).abs() < 1e-9);
            assert!((denied.overage() - 0.5).abs() < 1e-9);
        }
        other => panic!("expected BudgetExceeded, got {:?}", other),
    }
    assert_eq!(p.calls(), 0);

    // max_tokens = 400 projects $0.40, which fits
    let cheap = request("cheap").params(GenerationParams::new().with("max_tokens", 400));
    let response = gateway.generate(&cheap).await.unwrap();
    assert_eq!(response.provider_used, "p");

    let status = gateway.context().tracker.budget_status();
    assert!((status.spent - 9.505).abs() < 1e-9);
    assert_eq!(status.reserved, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_underestimates_overshoot_within_bound() {
    let p = MockProvider::new(
        "p",
        Behavior::Slow {
            delay: Duration::from_millis(100),
            output_tokens: 700,
        },
    );
    let mut setup = Setup::new(&[(&p, 1)]);
    setup.tracker = TokenTracker::new(
        pricing(&[&p]),
        BudgetConfig {
            ceiling: Some(1.0),
            period: BudgetPeriod::Daily,
        },
        UnpricedPolicy::Refuse,
    );
    let gateway = setup.build();

    // Each request projects 400 tokens ($0.40) and really uses 700 ($0.70)
    let capped = |prompt: &str| {
        request(prompt).params(GenerationParams::new().with("max_tokens", 400))
    };
    let (first_req, second_req) = (capped("first"), capped("second"));
    let (first, second) = tokio::join!(
        gateway.generate(&first_req),
        gateway.generate(&second_req)
    );
    assert!((first.unwrap().cost - 0.7).abs() < 1e-9);
    assert!((second.unwrap().cost - 0.7).abs() < 1e-9);
    assert_eq!(p.calls(), 2);

    let status = gateway.context().tracker.budget_status();
    assert!(status.spent > 1.0, "spent {}", status.spent);
    // ceiling + 2 * (0.70 - 0.40)
    assert!(status.spent <= 1.6 + 1e-9, "spent {}", status.spent);
    assert!(status.exceeded);
    assert_eq!(status.reserved, 0.0);

    let err = gateway.generate(&capped("third")).await.unwrap_err();
    assert_eq!(err.status_code(), 402);
    assert_eq!(p.calls(), 2);
}

#[tokio::test]
async fn test_unpriced_provider_rejected_at_construction() {
    let priced = MockProvider::new("priced", Behavior::Reply);
    let unpriced = MockProvider::new("unpriced", Behavior::Reply);

    let mut setup = Setup::new(&[(&priced, 1)]);
    setup.handles.push(handle(&unpriced, 2));
    let names: Vec<String> = setup.handles.iter().map(|h| h.name().to_string()).collect();
    let ctx = GatewayContext {
        health: Arc::new(HealthMonitor::new(&names, 3)),
        tracker: Arc::new(setup.tracker),
        cache: Arc::new(ResponseCache::disabled()),
        limiter: Arc::new(setup.limiter),
    };

    let Err(err) = Gateway::new(setup.handles, ctx, setup.settings) else {
        panic!("gateway with an unpriced provider should be rejected");
    };
    assert!(matches!(err, Error::PricingNotFound(ref e) if e.provider == "unpriced"));
}

// ── Cancellation ──

struct CaptureSink {
    records: Mutex<Vec<UsageRecord>>,
}

#[async_trait]
impl UsageSink for CaptureSink {
    async fn append(&self, record: &UsageRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_response_records_nothing() {
    let slow = MockProvider::new("slow", Behavior::Hang);
    let mut setup = Setup::new(&[(&slow, 1)]);
    setup.handles[0].descriptor.timeout = Duration::from_secs(60);
    let gateway = setup.build();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = gateway
        .generate_with_cancel(&request("hello"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(err.status_code(), 499);

    let ctx = gateway.context();
    assert_eq!(ctx.tracker.record_count(), 0);
    assert_eq!(ctx.tracker.budget_status().reserved, 0.0);
    // Cancellation is not a provider failure
    assert_eq!(ctx.health.snapshot_of("slow").unwrap().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_generate_future_records_nothing() {
    let slow = MockProvider::new("slow", Behavior::Hang);
    let mut setup = Setup::new(&[(&slow, 1)]);
    setup.handles[0].descriptor.timeout = Duration::from_secs(60);
    let gateway = setup.build();

    let abandoned =
        tokio::time::timeout(Duration::from_secs(1), gateway.generate(&request("hello"))).await;
    assert!(abandoned.is_err());

    let tracker = &gateway.context().tracker;
    assert_eq!(tracker.record_count(), 0);
    assert_eq!(tracker.budget_status().reserved, 0.0);
}

#[tokio::test]
async fn test_cancel_after_billing_records_cancelled_usage() {
    let token = CancellationToken::new();
    let p = MockProvider::new("p", Behavior::CancelThenReply(token.clone()));

    let sink = Arc::new(CaptureSink {
        records: Mutex::new(Vec::new()),
    });
    let (queue, worker) = spawn_usage_worker(sink.clone(), 8);

    let mut setup = Setup::new(&[(&p, 1)]);
    setup.tracker = TokenTracker::new(pricing(&[&p]), BudgetConfig::default(), UnpricedPolicy::Refuse)
        .with_sink(queue);
    let gateway = setup.build();

    let err = gateway
        .generate_with_cancel(&request("hello"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(gateway.context().tracker.record_count(), 1);

    // Not cached: a retry of the same request goes upstream again
    let retry = gateway.generate(&request("hello")).await.unwrap();
    assert!(!retry.cache_hit);

    drop(gateway);
    worker.await.unwrap();

    let records = sink.records.lock();
    assert_eq!(records.len(), 2);
    assert!(records[0].cancelled);
    assert_eq!(records[0].caller, "tester");
    assert!(!records[1].cancelled);
}
