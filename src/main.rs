//! relaygate - LLM gateway core
//!
//! Operator CLI: validate configuration, inspect providers and recorded
//! usage, and send one-off requests through the gateway.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaygate::config::{Config, KeySource};
use relaygate::health::HealthMonitor;
use relaygate::provider::ProviderHandle;
use relaygate::router::order_candidates;
use relaygate::storage;
use relaygate::tracker::{resolve_period, TokenTracker};
use relaygate::{Gateway, GenerateRequest, GenerationParams};

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(about = "LLM gateway with failover, caching, rate limits and budgets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file, including pricing coverage
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers in candidate order with their pricing
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Logical model to order candidates for
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Summarize recorded usage from the database
    Usage {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// today, this_month, all_time, last_1h, last_24h, last_7d, last_30d
        #[arg(short, long)]
        range: Option<String>,

        /// RFC 3339 start, overrides --range
        #[arg(long)]
        since: Option<String>,

        /// RFC 3339 end, overrides --range
        #[arg(long)]
        until: Option<String>,
    },

    /// Send a single prompt through the gateway
    Generate {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Logical model name
        #[arg(short, long)]
        model: String,

        /// Caller identity for rate limiting and accounting
        #[arg(long, default_value = relaygate::types::ANONYMOUS_CALLER)]
        caller: String,

        /// Generation parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Prompt text
        prompt: String,
    },
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let (config, key_sources) = Config::from_file_with_env(path)
        .with_context(|| format!("loading configuration from '{}'", path))?;
    for (provider, source) in &key_sources {
        if *source == KeySource::None {
            tracing::warn!(provider = %provider, "no API key configured");
        } else {
            tracing::debug!(provider = %provider, source = %source, "API key resolved");
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Check { config }
        | Commands::Providers { config, .. }
        | Commands::Usage { config, .. }
        | Commands::Generate { config, .. } => config.clone(),
    };
    // The logging level comes from the config file when it parses; RUST_LOG wins.
    let level = Config::from_file(&config_path)
        .map(|c| c.logging.level)
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("relaygate={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Check { config } => {
            tracing::info!(config = %config, "Checking configuration");
            let config = load_config(&config)?;
            println!(
                "Configuration OK: {} provider(s), {} enabled",
                config.providers.len(),
                config.active_providers().count()
            );
            Ok(())
        }

        Commands::Providers { config, model } => {
            let config = load_config(&config)?;
            let pricing = config.pricing_table();
            let http = reqwest::Client::new();
            let handles: Vec<ProviderHandle> = config
                .active_providers()
                .map(|p| ProviderHandle::from_config(p, http.clone()))
                .collect();
            let names: Vec<String> = handles.iter().map(|h| h.name().to_string()).collect();
            let health = HealthMonitor::new(&names, config.health.failure_threshold);

            let ordered: Vec<&ProviderHandle> = match model.as_deref() {
                Some(model) => order_candidates(&handles, model, &health)?,
                None => {
                    let mut all: Vec<&ProviderHandle> = handles.iter().collect();
                    all.sort_by(|a, b| b.descriptor.priority.cmp(&a.descriptor.priority));
                    all
                }
            };
            for handle in ordered {
                let d = &handle.descriptor;
                let price = match pricing.get(handle.name(), &d.model) {
                    Ok(p) => format!(
                        "${:.2}/${:.2} per 1M tokens",
                        p.input * 1_000_000.0,
                        p.output * 1_000_000.0
                    ),
                    Err(_) => "unpriced".to_string(),
                };
                let serves = if d.logical_models.is_empty() {
                    "*".to_string()
                } else {
                    d.logical_models.join(", ")
                };
                println!(
                    "{:<20} priority={:<4} model={:<28} serves=[{}] timeout={}s retries={} {}",
                    d.name,
                    d.priority,
                    d.model,
                    serves,
                    d.timeout.as_secs(),
                    d.max_retries,
                    price
                );
            }
            Ok(())
        }

        Commands::Usage {
            config,
            range,
            since,
            until,
        } => {
            let config = load_config(&config)?;
            let period = resolve_period(range.as_deref(), since.as_deref(), until.as_deref())?;

            let db = config.database();
            let pool = storage::init_pool(&db.path)
                .await
                .with_context(|| format!("opening database '{}'", db.path))?;
            let records = storage::usage::load_since(&pool, None).await?;

            let tracker = TokenTracker::new(
                config.pricing_table(),
                config.budget.clone(),
                config.gateway.unpriced,
            );
            tracker.restore(records);

            let report = serde_json::json!({
                "period": period,
                "summary": tracker.summary(period),
                "budget": tracker.budget_status(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Generate {
            config,
            model,
            caller,
            params,
            prompt,
        } => {
            let config = load_config(&config)?;
            let params = match params {
                Some(raw) => GenerationParams::from_json_str(&raw)
                    .context("--params must be a JSON object")?,
                None => GenerationParams::new(),
            };

            let (gateway, tasks) = Gateway::from_config(&config).await?;
            let request = GenerateRequest::new(model, prompt)
                .caller(caller)
                .params(params);

            let cancel = tasks.shutdown_token();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let result = gateway.generate_with_cancel(&request, &cancel).await;
            tasks.shutdown(gateway).await;

            let response = result?;
            println!("{}", response.text);
            tracing::info!(
                provider = %response.provider_used,
                input_tokens = response.input_tokens,
                output_tokens = response.output_tokens,
                cost = response.cost,
                cache_hit = response.cache_hit,
                "request complete"
            );
            Ok(())
        }
    }
}
