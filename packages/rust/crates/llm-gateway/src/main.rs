//! llm-gateway CLI entrypoint: load configuration, assemble the dispatch core, serve
//! HTTP (§6.1).
//!
//! Logging: set `RUST_LOG=llm_gateway=info` (or `warn`, `debug`) to see gateway logs
//! on stderr.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use llm_gateway::cli::Cli;
use llm_gateway::config::{ProviderSettings, load_runtime_settings, set_config_home_override};
use llm_gateway::http_client::{build_shared_client, warmup};
use llm_gateway::{
    Coalescer, ContextBuilder, GatewayState, HeuristicRouter, IdentityQueryRewriter,
    MetricsRegistry, NoopMemoryProvider, OpenAiCompatibleAdapter, PacerRegistry, ProviderAdapter,
    ProviderCandidate, StreamHub, ThreadStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(conf_dir) = cli.conf.clone() {
        set_config_home_override(conf_dir);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llm_gateway=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();

    let settings = load_runtime_settings()?;

    let client = build_shared_client(Duration::from_millis(settings.client_first_token_timeout_ms * 3))?;

    let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    let mut pacers = PacerRegistry::new();
    let mut candidates = Vec::new();
    let mut warmup_targets = Vec::new();

    for (provider, provider_settings) in &settings.per_provider {
        let api_key = provider_settings.api_key_env.as_ref().and_then(|var| std::env::var(var).ok());

        providers.insert(
            provider.clone(),
            Arc::new(OpenAiCompatibleAdapter::new(client.clone(), provider_settings.base_url.clone(), api_key)),
        );
        pacers.insert(provider.clone(), provider_settings.rps, provider_settings.burst, provider_settings.concurrency);
        warmup_targets.push((provider.clone(), provider_settings.base_url.clone()));
        candidates.push(ProviderCandidate {
            provider: provider.clone(),
            model: settings.default_model.clone(),
            capability: 0.7,
            speed: 0.7,
            cheapness: 0.7,
            max_context_tokens: 128_000,
            positive_feedback: 0,
            negative_feedback: 0,
            attempts: 0,
        });
    }

    if !providers.contains_key(&settings.default_provider) {
        let default_settings = ProviderSettings::default();
        let api_key = default_settings.api_key_env.as_ref().and_then(|var| std::env::var(var).ok());
        providers.insert(
            settings.default_provider.clone(),
            Arc::new(OpenAiCompatibleAdapter::new(client.clone(), default_settings.base_url.clone(), api_key)),
        );
        pacers.insert(
            settings.default_provider.clone(),
            default_settings.rps,
            default_settings.burst,
            default_settings.concurrency,
        );
        warmup_targets.push((settings.default_provider.clone(), default_settings.base_url.clone()));
        candidates.push(ProviderCandidate {
            provider: settings.default_provider.clone(),
            model: settings.default_model.clone(),
            capability: 0.5,
            speed: 0.5,
            cheapness: 0.5,
            max_context_tokens: 128_000,
            positive_feedback: 0,
            negative_feedback: 0,
            attempts: 0,
        });
    }

    warmup(&client, &warmup_targets).await;

    let state = GatewayState {
        thread_store: Arc::new(ThreadStore::with_window(50)),
        context_builder: Arc::new(ContextBuilder::new(
            Box::new(NoopMemoryProvider),
            Box::new(IdentityQueryRewriter),
            settings.memory.enabled,
            settings.query_rewriter.enabled,
        )),
        router: Arc::new(HeuristicRouter::default()),
        candidates,
        coalescer: Arc::new(Coalescer::new()),
        hub: Arc::new(StreamHub::new()),
        pacers: Arc::new(pacers),
        providers,
        metrics: Arc::new(MetricsRegistry::with_window_size(settings.metrics.window_size)),
        settings,
    };

    llm_gateway::run_http(state, &cli.bind).await
}
