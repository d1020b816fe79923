//! Read chat messages from stdin, and forward every token address found in them.
use std::sync::Arc;
use std::time;

use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scanner_common::extract::{PatternExtractor, SuffixJoin};
use scanner_common::health::HealthRegistry;
use scanner_common::metrics::{serve, setup_metrics_routes};
use scanner_common::retry::RetryPolicy;
use scanner_common::store::{Client, MemoryClient, RedisClient};
use scanner_worker::config::Config;
use scanner_worker::error::WorkerError;
use scanner_worker::forward::{Forwarder, LogForwarder, WebhookForwarder};
use scanner_worker::handlers;
use scanner_worker::llm::{ChatCompletionProvider, ReconstructionProvider};
use scanner_worker::pipeline::{Pipeline, PipelineSettings};
use scanner_worker::providers::{MarketProvider, QuoteProvider, RegistryProvider};
use scanner_worker::reconstruct::{ReconstructionEngine, ReconstructionSettings};
use scanner_worker::source::consume;
use scanner_worker::verify::{VerificationCoordinator, VerificationProvider};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let source_liveness = liveness
        .register(
            "message_source".to_string(),
            time::Duration::from_secs(config.liveness_deadline_secs),
        )
        .await;

    let store: Arc<dyn Client + Send + Sync> = match &config.redis_url {
        Some(url) => Arc::new(RedisClient::new(url.to_owned())?),
        None => {
            info!("no redis url configured, keeping state in memory");
            Arc::new(MemoryClient::new())
        }
    };

    let forwarder: Arc<dyn Forwarder> = match &config.forward_url {
        Some(url) => Arc::new(WebhookForwarder::new(url, config.forward_timeout.0)?),
        None => {
            info!("no forward url configured, verified addresses are only logged");
            Arc::new(LogForwarder {})
        }
    };

    let client = reqwest::Client::builder()
        .user_agent("Token Address Scanner")
        .build()?;

    let verification = &config.verification;
    let providers: Vec<Arc<dyn VerificationProvider>> = vec![
        Arc::new(QuoteProvider::new(
            client.clone(),
            verification.quote_url.as_str(),
            verification.quote_timeout.0,
        )),
        Arc::new(MarketProvider::new(
            client.clone(),
            verification.market_url.as_str(),
            verification.market_timeout.0,
        )),
        Arc::new(RegistryProvider::new(
            client.clone(),
            verification.registry_url.as_str(),
            verification.registry_timeout.0,
        )),
    ];

    let reconstruction = &config.reconstruction;
    let reconstruction_provider: Option<Arc<dyn ReconstructionProvider>> =
        match &reconstruction.reconstruction_api_key {
            Some(api_key) if reconstruction.reconstruction_enabled => {
                Some(Arc::new(
                    ChatCompletionProvider::new(
                        client,
                        reconstruction.reconstruction_url.as_str(),
                        api_key,
                    )
                    .map_err(WorkerError::ReconstructionUrlError)?,
                ))
            }
            _ => {
                info!("AI reconstruction disabled");
                None
            }
        };

    let extractor = PatternExtractor::new(
        config.suffix_markers.0.as_slice(),
        SuffixJoin {
            max_overlap: config.suffix_max_overlap,
        },
    );
    let engine = ReconstructionEngine::new(
        extractor,
        ReconstructionSettings {
            previous_max_len: config.direct_previous_max_len,
            current_max_len: config.direct_current_max_len,
            max_attempts: reconstruction.reconstruction_max_attempts,
            timeout: reconstruction.reconstruction_timeout.0,
            model: reconstruction.reconstruction_model.as_str().to_owned(),
            retry_policy: RetryPolicy::new(
                reconstruction.reconstruction_backoff_coefficient,
                reconstruction.reconstruction_initial_interval.0,
                Some(reconstruction.reconstruction_maximum_interval.0),
            ),
        },
        reconstruction_provider,
    );

    let pipeline = Arc::new(Pipeline::new(
        engine,
        VerificationCoordinator::new(providers),
        store,
        forwarder,
        PipelineSettings {
            window_size: config.window_size,
            buffer_size: config.buffer_size,
            buffer_window: config.buffer_window.0,
            auto_forward: config.auto_forward,
            history_limit: config.history_limit,
        },
    ));

    let router = setup_metrics_routes(handlers::app(pipeline.registry(), liveness))?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start serving admin routes: {}", e);
        }
    });

    let idle_tick = time::Duration::from_secs((config.liveness_deadline_secs / 3).max(1));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    consume(stdin, pipeline, source_liveness, idle_tick).await?;

    Ok(())
}
