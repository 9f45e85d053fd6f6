//! Standalone worker process: consumes the job stream without serving HTTP.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wa_copilot::config::AppConfig;
use wa_copilot::db::{self, JobsRepository, MemoryJobsRepository, PostgresJobsRepository};
use wa_copilot::services::ai::openrouter::OpenRouterConfig;
use wa_copilot::services::ai::{ModelRouter, ModelRouterConfig, OpenRouterClient, TextGenerator};
use wa_copilot::services::cache::{CacheConfig, SemanticCache};
use wa_copilot::services::context::{BasicRetriever, ContextBuilder};
use wa_copilot::services::generation::AiGenerationService;
use wa_copilot::services::queue::{Consumer, LocalQueue, StreamsConfig, StreamsQueue};
use wa_copilot::worker::Processor;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting wa-copilot worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let repo: Arc<dyn JobsRepository> = if config.database_url.is_empty() {
        tracing::warn!("DATABASE_URL not configured, worker state will not be shared");
        Arc::new(MemoryJobsRepository::new())
    } else {
        let pool = db::init_pool(&config.database_url)
            .await
            .expect("Failed to connect to database");
        db::run_migrations(&pool).await.expect("Failed to run migrations");
        Arc::new(PostgresJobsRepository::new(pool))
    };

    let consumer: Arc<dyn Consumer> = if config.redis_url.is_empty() {
        tracing::warn!("REDIS_URL not configured, consuming the in-process queue");
        Arc::new(LocalQueue::new(config.local_queue_buffer, config.queue_max_attempts))
    } else {
        Arc::new(
            StreamsQueue::connect(StreamsConfig {
                url: config.redis_url.clone(),
                stream: config.redis_stream.clone(),
                dlq_stream: config.redis_dlq_stream.clone(),
                group: config.redis_group.clone(),
                consumer: config.redis_consumer.clone(),
                max_attempts: config.queue_max_attempts,
            })
            .await
            .expect("Failed to initialize redis streams queue"),
        )
    };

    let client: Option<Arc<dyn TextGenerator>> = if config.openrouter_api_key.is_empty() {
        None
    } else {
        Some(Arc::new(OpenRouterClient::new(OpenRouterConfig {
            api_key: config.openrouter_api_key.clone(),
            base_url: config.openrouter_base_url.clone(),
            timeout: Duration::from_millis(config.openrouter_timeout_ms),
            max_retries: config.openrouter_max_retries,
            site_url: config.openrouter_site_url.clone(),
            app_name: config.openrouter_app_name.clone(),
        })))
    };

    let generation = Arc::new(AiGenerationService::new(
        ModelRouter::new(ModelRouterConfig {
            suggestion_primary: config.model_suggestion_primary.clone(),
            suggestion_fallback: config.model_suggestion_fallback.clone(),
            summary_primary: config.model_summary_primary.clone(),
            summary_fallback: config.model_summary_fallback.clone(),
            report_primary: config.model_report_primary.clone(),
            report_fallback: config.model_report_fallback.clone(),
        }),
        client,
        Arc::new(ContextBuilder::new(Arc::new(BasicRetriever::new()))),
        Arc::new(SemanticCache::new(CacheConfig {
            ttl: Duration::from_secs(config.semantic_cache_ttl_seconds),
            max_entries: config.semantic_cache_max_entries,
        })),
        config.prompts_dir.clone(),
    ));

    let processor = Arc::new(Processor::new(repo, generation));
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    tracing::info!("worker ready, starting consume loop");
    processor.run(consumer, cancel).await;
    tracing::info!("worker stopped");
}
