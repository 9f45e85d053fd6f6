use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wa_copilot::app_state::AppState;
use wa_copilot::config::AppConfig;
use wa_copilot::db::{self, JobsRepository, MemoryJobsRepository, PostgresJobsRepository};
use wa_copilot::routes::{build_router, RouterConfig};
use wa_copilot::services::ai::openrouter::OpenRouterConfig;
use wa_copilot::services::ai::{ModelRouter, ModelRouterConfig, OpenRouterClient, TextGenerator};
use wa_copilot::services::cache::{CacheConfig, SemanticCache};
use wa_copilot::services::context::{BasicRetriever, ContextBuilder};
use wa_copilot::services::generation::AiGenerationService;
use wa_copilot::services::jobs::JobsService;
use wa_copilot::services::queue::{
    BatchingConfig, BatchingProducer, Consumer, LocalQueue, Producer, StreamsConfig, StreamsQueue,
};
use wa_copilot::services::suggestions::SuggestionsService;
use wa_copilot::worker::Processor;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Structured JSON logging, filtered via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing wa-copilot api");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_enqueued_total", "Async jobs accepted and published");
    metrics::describe_counter!("jobs_processed_total", "Async jobs processed to done");
    metrics::describe_counter!("jobs_failed_total", "Async jobs that ended failed");
    metrics::describe_counter!("semantic_cache_hits_total", "Semantic cache hits");
    metrics::describe_counter!("generation_fallbacks_total", "Generations served by local fallback");

    let shutdown = CancellationToken::new();

    let repo = setup_repository(&config).await;
    let (base_producer, consumer) = setup_queue(&config).await;

    let producer: Arc<dyn Producer> = if config.queue_batching_enabled {
        tracing::info!(
            batch_size = config.queue_batch_size,
            flush_ms = config.queue_batch_flush_ms,
            queue_capacity = config.queue_batch_queue_capacity,
            max_in_flight = config.queue_batch_max_in_flight,
            "queue batching enabled"
        );
        Arc::new(BatchingProducer::new(
            shutdown.clone(),
            base_producer,
            BatchingConfig {
                max_batch_size: config.queue_batch_size,
                flush_interval: Duration::from_millis(config.queue_batch_flush_ms),
                flush_timeout: Duration::from_millis(config.queue_batch_flush_timeout_ms),
                queue_capacity: config.queue_batch_queue_capacity,
                max_in_flight_batches: config.queue_batch_max_in_flight,
            },
        ))
    } else {
        base_producer
    };

    let generation = Arc::new(build_generation_service(&config));
    let jobs_service = JobsService::new(repo.clone(), producer.clone());
    let suggestions_service = SuggestionsService::new(Some(generation.clone()));

    if config.worker_enabled {
        let processor = Arc::new(Processor::new(repo.clone(), generation.clone()));
        let worker_cancel = shutdown.clone();
        let worker_consumer = consumer.clone();
        tokio::spawn(async move {
            processor.run(worker_consumer, worker_cancel).await;
        });
        tracing::info!("worker enabled and started");
    } else {
        tracing::info!("worker disabled by configuration");
    }

    let state = AppState::new(jobs_service, suggestions_service);
    let app = build_router(
        state,
        RouterConfig {
            auth_token: config.api_auth_token.clone(),
            rate_limit_rps: config.rate_limit_rps,
            rate_limit_burst: config.rate_limit_burst,
            cors_origins: config.cors_origins(),
        },
        Some(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!(bind_addr = %config.bind_addr, "api listening");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });
    let serve = async move { server.await };

    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server failed");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    // Drain: the worker loop observes the cancelled token and the batcher
    // performs its final flush before the grace period ends.
    shutdown.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE.min(Duration::from_secs(1))).await;
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // Signal registration failed; park forever and rely on the server.
        std::future::pending::<()>().await;
    }
}

async fn setup_repository(config: &AppConfig) -> Arc<dyn JobsRepository> {
    if config.database_url.is_empty() {
        tracing::info!("DATABASE_URL not configured, using in-memory repository");
        return Arc::new(MemoryJobsRepository::new());
    }

    match db::init_pool(&config.database_url).await {
        Ok(pool) => {
            if let Err(err) = db::run_migrations(&pool).await {
                tracing::error!(error = %err, "failed to run migrations, fallback to memory");
                return Arc::new(MemoryJobsRepository::new());
            }
            tracing::info!("postgres repository initialized");
            Arc::new(PostgresJobsRepository::new(pool))
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to postgres, fallback to memory");
            Arc::new(MemoryJobsRepository::new())
        }
    }
}

async fn setup_queue(config: &AppConfig) -> (Arc<dyn Producer>, Arc<dyn Consumer>) {
    if config.redis_url.is_empty() {
        tracing::info!("REDIS_URL not configured, using local queue fallback");
        let local =
            Arc::new(LocalQueue::new(config.local_queue_buffer, config.queue_max_attempts));
        return (local.clone(), local);
    }

    match StreamsQueue::connect(StreamsConfig {
        url: config.redis_url.clone(),
        stream: config.redis_stream.clone(),
        dlq_stream: config.redis_dlq_stream.clone(),
        group: config.redis_group.clone(),
        consumer: config.redis_consumer.clone(),
        max_attempts: config.queue_max_attempts,
    })
    .await
    {
        Ok(streams) => {
            tracing::info!("redis streams queue initialized");
            let streams = Arc::new(streams);
            (streams.clone(), streams)
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize redis streams queue, fallback to local");
            let local =
                Arc::new(LocalQueue::new(config.local_queue_buffer, config.queue_max_attempts));
            (local.clone(), local)
        }
    }
}

fn build_generation_service(config: &AppConfig) -> AiGenerationService {
    let router = ModelRouter::new(ModelRouterConfig {
        suggestion_primary: config.model_suggestion_primary.clone(),
        suggestion_fallback: config.model_suggestion_fallback.clone(),
        summary_primary: config.model_summary_primary.clone(),
        summary_fallback: config.model_summary_fallback.clone(),
        report_primary: config.model_report_primary.clone(),
        report_fallback: config.model_report_fallback.clone(),
    });

    let client: Option<Arc<dyn TextGenerator>> = if config.openrouter_api_key.is_empty() {
        tracing::info!("generator credentials not configured, degraded mode only");
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

    AiGenerationService::new(
        router,
        client,
        Arc::new(ContextBuilder::new(Arc::new(BasicRetriever::new()))),
        Arc::new(SemanticCache::new(CacheConfig {
            ttl: Duration::from_secs(config.semantic_cache_ttl_seconds),
            max_entries: config.semantic_cache_max_entries,
        })),
        config.prompts_dir.clone(),
    )
}
