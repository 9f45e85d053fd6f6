use serde::Deserialize;

/// Runtime settings for the API and worker processes.
///
/// Every field has a default so the process can run with no external
/// services: in-memory repository, in-process queue, inert generator.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bearer token required on /v1/* routes. Empty disables auth.
    #[serde(default)]
    pub api_auth_token: String,

    /// PostgreSQL connection string. Empty selects the in-memory repository.
    #[serde(default)]
    pub database_url: String,

    /// Model provider credentials and routing.
    #[serde(default)]
    pub openrouter_api_key: String,
    #[serde(default = "default_openrouter_base_url")]
    pub openrouter_base_url: String,
    #[serde(default = "default_generator_timeout_ms")]
    pub openrouter_timeout_ms: u64,
    #[serde(default = "default_generator_max_retries")]
    pub openrouter_max_retries: u32,
    #[serde(default)]
    pub openrouter_site_url: String,
    #[serde(default = "default_app_name")]
    pub openrouter_app_name: String,

    #[serde(default = "default_model")]
    pub model_suggestion_primary: String,
    #[serde(default = "default_model")]
    pub model_suggestion_fallback: String,
    #[serde(default = "default_model")]
    pub model_summary_primary: String,
    #[serde(default = "default_model")]
    pub model_summary_fallback: String,
    #[serde(default = "default_model")]
    pub model_report_primary: String,
    #[serde(default = "default_model")]
    pub model_report_fallback: String,

    #[serde(default = "default_cache_ttl_seconds")]
    pub semantic_cache_ttl_seconds: u64,
    #[serde(default = "default_cache_max_entries")]
    pub semantic_cache_max_entries: usize,

    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,

    /// Redis connection string. Empty selects the in-process queue.
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_stream")]
    pub redis_stream: String,
    #[serde(default = "default_dlq_stream")]
    pub redis_dlq_stream: String,
    #[serde(default = "default_group")]
    pub redis_group: String,
    #[serde(default = "default_consumer")]
    pub redis_consumer: String,
    #[serde(default = "default_max_attempts")]
    pub queue_max_attempts: i32,
    #[serde(default = "default_local_queue_buffer")]
    pub local_queue_buffer: usize,

    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Comma-separated CORS allow-list.
    #[serde(default = "default_cors_origins")]
    pub cors_allowed_origins: String,

    #[serde(default = "default_true")]
    pub queue_batching_enabled: bool,
    #[serde(default = "default_batch_size")]
    pub queue_batch_size: usize,
    #[serde(default = "default_batch_flush_ms")]
    pub queue_batch_flush_ms: u64,
    #[serde(default = "default_batch_flush_timeout_ms")]
    pub queue_batch_flush_timeout_ms: u64,
    #[serde(default = "default_batch_queue_capacity")]
    pub queue_batch_queue_capacity: usize,
    #[serde(default = "default_batch_max_in_flight")]
    pub queue_batch_max_in_flight: usize,

    #[serde(default = "default_true")]
    pub worker_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // envy sees an empty environment as all-defaults.
        envy::from_iter::<_, AppConfig>(std::iter::empty::<(String, String)>())
            .unwrap_or_else(|_| panic!("default configuration must deserialize"))
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_generator_timeout_ms() -> u64 {
    15_000
}

fn default_generator_max_retries() -> u32 {
    2
}

fn default_app_name() -> String {
    "WA Copilot".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_cache_ttl_seconds() -> u64 {
    900
}

fn default_cache_max_entries() -> usize {
    2000
}

fn default_prompts_dir() -> String {
    "prompts".to_string()
}

fn default_stream() -> String {
    "wa_jobs".to_string()
}

fn default_dlq_stream() -> String {
    "wa_jobs_dlq".to_string()
}

fn default_group() -> String {
    "wa_workers".to_string()
}

fn default_consumer() -> String {
    "api-1".to_string()
}

fn default_max_attempts() -> i32 {
    3
}

fn default_local_queue_buffer() -> usize {
    512
}

fn default_rate_limit_rps() -> f64 {
    20.0
}

fn default_rate_limit_burst() -> u32 {
    40
}

fn default_cors_origins() -> String {
    "https://web.whatsapp.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    32
}

fn default_batch_flush_ms() -> u64 {
    25
}

fn default_batch_flush_timeout_ms() -> u64 {
    3000
}

fn default_batch_queue_capacity() -> usize {
    2048
}

fn default_batch_max_in_flight() -> usize {
    4
}
