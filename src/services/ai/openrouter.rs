//! OpenRouter-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{GenerateRequest, GenerateResult, GeneratorError, TextGenerator, TokenUsage};

const PROVIDER_ERROR_MAX_CHARS: usize = 700;

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub site_url: String,
    pub app_name: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            timeout: Duration::from_secs(15),
            max_retries: 2,
            site_url: String::new(),
            app_name: "WA Copilot".to_string(),
        }
    }
}

pub struct OpenRouterClient {
    http: Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    site_url: String,
    app_name: String,
}

impl OpenRouterClient {
    pub fn new(mut config: OpenRouterConfig) -> Self {
        if config.base_url.trim().is_empty() {
            config.base_url = "https://openrouter.ai/api/v1".to_string();
        }
        if config.timeout.is_zero() {
            config.timeout = Duration::from_secs(15);
        }
        if config.app_name.trim().is_empty() {
            config.app_name = "WA Copilot".to_string();
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            api_key: config.api_key.trim().to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            site_url: config.site_url.trim().to_string(),
            app_name: config.app_name.trim().to_string(),
        }
    }

    async fn call_chat_completions(
        &self,
        payload: &serde_json::Value,
        requested_model: &str,
    ) -> Result<GenerateResult, GeneratorError> {
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json");
        if !self.site_url.is_empty() {
            request = request.header("HTTP-Referer", &self.site_url);
        }
        if !self.app_name.is_empty() {
            request = request.header("X-Title", &self.app_name);
        }

        let response = request.json(payload).send().await.map_err(|err| {
            if err.is_timeout() {
                GeneratorError::Timeout
            } else {
                GeneratorError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| GeneratorError::Transport(err.to_string()))?;

        if !status.is_success() {
            let message: String = body.trim().chars().take(PROVIDER_ERROR_MAX_CHARS).collect();
            return Err(GeneratorError::Provider { status: status.as_u16(), message });
        }

        let decoded: ChatCompletionsResponse = serde_json::from_str(&body)
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;

        let text = decoded
            .choices
            .iter()
            .filter_map(|choice| choice.message.as_ref())
            .map(|message| message.content.trim())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(GeneratorError::InvalidResponse("response without text output".into()));
        }

        let model_id = if decoded.model.trim().is_empty() {
            requested_model.to_string()
        } else {
            decoded.model.trim().to_string()
        };

        Ok(GenerateResult {
            text,
            model_id,
            usage: TokenUsage {
                input_tokens: decoded.usage.prompt_tokens,
                output_tokens: decoded.usage.completion_tokens,
                total_tokens: decoded.usage.total_tokens,
            },
        })
    }
}

#[async_trait]
impl TextGenerator for OpenRouterClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResult, GeneratorError> {
        if !self.available() {
            return Err(GeneratorError::Unavailable);
        }
        if request.model.trim().is_empty() {
            return Err(GeneratorError::MissingModel);
        }
        if request.input.trim().is_empty() {
            return Err(GeneratorError::MissingInput);
        }

        let mut messages = Vec::with_capacity(2);
        if !request.instructions.trim().is_empty() {
            messages.push(serde_json::json!({
                "role": "system",
                "content": request.instructions.trim(),
            }));
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": request.input,
        }));

        let payload = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
        });

        let mut last_error = GeneratorError::Unavailable;
        for attempt in 0..=self.max_retries {
            match self.call_chat_completions(&payload, &request.model).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_error = err;
                    if !retryable || attempt == self.max_retries {
                        break;
                    }
                }
            }
            let backoff = Duration::from_millis(350 * (attempt as u64 + 1));
            tokio::time::sleep(backoff).await;
        }
        Err(last_error)
    }

    fn available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}
