//! AI generation orchestrator.
//!
//! For each task: build context, probe the semantic cache, render the
//! prompt, walk the primary/fallback model ladder, parse and validate the
//! output, then cache the canonical payload. Every failure along the way
//! degrades to a deterministic local fallback instead of surfacing an
//! error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::json;

use crate::services::ai::{
    GenerateRequest, GeneratorError, ModelProfile, ModelRouter, TaskKind, TextGenerator,
};
use crate::services::cache::{CacheEntry, SemanticCache};
use crate::services::context::{BuildInput, ContextBuilder};
use crate::services::policy;
use crate::services::quality::{OutputValidator, SuggestionCandidate};
use crate::services::suggestions::bank_for;

pub const FALLBACK_MODEL_ID: &str = "fallback-local";
const FALLBACK_QUALITY_SCORE: f64 = 0.55;

#[derive(Debug, Clone, Default)]
pub struct SuggestionsInput {
    pub tenant_id: String,
    pub conversation_id: String,
    pub locale: String,
    pub tone: String,
    pub context_window: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SuggestionsOutput {
    pub model_id: String,
    pub prompt_version: String,
    pub suggestions: Vec<SuggestionCandidate>,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct JobGenerationInput {
    pub tenant_id: String,
    pub conversation_id: String,
    pub locale: String,
    pub tone: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct JobGenerationOutput {
    pub body: Vec<u8>,
    pub model_id: String,
    pub prompt_version: String,
    pub cache_hit: bool,
    pub used_fallback: bool,
}

pub struct AiGenerationService {
    router: ModelRouter,
    client: Option<Arc<dyn TextGenerator>>,
    builder: Arc<ContextBuilder>,
    cache: Arc<SemanticCache>,
    validator: OutputValidator,
    prompts_dir: PathBuf,
    templates: RwLock<HashMap<String, String>>,
}

impl AiGenerationService {
    pub fn new(
        router: ModelRouter,
        client: Option<Arc<dyn TextGenerator>>,
        builder: Arc<ContextBuilder>,
        cache: Arc<SemanticCache>,
        prompts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            router,
            client,
            builder,
            cache,
            validator: OutputValidator::new(),
            prompts_dir: prompts_dir.into(),
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub async fn generate_suggestions(&self, input: SuggestionsInput) -> SuggestionsOutput {
        let locale = normalize_locale(&input.locale);
        let tone = normalize_tone(&input.tone);
        let profile = self.router.select(TaskKind::Suggestion);
        let prompt_version = "reply_v1";
        let prompt_file = "reply_v1.tmpl";

        let context = match self
            .builder
            .build(BuildInput {
                task: TaskKind::Suggestion.as_str().to_string(),
                tenant_id: input.tenant_id.clone(),
                conversation_id: input.conversation_id.clone(),
                payload: input.payload.clone(),
                max_input_tokens: suggestion_token_budget(input.context_window),
                max_chunks: suggestion_chunk_limit(input.context_window),
                context_window: input.context_window,
            })
            .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(error = %err, "context build failed for suggestions");
                return self.fallback_suggestions(&locale, &tone, prompt_version);
            }
        };

        let signature = SemanticCache::build_signature(&[
            TaskKind::Suggestion.as_str(),
            &input.tenant_id,
            &input.conversation_id,
            &locale,
            &tone,
            prompt_version,
            &context.context_text,
        ]);
        if let Some(cached) = self.cache.get(&signature) {
            if let Ok((suggestions, score)) = parse_suggestions_payload(&cached.value) {
                metrics::counter!("semantic_cache_hits_total").increment(1);
                return SuggestionsOutput {
                    model_id: first_non_empty(&cached.model_id, "cache-hit"),
                    prompt_version: first_non_empty(&cached.prompt_version, prompt_version),
                    suggestions,
                    quality_score: score,
                };
            }
        }

        let prompt = match self.render_prompt(prompt_file, &locale, &tone, &context.context_text) {
            Ok(prompt) => prompt,
            Err(err) => {
                tracing::warn!(error = %err, "render prompt failed for suggestions");
                return self.fallback_suggestions(&locale, &tone, prompt_version);
            }
        };

        let (text, model_id) = match self.generate_text(&profile, &prompt).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "generator failed for suggestions, using fallback");
                return self.fallback_suggestions(&locale, &tone, prompt_version);
            }
        };

        let parsed = match parse_suggestions_from_model(&text, &locale, &tone) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "parse suggestions failed, using fallback");
                return self.fallback_suggestions(&locale, &tone, prompt_version);
            }
        };

        let (validated, quality_score) = match self.validate_suggestions(&locale, &tone, parsed) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "validate suggestions failed, using fallback");
                return self.fallback_suggestions(&locale, &tone, prompt_version);
            }
        };

        if let Ok(cache_body) = serde_json::to_vec(&json!({
            "suggestions": &validated,
            "quality_score": quality_score,
        })) {
            self.cache.set(
                &signature,
                CacheEntry {
                    value: cache_body,
                    model_id: model_id.clone(),
                    prompt_version: prompt_version.to_string(),
                    ..CacheEntry::default()
                },
            );
        }

        SuggestionsOutput {
            model_id,
            prompt_version: prompt_version.to_string(),
            suggestions: validated,
            quality_score,
        }
    }

    pub async fn generate_summary(&self, input: JobGenerationInput) -> JobGenerationOutput {
        self.generate_structured_job(TaskKind::Summary, input, "summary_v1", "summary_v1.tmpl", 3200)
            .await
    }

    pub async fn generate_report(&self, input: JobGenerationInput) -> JobGenerationOutput {
        self.generate_structured_job(TaskKind::Report, input, "report_v1", "report_v1.tmpl", 5200)
            .await
    }

    async fn generate_structured_job(
        &self,
        task: TaskKind,
        input: JobGenerationInput,
        prompt_version: &str,
        prompt_file: &str,
        max_input_tokens: i32,
    ) -> JobGenerationOutput {
        let locale = normalize_locale(&input.locale);
        let tone = normalize_tone(&input.tone);
        let profile = self.router.select(task);

        let context = match self
            .builder
            .build(BuildInput {
                task: task.as_str().to_string(),
                tenant_id: input.tenant_id.clone(),
                conversation_id: input.conversation_id.clone(),
                payload: input.payload.clone(),
                max_input_tokens,
                max_chunks: max_chunk_limit(task),
                context_window: 20,
            })
            .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(task = task.as_str(), error = %err, "context build failed");
                return self.fallback_job(task, prompt_version);
            }
        };

        let signature = SemanticCache::build_signature(&[
            task.as_str(),
            &input.tenant_id,
            &input.conversation_id,
            &locale,
            &tone,
            prompt_version,
            &context.context_text,
        ]);
        if let Some(cached) = self.cache.get(&signature) {
            if !cached.value.is_empty() {
                metrics::counter!("semantic_cache_hits_total").increment(1);
                return JobGenerationOutput {
                    body: cached.value,
                    model_id: first_non_empty(&cached.model_id, "cache-hit"),
                    prompt_version: first_non_empty(&cached.prompt_version, prompt_version),
                    cache_hit: true,
                    used_fallback: false,
                };
            }
        }

        let prompt = match self.render_prompt(prompt_file, &locale, &tone, &context.context_text) {
            Ok(prompt) => prompt,
            Err(err) => {
                tracing::warn!(task = task.as_str(), error = %err, "render prompt failed");
                return self.fallback_job(task, prompt_version);
            }
        };

        let (text, model_id) = match self.generate_text(&profile, &prompt).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(task = task.as_str(), error = %err, "generator failed, fallback enabled");
                return self.fallback_job(task, prompt_version);
            }
        };

        let body = match parse_job_payload(task, &text, prompt_version, &model_id) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(task = task.as_str(), error = %err, "parse model payload failed, fallback enabled");
                return self.fallback_job(task, prompt_version);
            }
        };

        let validated = match self.validator.validate_task_payload(task, &body, &locale, &tone) {
            Ok((validated, _score)) => validated,
            Err(err) => {
                tracing::warn!(task = task.as_str(), error = %err, "validate payload failed, fallback enabled");
                return self.fallback_job(task, prompt_version);
            }
        };

        self.cache.set(
            &signature,
            CacheEntry {
                value: validated.clone(),
                model_id: model_id.clone(),
                prompt_version: prompt_version.to_string(),
                ..CacheEntry::default()
            },
        );

        JobGenerationOutput {
            body: validated,
            model_id,
            prompt_version: prompt_version.to_string(),
            cache_hit: false,
            used_fallback: false,
        }
    }

    fn fallback_suggestions(
        &self,
        locale: &str,
        tone: &str,
        prompt_version: &str,
    ) -> SuggestionsOutput {
        let candidates = bank_for(locale, tone);

        match self.validate_suggestions(locale, tone, candidates.clone()) {
            Ok((validated, score)) => SuggestionsOutput {
                model_id: FALLBACK_MODEL_ID.to_string(),
                prompt_version: prompt_version.to_string(),
                suggestions: validated,
                quality_score: score,
            },
            Err(err) => {
                tracing::warn!(error = %err, "fallback suggestions validation failed");
                let masked = candidates
                    .into_iter()
                    .enumerate()
                    .map(|(index, candidate)| SuggestionCandidate {
                        rank: index as i32 + 1,
                        content: policy::mask_pii(&candidate.content),
                        rationale: policy::mask_pii(&candidate.rationale),
                    })
                    .collect();
                SuggestionsOutput {
                    model_id: FALLBACK_MODEL_ID.to_string(),
                    prompt_version: prompt_version.to_string(),
                    suggestions: masked,
                    quality_score: FALLBACK_QUALITY_SCORE,
                }
            }
        }
    }

    fn fallback_job(&self, task: TaskKind, prompt_version: &str) -> JobGenerationOutput {
        metrics::counter!("generation_fallbacks_total").increment(1);
        let payload = match task {
            TaskKind::Summary => json!({
                "summary": "Resumo gerado em modo degradado por indisponibilidade temporaria do modelo.",
                "action_items": ["Revisar pendencias principais", "Responder contato com proximo passo"],
                "prompt_version": prompt_version,
                "model_id": FALLBACK_MODEL_ID,
                "quality_score": FALLBACK_QUALITY_SCORE,
            }),
            TaskKind::Report => json!({
                "title": "Relatorio (modo degradado)",
                "sections": [
                    {"heading": "Visao geral", "content": "Relatorio gerado em modo degradado devido a indisponibilidade temporaria do modelo."},
                    {"heading": "Pendencias", "content": "Validar manualmente os pontos criticos da conversa."},
                    {"heading": "Proximos passos", "content": "Tentar nova geracao quando o servico de IA estiver disponivel."},
                ],
                "prompt_version": prompt_version,
                "model_id": FALLBACK_MODEL_ID,
                "quality_score": FALLBACK_QUALITY_SCORE,
            }),
            TaskKind::Suggestion => json!({
                "model_id": FALLBACK_MODEL_ID,
                "prompt_version": prompt_version,
                "quality_score": FALLBACK_QUALITY_SCORE,
            }),
        };

        let body = serde_json::to_vec(&payload).unwrap_or_else(|_| {
            br#"{"model_id":"fallback-local","quality_score":0.55}"#.to_vec()
        });

        JobGenerationOutput {
            body,
            model_id: FALLBACK_MODEL_ID.to_string(),
            prompt_version: prompt_version.to_string(),
            cache_hit: false,
            used_fallback: true,
        }
    }

    /// Runs the quality validator, dedupes, and tops the list up to three
    /// candidates from the static bank.
    fn validate_suggestions(
        &self,
        locale: &str,
        tone: &str,
        suggestions: Vec<SuggestionCandidate>,
    ) -> Result<(Vec<SuggestionCandidate>, f64), crate::services::quality::QualityError> {
        let validation = self.validator.validate_suggestions(locale, tone, &suggestions)?;
        let validated_count = validation.suggestions.len();

        let mut result: Vec<SuggestionCandidate> = Vec::with_capacity(3);
        let mut seen = std::collections::HashSet::new();
        for candidate in validation.suggestions {
            let content = policy::mask_pii(candidate.content.trim()).trim().to_string();
            if content.is_empty() || !seen.insert(content.to_lowercase()) {
                continue;
            }
            result.push(SuggestionCandidate {
                rank: result.len() as i32 + 1,
                content,
                rationale: policy::mask_pii(candidate.rationale.trim()).trim().to_string(),
            });
            if result.len() >= 3 {
                break;
            }
        }

        if result.len() < 3 {
            for fallback in bank_for(locale, tone) {
                if result.len() >= 3 {
                    break;
                }
                let content = policy::mask_pii(fallback.content.trim()).trim().to_string();
                if content.is_empty() || !seen.insert(content.to_lowercase()) {
                    continue;
                }
                result.push(SuggestionCandidate {
                    rank: result.len() as i32 + 1,
                    content,
                    rationale: policy::mask_pii(fallback.rationale.trim()).trim().to_string(),
                });
            }
        }

        if result.is_empty() {
            return Err(crate::services::quality::QualityError::Rejected(
                "no suggestions available after validation".into(),
            ));
        }

        // Topping up from the bank costs a small penalty.
        let mut score = validation.score;
        if validated_count < result.len() {
            score -= 0.05;
        }
        Ok((result, score.max(0.0)))
    }

    /// Calls the primary model, then a distinct non-empty fallback model
    /// once, and propagates the combined failure otherwise.
    async fn generate_text(
        &self,
        profile: &ModelProfile,
        prompt: &str,
    ) -> Result<(String, String), GeneratorError> {
        let client = match &self.client {
            Some(client) if client.available() => client,
            _ => return Err(GeneratorError::Unavailable),
        };

        let instructions = "Return only valid JSON. Do not use markdown code fences.";
        let primary = client
            .generate(GenerateRequest {
                model: profile.primary_model.clone(),
                instructions: instructions.to_string(),
                input: prompt.to_string(),
                temperature: profile.temperature,
                max_output_tokens: profile.max_output_tokens,
            })
            .await;

        let primary_err = match primary {
            Ok(result) => {
                let model_id = first_non_empty(&result.model_id, &profile.primary_model);
                return Ok((result.text, model_id));
            }
            Err(err) => err,
        };

        let fallback_model = profile.fallback_model.trim();
        if fallback_model.is_empty() || fallback_model == profile.primary_model {
            return Err(primary_err);
        }

        match client
            .generate(GenerateRequest {
                model: fallback_model.to_string(),
                instructions: instructions.to_string(),
                input: prompt.to_string(),
                temperature: profile.temperature,
                max_output_tokens: profile.max_output_tokens,
            })
            .await
        {
            Ok(result) => {
                let model_id = first_non_empty(&result.model_id, fallback_model);
                Ok((result.text, model_id))
            }
            Err(fallback_err) => Err(GeneratorError::Ladder {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }

    fn render_prompt(
        &self,
        file_name: &str,
        locale: &str,
        tone: &str,
        context: &str,
    ) -> Result<String, std::io::Error> {
        let template = self.load_template(file_name)?;
        Ok(template
            .replace("{{locale}}", locale)
            .replace("{{tone}}", tone)
            .replace("{{context}}", context))
    }

    /// Template files are read once and cached per filename.
    fn load_template(&self, file_name: &str) -> Result<String, std::io::Error> {
        {
            let templates = self.templates.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(template) = templates.get(file_name) {
                return Ok(template.clone());
            }
        }

        let path = self.prompts_dir.join(file_name);
        let content = std::fs::read_to_string(&path)?;

        let mut templates = self.templates.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        templates.insert(file_name.to_string(), content.clone());
        Ok(content)
    }
}

fn normalize_locale(locale: &str) -> String {
    let trimmed = locale.trim();
    if trimmed.is_empty() {
        return "pt-BR".to_string();
    }
    trimmed.chars().take(16).collect()
}

fn normalize_tone(tone: &str) -> String {
    match tone.trim().to_lowercase().as_str() {
        tone @ ("formal" | "neutro" | "amigavel") => tone.to_string(),
        _ => "neutro".to_string(),
    }
}

fn suggestion_token_budget(context_window: i32) -> i32 {
    let window = if context_window <= 0 { 20 } else { context_window }.clamp(5, 80);
    (900 + window * 32).clamp(1000, 2200)
}

fn suggestion_chunk_limit(context_window: i32) -> i32 {
    let window = if context_window <= 0 { 20 } else { context_window };
    (3 + window / 12).clamp(4, 8)
}

fn max_chunk_limit(task: TaskKind) -> i32 {
    match task {
        TaskKind::Summary => 10,
        TaskKind::Report => 12,
        TaskKind::Suggestion => 8,
    }
}

fn first_non_empty(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() { fallback.trim().to_string() } else { trimmed.to_string() }
}

#[derive(Debug, thiserror::Error)]
enum ParseError {
    #[error("empty model output")]
    EmptyOutput,

    #[error("model output is not valid JSON")]
    NotJson,

    #[error("{0}")]
    InvalidPayload(String),
}

fn parse_suggestions_from_model(
    text: &str,
    locale: &str,
    tone: &str,
) -> Result<Vec<SuggestionCandidate>, ParseError> {
    let raw = extract_json(text)?;

    #[derive(serde::Deserialize)]
    struct Envelope {
        #[serde(default)]
        suggestions: Vec<Item>,
    }
    #[derive(serde::Deserialize)]
    struct Item {
        #[serde(default)]
        content: String,
        #[serde(default)]
        rationale: String,
    }

    let parsed: Envelope = serde_json::from_str(&raw)
        .map_err(|err| ParseError::InvalidPayload(format!("decode suggestions json: {err}")))?;
    if parsed.suggestions.is_empty() {
        return Err(ParseError::InvalidPayload("empty suggestions".into()));
    }

    let mut result: Vec<SuggestionCandidate> = Vec::with_capacity(3);
    for item in parsed.suggestions {
        let content = item.content.trim().to_string();
        if content.is_empty() {
            continue;
        }
        result.push(SuggestionCandidate {
            rank: result.len() as i32 + 1,
            content,
            rationale: item.rationale.trim().to_string(),
        });
        if result.len() >= 3 {
            break;
        }
    }

    if result.len() < 3 {
        for item in bank_for(locale, tone) {
            if result.len() >= 3 {
                break;
            }
            result.push(SuggestionCandidate {
                rank: result.len() as i32 + 1,
                content: item.content,
                rationale: item.rationale,
            });
        }
    }

    for (index, item) in result.iter_mut().enumerate() {
        item.rank = index as i32 + 1;
    }
    Ok(result)
}

fn parse_suggestions_payload(value: &[u8]) -> Result<(Vec<SuggestionCandidate>, f64), ParseError> {
    #[derive(serde::Deserialize)]
    struct CachedEnvelope {
        #[serde(default)]
        suggestions: Vec<SuggestionCandidate>,
        #[serde(default)]
        quality_score: f64,
    }

    let payload: CachedEnvelope = serde_json::from_slice(value)
        .map_err(|err| ParseError::InvalidPayload(err.to_string()))?;
    if payload.suggestions.is_empty() {
        return Err(ParseError::InvalidPayload("empty suggestions payload".into()));
    }
    let score = if (0.0..=1.0).contains(&payload.quality_score) {
        payload.quality_score
    } else {
        0.5
    };
    Ok((payload.suggestions, score))
}

fn parse_job_payload(
    task: TaskKind,
    text: &str,
    prompt_version: &str,
    model_id: &str,
) -> Result<Vec<u8>, ParseError> {
    let raw = extract_json(text)?;

    match task {
        TaskKind::Summary => {
            #[derive(serde::Deserialize)]
            struct SummaryPayload {
                #[serde(default)]
                summary: String,
                #[serde(default)]
                action_items: Vec<String>,
            }
            let payload: SummaryPayload = serde_json::from_str(&raw)
                .map_err(|err| ParseError::InvalidPayload(format!("decode summary json: {err}")))?;
            if payload.summary.trim().is_empty() {
                return Err(ParseError::InvalidPayload("summary is empty".into()));
            }
            serde_json::to_vec(&json!({
                "summary": payload.summary.trim(),
                "action_items": payload.action_items,
                "prompt_version": prompt_version,
                "model_id": model_id,
            }))
            .map_err(|err| ParseError::InvalidPayload(err.to_string()))
        }
        TaskKind::Report => {
            #[derive(serde::Deserialize)]
            struct Section {
                #[serde(default)]
                heading: String,
                #[serde(default)]
                content: String,
            }
            #[derive(serde::Deserialize)]
            struct ReportPayload {
                #[serde(default)]
                title: String,
                #[serde(default)]
                sections: Vec<Section>,
            }
            let payload: ReportPayload = serde_json::from_str(&raw)
                .map_err(|err| ParseError::InvalidPayload(format!("decode report json: {err}")))?;
            let title = {
                let trimmed = payload.title.trim();
                if trimmed.is_empty() { "Relatorio da conversa" } else { trimmed }
            };
            if payload.sections.is_empty() {
                return Err(ParseError::InvalidPayload("report sections are empty".into()));
            }
            let sections: Vec<serde_json::Value> = payload
                .sections
                .iter()
                .filter(|section| {
                    !section.heading.trim().is_empty() && !section.content.trim().is_empty()
                })
                .map(|section| {
                    json!({"heading": section.heading.trim(), "content": section.content.trim()})
                })
                .collect();
            if sections.is_empty() {
                return Err(ParseError::InvalidPayload("report sections are invalid".into()));
            }
            serde_json::to_vec(&json!({
                "title": title,
                "sections": sections,
                "prompt_version": prompt_version,
                "model_id": model_id,
            }))
            .map_err(|err| ParseError::InvalidPayload(err.to_string()))
        }
        TaskKind::Suggestion => {
            Err(ParseError::InvalidPayload("unsupported task for parse payload".into()))
        }
    }
}

/// Extracts the first balanced JSON object from model output, stripping
/// fenced code blocks and tolerating leading/trailing prose.
fn extract_json(text: &str) -> Result<String, ParseError> {
    let mut trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyOutput);
    }

    if trimmed.starts_with("```") {
        trimmed = strip_code_fence(&trimmed);
    }

    if serde_json::from_str::<serde_json::Value>(&trimmed).is_ok() {
        return Ok(trimmed);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            let candidate = &trimmed[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Ok(candidate.to_string());
            }
        }
    }

    Err(ParseError::NotJson)
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let trimmed = trimmed.strip_prefix("```").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix("json").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim().to_string()
}
