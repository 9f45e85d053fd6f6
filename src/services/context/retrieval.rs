use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct RetrievalInput {
    pub task: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub payload: Vec<u8>,
    pub context_window: i32,
}

/// A retrieved conversation fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("retrieval failed: {0}")]
    Failed(String),
}

/// Source of context fragments. Pluggable so a vector store can replace the
/// lexical walk later without touching the builder.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, input: RetrievalInput) -> Result<Vec<Chunk>, RetrievalError>;
}

const FRAGMENT_MAX_CHARS: usize = 520;

/// Lexical retriever: walks the decoded payload tree and harvests string
/// leaves until a vector store is available.
#[derive(Debug, Default)]
pub struct BasicRetriever;

impl BasicRetriever {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Retriever for BasicRetriever {
    async fn retrieve(&self, input: RetrievalInput) -> Result<Vec<Chunk>, RetrievalError> {
        let mut fragment_limit = derive_fragment_limit(&input.task, input.context_window);
        let mut fragments: Vec<String> = Vec::with_capacity(fragment_limit);

        if !input.payload.is_empty() {
            if let Ok(decoded) = serde_json::from_slice::<Value>(&input.payload) {
                let window_from_payload = read_context_window(&decoded);
                if input.context_window <= 0 && window_from_payload > 0 {
                    fragment_limit = derive_fragment_limit(&input.task, window_from_payload);
                }
                extract_fragments(&decoded, &mut fragments, fragment_limit);
            }
        }

        if fragments.is_empty() {
            fragments.push(
                "Nao ha historico detalhado no payload; use contexto recente da conversa quando disponivel."
                    .to_string(),
            );
        }

        let unique = dedupe_fragments(fragments, fragment_limit);
        let chunks = unique
            .into_iter()
            .enumerate()
            .filter(|(_, fragment)| !fragment.trim().is_empty())
            .map(|(index, fragment)| {
                let text = fragment.trim().to_string();
                let score = compute_score(&input.task, index, &text);
                Chunk { id: format!("chunk-{}", index + 1), text, score }
            })
            .collect();

        Ok(chunks)
    }
}

fn extract_fragments(value: &Value, fragments: &mut Vec<String>, limit: usize) {
    if fragments.len() >= limit {
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if fragments.len() >= limit {
                    return;
                }
                // Interesting keys are reserved for future weighting; the
                // traversal itself is uniform.
                let _ = is_interesting_key(key);
                extract_fragments(nested, fragments, limit);
            }
        }
        Value::Array(items) => {
            for nested in items {
                if fragments.len() >= limit {
                    return;
                }
                extract_fragments(nested, fragments, limit);
            }
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return;
            }
            let clipped: String = trimmed.chars().take(FRAGMENT_MAX_CHARS).collect();
            fragments.push(clipped);
        }
        _ => {}
    }
}

fn is_interesting_key(key: &str) -> bool {
    matches!(
        key.trim().to_lowercase().as_str(),
        "message"
            | "messages"
            | "text"
            | "topic_filter"
            | "summary_type"
            | "report_type"
            | "tone"
            | "locale"
            | "context_window"
    )
}

fn compute_score(task: &str, index: usize, fragment: &str) -> f64 {
    let mut score = 100.0 - (index as f64) * 3.0;
    let normalized = fragment.to_lowercase();

    if normalized.contains("urgente") || normalized.contains("prazo") {
        score += 8.0;
    }
    if normalized.contains('?') {
        score += 6.0;
    }
    if task == "suggestion" {
        score += 4.0;
    }
    if task == "report" && (normalized.contains("tema") || normalized.contains("timeline")) {
        score += 6.0;
    }

    score.max(1.0)
}

fn derive_fragment_limit(task: &str, context_window: i32) -> usize {
    let base_limit = match task.trim().to_lowercase().as_str() {
        "suggestion" => 22,
        "summary" => 30,
        "report" => 42,
        _ => 18,
    };

    if context_window > 0 {
        let scaled = (context_window as usize * 2).clamp(12, 80);
        return scaled.min(base_limit);
    }
    base_limit
}

fn read_context_window(decoded: &Value) -> i32 {
    let Some(value) = decoded.as_object().and_then(|map| map.get("context_window")) else {
        return 0;
    };
    match value {
        Value::Number(number) => number.as_i64().unwrap_or(0) as i32,
        Value::String(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn dedupe_fragments(fragments: Vec<String>, limit: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(fragments.len());
    let mut result = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let trimmed = fragment.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !seen.insert(fragment_fingerprint(trimmed)) {
            continue;
        }
        result.push(trimmed.to_string());
        if result.len() >= limit {
            break;
        }
    }
    result
}

static REPEATED_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Dedup key: lowercase with all whitespace runs collapsed to one space.
pub fn fragment_fingerprint(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    REPEATED_SPACE.replace_all(&lowered, " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(task: &str, payload: serde_json::Value) -> RetrievalInput {
        RetrievalInput {
            task: task.to_string(),
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            payload: serde_json::to_vec(&payload).unwrap(),
            context_window: 20,
        }
    }

    #[tokio::test]
    async fn harvests_string_leaves_and_scores_by_position() {
        let retriever = BasicRetriever::new();
        let chunks = retriever
            .retrieve(input(
                "summary",
                serde_json::json!({"messages": ["primeira mensagem", "segunda mensagem"]}),
            ))
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "chunk-1");
        assert!(chunks[0].score > chunks[1].score);
    }

    #[tokio::test]
    async fn urgency_and_questions_get_bonuses() {
        let retriever = BasicRetriever::new();
        let chunks = retriever
            .retrieve(input(
                "summary",
                serde_json::json!({"messages": ["tudo certo", "urgente: qual o prazo?"]}),
            ))
            .await
            .unwrap();

        // Position penalty (-3) is outweighed by urgency (+8) and "?" (+6).
        assert!(chunks[1].score > chunks[0].score);
    }

    #[tokio::test]
    async fn empty_payload_yields_static_fragment() {
        let retriever = BasicRetriever::new();
        let chunks = retriever
            .retrieve(RetrievalInput { task: "summary".into(), ..RetrievalInput::default() })
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Nao ha historico"));
    }

    #[tokio::test]
    async fn duplicate_fragments_keep_earliest() {
        let retriever = BasicRetriever::new();
        let chunks = retriever
            .retrieve(input(
                "summary",
                serde_json::json!({"messages": ["Mesma   Mensagem", "mesma mensagem", "outra"]}),
            ))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn long_fragments_are_clipped() {
        let retriever = BasicRetriever::new();
        let long = "x".repeat(900);
        let chunks = retriever
            .retrieve(input("summary", serde_json::json!({ "text": long })))
            .await
            .unwrap();
        assert_eq!(chunks[0].text.chars().count(), FRAGMENT_MAX_CHARS);
    }

    #[test]
    fn fragment_limit_scales_with_window() {
        assert_eq!(derive_fragment_limit("report", 0), 42);
        assert_eq!(derive_fragment_limit("report", 10), 20);
        assert_eq!(derive_fragment_limit("suggestion", 4), 12);
        assert_eq!(derive_fragment_limit("summary", 60), 30);
    }

    #[test]
    fn fingerprint_collapses_whitespace() {
        assert_eq!(fragment_fingerprint(" Ola\t mundo \n"), "ola mundo");
    }
}
