//! Quality validation of model output.
//!
//! Normalizes, masks and validates suggestion candidates and structured
//! task payloads, accumulating penalties into a quality score. Output below
//! the score floor is rejected so callers fall back to safe static content.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::services::ai::TaskKind;
use crate::services::policy;

const MIN_SUGGESTION_SCORE: f64 = 0.45;
const MIN_STRUCTURED_SCORE: f64 = 0.50;

const MAX_SUGGESTION_CHARS: usize = 320;
const MAX_RATIONALE_CHARS: usize = 180;
const MAX_SUMMARY_CHARS: usize = 2400;
const MIN_SUMMARY_CHARS: usize = 40;
const MAX_ACTION_ITEM_CHARS: usize = 220;
const MAX_ACTION_ITEMS: usize = 10;
const MAX_TITLE_CHARS: usize = 120;
const MAX_HEADING_CHARS: usize = 90;
const MAX_SECTION_CHARS: usize = 1800;
const MAX_SECTIONS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error("output failed quality checks: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestionCandidate {
    pub rank: i32,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct SuggestionValidation {
    pub suggestions: Vec<SuggestionCandidate>,
    pub score: f64,
    pub corrected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OutputValidator;

impl OutputValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_suggestions(
        &self,
        locale: &str,
        tone: &str,
        suggestions: &[SuggestionCandidate],
    ) -> Result<SuggestionValidation, QualityError> {
        if suggestions.is_empty() {
            return Err(QualityError::Rejected("empty suggestions".into()));
        }

        let locale = locale.trim().to_lowercase();
        let tone = {
            let normalized = tone.trim().to_lowercase();
            if normalized.is_empty() { "neutro".to_string() } else { normalized }
        };

        let mut corrected = false;
        let mut penalty = 0.0;
        let mut seen = std::collections::HashSet::new();
        let mut output: Vec<SuggestionCandidate> = Vec::with_capacity(3);

        for item in suggestions {
            let mut content = normalize_text(&item.content);
            if content.is_empty() {
                corrected = true;
                penalty += 0.20;
                continue;
            }

            let masked = policy::mask_pii(&content);
            if masked != content {
                content = masked;
                corrected = true;
                penalty += 0.05;
            }

            if content.chars().count() > MAX_SUGGESTION_CHARS {
                content = truncate_at_word(&content, MAX_SUGGESTION_CHARS);
                corrected = true;
                penalty += 0.08;
            }
            if !has_terminal_punctuation(&content) {
                content.push('.');
                corrected = true;
            }

            if !seen.insert(content.to_lowercase()) {
                corrected = true;
                penalty += 0.06;
                continue;
            }

            if tone_mismatch(&content, &tone) {
                penalty += 0.07;
            }
            if locale_mismatch(&content, &locale) {
                penalty += 0.07;
            }

            let mut rationale = normalize_text(&item.rationale);
            if rationale.chars().count() > MAX_RATIONALE_CHARS {
                rationale = truncate_at_word(&rationale, MAX_RATIONALE_CHARS);
                corrected = true;
            }

            output.push(SuggestionCandidate {
                rank: output.len() as i32 + 1,
                content,
                rationale,
            });
            if output.len() == 3 {
                break;
            }
        }

        if output.is_empty() {
            return Err(QualityError::Rejected("no valid suggestion candidates".into()));
        }

        let score = clamp01(1.0 - penalty);
        if score < MIN_SUGGESTION_SCORE {
            return Err(QualityError::Rejected(format!(
                "low suggestion quality score {score:.2}"
            )));
        }

        Ok(SuggestionValidation { suggestions: output, score: round2(score), corrected })
    }

    /// Coerces a structured task payload into the contract-stable shape,
    /// returning the canonical JSON plus its quality score.
    pub fn validate_task_payload(
        &self,
        task: TaskKind,
        body: &[u8],
        locale: &str,
        tone: &str,
    ) -> Result<(Vec<u8>, f64), QualityError> {
        match task {
            TaskKind::Summary => self.validate_summary(body, locale),
            TaskKind::Report => self.validate_report(body, locale),
            TaskKind::Suggestion => {
                let _ = tone;
                Err(QualityError::Rejected("unsupported task suggestion".into()))
            }
        }
    }

    fn validate_summary(&self, body: &[u8], locale: &str) -> Result<(Vec<u8>, f64), QualityError> {
        #[derive(Deserialize)]
        struct SummaryPayload {
            #[serde(default)]
            summary: String,
            #[serde(default)]
            action_items: Vec<String>,
            #[serde(default)]
            prompt_version: String,
            #[serde(default)]
            model_id: String,
        }

        let payload: SummaryPayload = serde_json::from_slice(body)
            .map_err(|err| QualityError::Rejected(format!("decode summary payload: {err}")))?;

        let mut penalty = 0.0;
        let mut summary = normalize_text(&policy::mask_pii(&payload.summary));
        if summary.is_empty() {
            return Err(QualityError::Rejected("summary text is empty".into()));
        }
        if summary.chars().count() > MAX_SUMMARY_CHARS {
            summary = truncate_at_word(&summary, MAX_SUMMARY_CHARS);
            penalty += 0.06;
        }
        if summary.chars().count() < MIN_SUMMARY_CHARS {
            penalty += 0.18;
        }
        if locale_mismatch(&summary, &locale.trim().to_lowercase()) {
            penalty += 0.07;
        }

        let mut action_items = Vec::with_capacity(payload.action_items.len());
        let mut seen = std::collections::HashSet::new();
        for item in &payload.action_items {
            let mut normalized = normalize_text(&policy::mask_pii(item));
            if normalized.is_empty() {
                continue;
            }
            if normalized.chars().count() > MAX_ACTION_ITEM_CHARS {
                normalized = truncate_at_word(&normalized, MAX_ACTION_ITEM_CHARS);
                penalty += 0.03;
            }
            if !seen.insert(normalized.to_lowercase()) {
                continue;
            }
            action_items.push(normalized);
            if action_items.len() >= MAX_ACTION_ITEMS {
                break;
            }
        }

        if action_items.is_empty() {
            penalty += 0.10;
        }

        let score = clamp01(1.0 - penalty);
        if score < MIN_STRUCTURED_SCORE {
            return Err(QualityError::Rejected(format!("low summary quality score {score:.2}")));
        }

        let encoded = serde_json::to_vec(&json!({
            "summary": summary,
            "action_items": action_items,
            "prompt_version": payload.prompt_version,
            "model_id": payload.model_id,
            "quality_score": round2(score),
        }))
        .map_err(|err| QualityError::Rejected(format!("encode summary payload: {err}")))?;

        Ok((encoded, round2(score)))
    }

    fn validate_report(&self, body: &[u8], locale: &str) -> Result<(Vec<u8>, f64), QualityError> {
        #[derive(Deserialize)]
        struct ReportSection {
            #[serde(default)]
            heading: String,
            #[serde(default)]
            content: String,
        }
        #[derive(Deserialize)]
        struct ReportPayload {
            #[serde(default)]
            title: String,
            #[serde(default)]
            sections: Vec<ReportSection>,
            #[serde(default)]
            prompt_version: String,
            #[serde(default)]
            model_id: String,
        }

        let payload: ReportPayload = serde_json::from_slice(body)
            .map_err(|err| QualityError::Rejected(format!("decode report payload: {err}")))?;

        let mut penalty = 0.0;
        let mut title = normalize_text(&policy::mask_pii(&payload.title));
        if title.is_empty() {
            title = "Relatorio da conversa".to_string();
            penalty += 0.05;
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            title = truncate_at_word(&title, MAX_TITLE_CHARS);
            penalty += 0.02;
        }

        let normalized_locale = locale.trim().to_lowercase();
        let mut sections = Vec::with_capacity(payload.sections.len());
        for section in &payload.sections {
            let mut heading = normalize_text(&policy::mask_pii(&section.heading));
            let mut content = normalize_text(&policy::mask_pii(&section.content));
            if heading.is_empty() || content.is_empty() {
                continue;
            }
            if heading.chars().count() > MAX_HEADING_CHARS {
                heading = truncate_at_word(&heading, MAX_HEADING_CHARS);
                penalty += 0.02;
            }
            if content.chars().count() > MAX_SECTION_CHARS {
                content = truncate_at_word(&content, MAX_SECTION_CHARS);
                penalty += 0.05;
            }
            if locale_mismatch(&content, &normalized_locale) {
                penalty += 0.05;
            }
            sections.push(json!({"heading": heading, "content": content}));
            if sections.len() >= MAX_SECTIONS {
                break;
            }
        }

        if sections.is_empty() {
            return Err(QualityError::Rejected("report sections are empty".into()));
        }
        if sections.len() < 2 {
            penalty += 0.12;
        }

        let score = clamp01(1.0 - penalty);
        if score < MIN_STRUCTURED_SCORE {
            return Err(QualityError::Rejected(format!("low report quality score {score:.2}")));
        }

        let encoded = serde_json::to_vec(&json!({
            "title": title,
            "sections": sections,
            "prompt_version": payload.prompt_version,
            "model_id": payload.model_id,
            "quality_score": round2(score),
        }))
        .map_err(|err| QualityError::Rejected(format!("encode report payload: {err}")))?;

        Ok((encoded, round2(score)))
    }
}

fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_at_word(value: &str, max_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= max_chars || max_chars == 0 {
        return value.to_string();
    }
    let cut: String = chars[..max_chars].iter().collect();
    match cut.rfind(' ') {
        Some(last_space) if last_space > max_chars / 2 => cut[..last_space].trim_end().to_string(),
        _ => cut.trim_end().to_string(),
    }
}

fn has_terminal_punctuation(value: &str) -> bool {
    matches!(value.chars().last(), Some('.') | Some('!') | Some('?'))
}

const FORMAL_SLANG: &[&str] = &["mano", "vlw", "blz", "cara", "bro"];

fn tone_mismatch(value: &str, tone: &str) -> bool {
    if tone != "formal" {
        return false;
    }
    let lowered = value.to_lowercase();
    FORMAL_SLANG.iter().any(|slang| lowered.contains(slang))
}

const PT_MARKERS: &[&str] = &[" voce ", " obrigado", " por favor", " vamos ", " que ", " com "];
const EN_MARKERS: &[&str] = &[" you ", " thanks", " please", " we ", " with ", " and "];

fn locale_mismatch(value: &str, locale: &str) -> bool {
    if locale.is_empty() {
        return false;
    }
    let lowered = value.to_lowercase();
    if locale.starts_with("pt") {
        has_more_markers(&lowered, EN_MARKERS, PT_MARKERS)
    } else if locale.starts_with("en") {
        has_more_markers(&lowered, PT_MARKERS, EN_MARKERS)
    } else {
        false
    }
}

fn has_more_markers(value: &str, negative: &[&str], positive: &[&str]) -> bool {
    let negative_count = negative.iter().filter(|marker| value.contains(*marker)).count();
    let positive_count = positive.iter().filter(|marker| value.contains(*marker)).count();
    negative_count > positive_count + 1
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(content: &str) -> SuggestionCandidate {
        SuggestionCandidate { rank: 0, content: content.to_string(), rationale: String::new() }
    }

    #[test]
    fn empty_input_is_rejected() {
        let validator = OutputValidator::new();
        assert!(validator.validate_suggestions("pt-BR", "neutro", &[]).is_err());
    }

    #[test]
    fn suggestions_get_terminal_punctuation_and_ranks() {
        let validator = OutputValidator::new();
        let result = validator
            .validate_suggestions(
                "pt-BR",
                "neutro",
                &[candidate("Recebi sua mensagem"), candidate("Vou verificar e te retorno!")],
            )
            .unwrap();

        assert_eq!(result.suggestions.len(), 2);
        for (index, suggestion) in result.suggestions.iter().enumerate() {
            assert_eq!(suggestion.rank, index as i32 + 1);
            let last = suggestion.content.chars().last().unwrap();
            assert!(matches!(last, '.' | '!' | '?'));
            assert!(suggestion.content.chars().count() <= 320);
        }
    }

    #[test]
    fn oversized_suggestions_are_truncated_with_penalty() {
        let validator = OutputValidator::new();
        let long = "palavra ".repeat(80);
        let result =
            validator.validate_suggestions("pt-BR", "neutro", &[candidate(&long)]).unwrap();
        assert!(result.suggestions[0].content.chars().count() <= 321);
        assert!(result.corrected);
        assert!(result.score < 1.0);
    }

    #[test]
    fn duplicate_suggestions_are_dropped() {
        let validator = OutputValidator::new();
        let result = validator
            .validate_suggestions(
                "pt-BR",
                "neutro",
                &[candidate("Ola, tudo bem."), candidate("ola, tudo bem.")],
            )
            .unwrap();
        assert_eq!(result.suggestions.len(), 1);
    }

    #[test]
    fn formal_tone_penalizes_slang() {
        let validator = OutputValidator::new();
        let relaxed = validator
            .validate_suggestions("pt-BR", "formal", &[candidate("Beleza mano, ja te falo.")])
            .unwrap();
        let formal = validator
            .validate_suggestions("pt-BR", "formal", &[candidate("Certo, retornarei em breve.")])
            .unwrap();
        assert!(relaxed.score < formal.score);
    }

    #[test]
    fn pii_in_suggestions_is_masked_with_penalty() {
        let validator = OutputValidator::new();
        let result = validator
            .validate_suggestions(
                "pt-BR",
                "neutro",
                &[candidate("Me chame em joana@example.com quando puder")],
            )
            .unwrap();
        assert!(result.suggestions[0].content.contains("[email_redacted]"));
        assert!(result.corrected);
    }

    #[test]
    fn all_empty_candidates_reject() {
        let validator = OutputValidator::new();
        let err = validator
            .validate_suggestions("pt-BR", "neutro", &[candidate(""), candidate("   ")])
            .unwrap_err();
        assert!(matches!(err, QualityError::Rejected(_)));
    }

    #[test]
    fn summary_payload_is_canonicalized() {
        let validator = OutputValidator::new();
        let body = serde_json::json!({
            "summary": "Cliente pediu revisao do contrato e aguarda retorno com os prazos definidos.",
            "action_items": ["Revisar contrato", "revisar contrato", "Enviar prazos", ""],
            "prompt_version": "summary_v1",
            "model_id": "openai/gpt-4o-mini",
        });
        let (encoded, score) = validator
            .validate_task_payload(TaskKind::Summary, &serde_json::to_vec(&body).unwrap(), "pt-BR", "neutro")
            .unwrap();

        let decoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        let items = decoded["action_items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(decoded["quality_score"].as_f64().unwrap(), score);
        assert!(score >= 0.50);
    }

    #[test]
    fn empty_summary_is_rejected() {
        let validator = OutputValidator::new();
        let body = br#"{"summary":"","action_items":[]}"#;
        assert!(validator
            .validate_task_payload(TaskKind::Summary, body, "pt-BR", "neutro")
            .is_err());
    }

    #[test]
    fn short_summary_without_actions_scores_low() {
        let validator = OutputValidator::new();
        let body = serde_json::json!({"summary": "Resumo curto.", "action_items": []});
        // 0.18 (short) + 0.10 (no actions) keeps it above the floor.
        let (_, score) = validator
            .validate_task_payload(TaskKind::Summary, &serde_json::to_vec(&body).unwrap(), "pt-BR", "neutro")
            .unwrap();
        assert!(score < 0.80);
    }

    #[test]
    fn report_requires_sections_and_caps_them() {
        let validator = OutputValidator::new();
        let empty = serde_json::json!({"title": "Relatorio", "sections": []});
        assert!(validator
            .validate_task_payload(TaskKind::Report, &serde_json::to_vec(&empty).unwrap(), "pt-BR", "neutro")
            .is_err());

        let sections: Vec<serde_json::Value> = (0..12)
            .map(|i| serde_json::json!({"heading": format!("Secao {i}"), "content": format!("Conteudo da secao numero {i} com detalhes.")}))
            .collect();
        let body = serde_json::json!({"title": "Relatorio da conversa", "sections": sections});
        let (encoded, _) = validator
            .validate_task_payload(TaskKind::Report, &serde_json::to_vec(&body).unwrap(), "pt-BR", "neutro")
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["sections"].as_array().unwrap().len(), 8);
    }

    #[test]
    fn report_defaults_missing_title() {
        let validator = OutputValidator::new();
        let body = serde_json::json!({
            "sections": [
                {"heading": "Visao geral", "content": "Conversa revisada sem pendencias."},
                {"heading": "Proximos passos", "content": "Aguardar confirmacao do cliente."}
            ]
        });
        let (encoded, _) = validator
            .validate_task_payload(TaskKind::Report, &serde_json::to_vec(&body).unwrap(), "pt-BR", "neutro")
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["title"], "Relatorio da conversa");
    }

    #[test]
    fn truncate_at_word_respects_char_boundaries() {
        let truncated = truncate_at_word("ação coordenada entre os times de atendimento", 20);
        assert!(truncated.chars().count() <= 20);
        assert!(!truncated.ends_with(' '));
    }
}
