//! Policy screening: PII masking, manual-only enforcement and content rules.
//!
//! Masking is idempotent: running it over already-masked content leaves the
//! content unchanged, so payloads can be re-screened at every boundary.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b").unwrap()
});

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d()\-\s.]{7,}\d").unwrap());

static CPF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}\.?\d{3}\.?\d{3}-?\d{2}\b").unwrap());

static CNPJ_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}\b").unwrap());

static CARD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").unwrap());

/// Masks PII in a single string: email, phone, CPF, CNPJ and card numbers,
/// in that order.
pub fn mask_pii(value: &str) -> String {
    let masked = EMAIL_PATTERN.replace_all(value, "[email_redacted]");
    let masked = PHONE_PATTERN.replace_all(&masked, "[phone_redacted]");
    let masked = CPF_PATTERN.replace_all(&masked, "***.***.***-**");
    let masked = CNPJ_PATTERN.replace_all(&masked, "**.***.***/****-**");
    let masked = CARD_PATTERN.replace_all(&masked, |caps: &regex::Captures| {
        mask_card_number(&caps[0])
    });
    masked.into_owned()
}

/// Masks every string leaf of a JSON document. Unparseable input is masked
/// as a raw string; blank input is returned as-is.
pub fn mask_pii_json(payload: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(payload);
    if text.trim().is_empty() {
        return payload.to_vec();
    }

    let decoded: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return mask_pii(&text).into_bytes(),
    };

    let sanitized = mask_value(decoded);
    serde_json::to_vec(&sanitized).unwrap_or_else(|_| payload.to_vec())
}

fn mask_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter().map(|(key, child)| (key, mask_value(child))).collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(mask_value).collect()),
        Value::String(text) => Value::String(mask_pii(&text)),
        other => other,
    }
}

fn mask_card_number(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return "[card_redacted]".to_string();
    }
    let last4: String = digits[digits.len() - 4..].iter().collect();
    format!("**** **** **** {last4}")
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("automatic send is not allowed")]
    AutoSendNotAllowed,

    #[error("content policy violation: {}", .0.first().map(|v| v.message.as_str()).unwrap_or("blocked"))]
    ContentViolation(Vec<Violation>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

/// HITL metadata attached to every reply-producing response.
#[derive(Debug, Clone, Serialize)]
pub struct HitlMetadata {
    pub required: bool,
    pub allowed_actions: Vec<&'static str>,
    pub prohibited_actions: Vec<&'static str>,
    pub reason: &'static str,
}

pub fn default_hitl_metadata() -> HitlMetadata {
    HitlMetadata {
        required: true,
        allowed_actions: vec!["copy", "insert", "manual_review"],
        prohibited_actions: vec!["auto_send", "send_now", "send_without_confirmation"],
        reason: "manual confirmation is mandatory before sending any message",
    }
}

/// Rejects action strings that imply sending without a human in the loop.
pub fn ensure_manual_action(action: &str) -> Result<(), PolicyError> {
    let normalized = action.trim().to_lowercase();
    match normalized.as_str() {
        "" | "copy" | "insert" | "manual_review" | "suggest" => return Ok(()),
        _ => {}
    }
    if normalized.contains("send") || normalized.contains("auto") {
        return Err(PolicyError::AutoSendNotAllowed);
    }
    Ok(())
}

/// Rejects payloads carrying any auto-send intent, recursively.
pub fn validate_manual_only(payload: &[u8]) -> Result<(), PolicyError> {
    let text = String::from_utf8_lossy(payload);
    if text.trim().is_empty() {
        return Ok(());
    }

    // Only structured payloads are inspected.
    let decoded: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };

    if has_auto_send_flag(&decoded) {
        return Err(PolicyError::AutoSendNotAllowed);
    }
    Ok(())
}

fn has_auto_send_flag(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            for (raw_key, child) in map {
                let key = raw_key.trim().to_lowercase();
                match key.as_str() {
                    "auto_send" | "autosend" | "send_automatically" | "send_immediately"
                    | "send_now" => {
                        if as_bool(child) {
                            return true;
                        }
                    }
                    "delivery_mode" | "execution_mode" | "mode" | "action" => {
                        if is_automatic_mode(child) {
                            return true;
                        }
                    }
                    _ => {}
                }
                if has_auto_send_flag(child) {
                    return true;
                }
            }
            false
        }
        Value::Array(items) => items.iter().any(has_auto_send_flag),
        _ => false,
    }
}

fn as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => matches!(
            text.trim().to_lowercase().as_str(),
            "true" | "1" | "yes" | "y" | "on"
        ),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn is_automatic_mode(value: &Value) -> bool {
    match value {
        Value::String(text) => matches!(
            text.trim().to_lowercase().as_str(),
            "auto" | "automatic" | "autosend" | "send_now" | "send_immediately"
                | "without_confirmation"
        ),
        Value::Object(_) | Value::Array(_) => has_auto_send_flag(value),
        _ => false,
    }
}

const MAX_FIELD_CHARS: usize = 4000;

const BLOCKED_KEYWORDS: &[&str] = &[
    "auto send",
    "automatic send",
    "envio automatico",
    "disparo em massa",
    "bulk messaging",
    "mass spam",
    "phishing",
    "ransomware",
    "malware",
    "golpe",
    "fraude",
];

/// Returns an error carrying the violation list when the payload breaks a
/// content rule.
pub fn enforce_content_policy(payload: &[u8]) -> Result<(), PolicyError> {
    let evaluation = evaluate_content_policy(payload);
    if evaluation.allowed {
        return Ok(());
    }
    Err(PolicyError::ContentViolation(evaluation.violations))
}

pub fn evaluate_content_policy(payload: &[u8]) -> Evaluation {
    let text = String::from_utf8_lossy(payload);
    if text.trim().is_empty() {
        return Evaluation { allowed: true, violations: Vec::new() };
    }

    let decoded: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return Evaluation { allowed: true, violations: Vec::new() },
    };

    let mut values = Vec::new();
    collect_string_values(&decoded, &mut values);
    if values.is_empty() {
        return Evaluation { allowed: true, violations: Vec::new() };
    }

    let mut violations = Vec::new();
    if values.iter().any(|value| value.chars().count() > MAX_FIELD_CHARS) {
        violations.push(Violation {
            code: "payload_too_large".to_string(),
            message: "one or more text fields exceed policy size limits".to_string(),
        });
    }

    let content = values.join("\n").to_lowercase();
    if BLOCKED_KEYWORDS.iter().any(|keyword| content.contains(keyword)) {
        violations.push(Violation {
            code: "blocked_operation".to_string(),
            message: "request contains operation blocked by policy".to_string(),
        });
    }

    if violations.is_empty() {
        Evaluation { allowed: true, violations }
    } else {
        Evaluation { allowed: false, violations: dedupe_violations(violations) }
    }
}

fn collect_string_values(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for child in map.values() {
                collect_string_values(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_string_values(child, out);
            }
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
        _ => {}
    }
}

fn dedupe_violations(violations: Vec<Violation>) -> Vec<Violation> {
    let mut seen = std::collections::HashSet::new();
    violations
        .into_iter()
        .filter(|violation| seen.insert(format!("{}|{}", violation.code, violation.message)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_email_phone_and_documents() {
        let masked = mask_pii("fale com ana.silva@example.com ou +55 (11) 98765-4321");
        assert!(masked.contains("[email_redacted]"));
        assert!(masked.contains("[phone_redacted]"));
        assert!(!masked.contains("ana.silva"));

        let masked = mask_pii("cpf 123.456.789-09 e cnpj 12.345.678/0001-95");
        assert!(!masked.contains("123.456.789-09"));
        assert!(!masked.contains("12.345.678/0001-95"));
    }

    #[test]
    fn masks_card_numbers() {
        let masked = mask_pii("cartao 4111 1111 1111 1234");
        assert!(!masked.contains("4111 1111 1111 1234"), "got: {masked}");
    }

    #[test]
    fn card_rule_keeps_last_four_digits() {
        assert_eq!(mask_card_number("4111 1111 1111 1234"), "**** **** **** 1234");
        assert_eq!(mask_card_number("1234567"), "[card_redacted]");
    }

    #[test]
    fn mask_json_is_idempotent() {
        let payload = br#"{"contact":"joao@example.com","nested":{"phone":"+5511987654321"}}"#;
        let once = mask_pii_json(payload);
        let twice = mask_pii_json(&once);
        assert_eq!(once, twice);
        assert!(!String::from_utf8_lossy(&once).contains("joao@example.com"));
    }

    #[test]
    fn mask_json_falls_back_to_raw_string() {
        let masked = mask_pii_json(b"contato: maria@example.com");
        assert_eq!(String::from_utf8_lossy(&masked), "contato: [email_redacted]");
    }

    #[test]
    fn manual_only_rejects_truthy_flags() {
        let payload = br#"{"options":{"auto_send":true}}"#;
        assert!(matches!(
            validate_manual_only(payload),
            Err(PolicyError::AutoSendNotAllowed)
        ));

        let payload = br#"{"delivery_mode":"send_now"}"#;
        assert!(validate_manual_only(payload).is_err());

        let payload = br#"{"auto_send":false,"mode":"manual"}"#;
        assert!(validate_manual_only(payload).is_ok());
    }

    #[test]
    fn manual_action_guard() {
        assert!(ensure_manual_action("copy").is_ok());
        assert!(ensure_manual_action("").is_ok());
        assert!(ensure_manual_action("auto_send").is_err());
        assert!(ensure_manual_action("send_without_confirmation").is_err());
    }

    #[test]
    fn content_policy_blocks_keywords_and_oversized_fields() {
        let payload = br#"{"messages":["precisamos de um disparo em massa hoje"]}"#;
        let evaluation = evaluate_content_policy(payload);
        assert!(!evaluation.allowed);
        assert_eq!(evaluation.violations[0].code, "blocked_operation");

        let oversized = serde_json::json!({ "text": "x".repeat(4001) });
        let evaluation = evaluate_content_policy(&serde_json::to_vec(&oversized).unwrap());
        assert!(!evaluation.allowed);
        assert_eq!(evaluation.violations[0].code, "payload_too_large");

        assert!(evaluate_content_policy(br#"{"messages":["ola, tudo bem?"]}"#).allowed);
    }

    #[test]
    fn content_policy_dedupes_violations() {
        let payload = br#"{"a":"phishing","b":"malware"}"#;
        let evaluation = evaluate_content_policy(payload);
        assert_eq!(evaluation.violations.len(), 1);
    }

    #[test]
    fn hitl_metadata_is_manual_only() {
        let hitl = default_hitl_metadata();
        assert!(hitl.required);
        assert!(hitl.allowed_actions.contains(&"copy"));
        assert!(hitl.prohibited_actions.contains(&"auto_send"));
    }
}
