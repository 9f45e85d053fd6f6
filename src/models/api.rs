use garde::Validate;
use serde::{Deserialize, Serialize};

/// Conversation reference carried by every request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConversationRef {
    #[garde(length(min = 1, max = 64))]
    pub tenant_id: String,

    #[garde(length(min = 1, max = 128))]
    pub conversation_id: String,

    /// Only the WhatsApp Web channel is supported; empty defaults to it.
    #[garde(skip)]
    #[serde(default)]
    pub channel: String,
}

impl ConversationRef {
    /// Validates the reference, defaulting and then pinning the channel.
    pub fn normalize(&mut self) -> Result<(), &'static str> {
        self.tenant_id = self.tenant_id.trim().to_string();
        self.conversation_id = self.conversation_id.trim().to_string();
        if self.validate().is_err() {
            return Err("conversation fields are required");
        }
        if self.channel.is_empty() {
            self.channel = "whatsapp_web".to_string();
        }
        if self.channel != "whatsapp_web" {
            return Err("channel must be whatsapp_web");
        }
        Ok(())
    }
}

/// POST /v1/suggestions request body.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SuggestionRequest {
    #[garde(dive)]
    pub conversation: ConversationRef,

    #[garde(length(min = 1, max = 16))]
    pub locale: String,

    #[garde(skip)]
    pub tone: String,

    #[garde(range(min = 5, max = 80))]
    pub context_window: i32,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<i32>,

    #[garde(skip)]
    #[serde(default)]
    pub include_last_user_message: bool,
}

/// POST /v1/summaries request body.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SummaryRequest {
    #[garde(dive)]
    pub conversation: ConversationRef,

    #[garde(skip)]
    #[serde(default)]
    pub summary_type: String,

    #[garde(skip)]
    #[serde(default)]
    pub include_actions: bool,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// POST /v1/reports request body.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReportRequest {
    #[garde(dive)]
    pub conversation: ConversationRef,

    #[garde(skip)]
    #[serde(default)]
    pub report_type: String,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_filter: Option<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Query parameters for GET /v1/reports.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReportListQuery {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> ConversationRef {
        ConversationRef {
            tenant_id: "tenant-1".into(),
            conversation_id: "conv-1".into(),
            channel: String::new(),
        }
    }

    #[test]
    fn normalize_defaults_channel() {
        let mut reference = conversation();
        reference.normalize().unwrap();
        assert_eq!(reference.channel, "whatsapp_web");
    }

    #[test]
    fn normalize_rejects_foreign_channel() {
        let mut reference = conversation();
        reference.channel = "telegram".into();
        assert!(reference.normalize().is_err());
    }

    #[test]
    fn normalize_rejects_oversized_tenant() {
        let mut reference = conversation();
        reference.tenant_id = "t".repeat(65);
        assert!(reference.normalize().is_err());
    }

    #[test]
    fn suggestion_request_bounds_context_window() {
        let request = SuggestionRequest {
            conversation: conversation(),
            locale: "pt-BR".into(),
            tone: "neutro".into(),
            context_window: 81,
            messages: Vec::new(),
            max_candidates: None,
            include_last_user_message: false,
        };
        assert!(request.validate().is_err());
    }
}
