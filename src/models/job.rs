use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of async artifact a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Summary,
    Report,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Summary => "summary",
            JobKind::Report => "report",
        }
    }

    pub fn parse(value: &str) -> Option<JobKind> {
        match value {
            "summary" => Some(JobKind::Summary),
            "report" => Some(JobKind::Report),
            _ => None,
        }
    }
}

/// Status of a job in the async queue.
///
/// Transitions strictly along pending -> processing -> (done | failed);
/// a terminal status only re-enters processing on queue redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// The canonical async unit processed by the worker pipeline.
///
/// `payload` and `result` are opaque JSON bytes; the payload is already
/// PII-masked when the job is created.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub tenant_id: String,
    pub conversation_id: String,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub result: Vec<u8>,
    pub error_message: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transport format sent to queue backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: String,
    pub kind: JobKind,
    pub tenant_id: String,
    pub conversation_id: String,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
    pub attempt: i32,
    pub requested_at: DateTime<Utc>,
}

impl QueueMessage {
    /// Key used by the batching producer to preserve per-conversation order.
    pub fn coalesce_key(&self) -> String {
        format!("{}|{}|{}", self.tenant_id, self.conversation_id, self.kind.as_str())
    }
}

mod payload_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(value.into_bytes())
    }
}

/// Projection returned by the report listing query.
#[derive(Debug, Clone, Serialize)]
pub struct ReportListItem {
    pub report_id: String,
    pub conversation_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub title: String,
}

/// Filter for the report listing query. `page` and `page_size` are
/// normalized by the repository (page >= 1, page_size in [1, 100]).
#[derive(Debug, Clone, Default)]
pub struct ReportListFilter {
    pub tenant_id: String,
    pub page: i64,
    pub page_size: i64,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub topic: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_round_trips_through_str() {
        assert_eq!(JobKind::parse("summary"), Some(JobKind::Summary));
        assert_eq!(JobKind::parse("report"), Some(JobKind::Report));
        assert_eq!(JobKind::parse("unknown"), None);
        assert_eq!(JobKind::Summary.as_str(), "summary");
    }

    #[test]
    fn job_status_serializes_snake_case() {
        let encoded = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(encoded, "\"processing\"");
        assert_eq!(JobStatus::parse("done"), Some(JobStatus::Done));
    }

    #[test]
    fn coalesce_key_joins_tenant_conversation_kind() {
        let message = QueueMessage {
            job_id: "j1".into(),
            kind: JobKind::Report,
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            payload: b"{}".to_vec(),
            attempt: 0,
            requested_at: Utc::now(),
        };
        assert_eq!(message.coalesce_key(), "t1|c1|report");
    }
}
