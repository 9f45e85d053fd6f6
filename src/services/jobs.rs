//! Jobs service: creates pending jobs, publishes their queue messages and
//! exposes lookup/listing.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::{JobsRepository, RepositoryError};
use crate::models::job::{Job, JobKind, JobStatus, QueueMessage, ReportListFilter, ReportListItem};
use crate::services::policy;
use crate::services::queue::{Producer, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum JobsServiceError {
    #[error("create job: {0}")]
    Create(#[source] RepositoryError),

    #[error("enqueue job: {0}")]
    Enqueue(#[source] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct JobsService {
    repo: Arc<dyn JobsRepository>,
    producer: Arc<dyn Producer>,
}

impl JobsService {
    pub fn new(repo: Arc<dyn JobsRepository>, producer: Arc<dyn Producer>) -> Self {
        Self { repo, producer }
    }

    pub async fn enqueue_summary(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        payload: &[u8],
    ) -> Result<Job, JobsServiceError> {
        self.enqueue(JobKind::Summary, tenant_id, conversation_id, payload).await
    }

    pub async fn enqueue_report(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        payload: &[u8],
    ) -> Result<Job, JobsServiceError> {
        self.enqueue(JobKind::Report, tenant_id, conversation_id, payload).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, RepositoryError> {
        self.repo.get_job(job_id).await
    }

    pub async fn list_reports(
        &self,
        filter: ReportListFilter,
    ) -> Result<(Vec<ReportListItem>, i64), RepositoryError> {
        self.repo.list_reports(filter).await
    }

    async fn enqueue(
        &self,
        kind: JobKind,
        tenant_id: &str,
        conversation_id: &str,
        payload: &[u8],
    ) -> Result<Job, JobsServiceError> {
        let sanitized = policy::mask_pii_json(payload);

        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4().to_string(),
            kind,
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation_id.to_string(),
            payload: sanitized.clone(),
            status: JobStatus::Pending,
            result: Vec::new(),
            error_message: String::new(),
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        self.repo.create_job(&job).await.map_err(JobsServiceError::Create)?;

        let message = QueueMessage {
            job_id: job.id.clone(),
            kind,
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation_id.to_string(),
            payload: sanitized,
            attempt: 0,
            requested_at: now,
        };

        if let Err(err) = self.producer.enqueue(message).await {
            job.status = JobStatus::Failed;
            job.error_message = err.to_string();
            job.updated_at = Utc::now();
            if let Err(update_err) = self.repo.update_job(&job).await {
                tracing::error!(
                    job_id = %job.id,
                    error = %update_err,
                    "failed to mark job as failed after publish error"
                );
            }
            return Err(JobsServiceError::Enqueue(err));
        }

        metrics::counter!("jobs_enqueued_total", "kind" => kind.as_str()).increment(1);
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::db::MemoryJobsRepository;
    use crate::services::queue::LocalQueue;

    struct RejectingProducer;

    #[async_trait]
    impl Producer for RejectingProducer {
        async fn enqueue(&self, _message: QueueMessage) -> Result<(), QueueError> {
            Err(QueueError::Backend("stream unavailable".into()))
        }
    }

    #[tokio::test]
    async fn enqueue_creates_pending_job_with_masked_payload() {
        let repo = Arc::new(MemoryJobsRepository::new());
        let queue = Arc::new(LocalQueue::new(8, 3));
        let service = JobsService::new(repo.clone(), queue);

        let payload = br#"{"messages":["fale com joao@example.com"]}"#;
        let job = service.enqueue_summary("t1", "c1", payload).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.result.is_empty());
        assert!(String::from_utf8_lossy(&job.payload).contains("[email_redacted]"));

        let stored = repo.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.created_at, job.created_at);
    }

    #[tokio::test]
    async fn publish_failure_promotes_job_to_failed() {
        let repo = Arc::new(MemoryJobsRepository::new());
        let service = JobsService::new(repo.clone(), Arc::new(RejectingProducer));

        let err = service.enqueue_report("t1", "c1", b"{}").await.unwrap_err();
        assert!(matches!(err, JobsServiceError::Enqueue(_)));

        // The only job in the repo must be failed with the publish error.
        let (items, total) = repo
            .list_reports(ReportListFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        let job = repo.get_job(&items[0].report_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.contains("stream unavailable"));
    }
}
