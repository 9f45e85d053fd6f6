//! Worker processor: consumes queue messages and advances the job state
//! machine through AI generation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::db::JobsRepository;
use crate::models::job::{JobKind, JobStatus, QueueMessage};
use crate::services::generation::{AiGenerationService, JobGenerationInput};
use crate::services::policy;
use crate::services::queue::{Consumer, HandlerError, MessageHandler};

const CONSUME_RESTART_DELAY: Duration = Duration::from_secs(2);

pub struct Processor {
    repo: Arc<dyn JobsRepository>,
    ai: Arc<AiGenerationService>,
}

impl Processor {
    pub fn new(repo: Arc<dyn JobsRepository>, ai: Arc<AiGenerationService>) -> Self {
        Self { repo, ai }
    }

    /// Consumes until the token is cancelled, restarting the consume loop
    /// after a short sleep on consumer errors.
    pub async fn run(self: Arc<Self>, consumer: Arc<dyn Consumer>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let result = consumer.consume(cancel.clone(), self.clone()).await;
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = result {
                tracing::error!(error = %err, "worker consume loop error");
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CONSUME_RESTART_DELAY) => {}
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Processor {
    async fn handle(&self, message: QueueMessage) -> Result<(), HandlerError> {
        let mut job = self
            .repo
            .get_job(&message.job_id)
            .await
            .map_err(|err| HandlerError(format!("load job {}: {err}", message.job_id)))?;

        job.status = JobStatus::Processing;
        job.attempts = message.attempt + 1;
        job.updated_at = Utc::now();
        self.repo
            .update_job(&job)
            .await
            .map_err(|err| HandlerError(format!("mark processing: {err}")))?;

        let input = JobGenerationInput {
            tenant_id: message.tenant_id.clone(),
            conversation_id: message.conversation_id.clone(),
            // Defaults at this boundary; per-request values only exist on
            // the synchronous path.
            locale: "pt-BR".to_string(),
            tone: "neutro".to_string(),
            payload: message.payload.clone(),
        };

        let output = match job.kind {
            JobKind::Summary => self.ai.generate_summary(input).await,
            JobKind::Report => self.ai.generate_report(input).await,
        };

        if output.body.is_empty() {
            let reason = "generation produced an empty payload".to_string();
            job.status = JobStatus::Failed;
            job.error_message = reason.clone();
            job.updated_at = Utc::now();
            if let Err(err) = self.repo.update_job(&job).await {
                tracing::error!(job_id = %job.id, error = %err, "failed to persist failed status");
            }
            metrics::counter!("jobs_failed_total").increment(1);
            return Err(HandlerError(reason));
        }

        job.status = JobStatus::Done;
        job.error_message = String::new();
        job.result = policy::mask_pii_json(&output.body);
        job.updated_at = Utc::now();
        self.repo
            .update_job(&job)
            .await
            .map_err(|err| HandlerError(format!("mark done: {err}")))?;

        metrics::counter!("jobs_processed_total", "kind" => job.kind.as_str()).increment(1);
        tracing::info!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            model_id = %output.model_id,
            used_fallback = output.used_fallback,
            cache_hit = output.cache_hit,
            "job processed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::db::MemoryJobsRepository;
    use crate::models::job::Job;
    use crate::services::ai::ModelRouter;
    use crate::services::cache::{CacheConfig, SemanticCache};
    use crate::services::context::{BasicRetriever, ContextBuilder};

    fn generation_service() -> Arc<AiGenerationService> {
        Arc::new(AiGenerationService::new(
            ModelRouter::default(),
            None,
            Arc::new(ContextBuilder::new(Arc::new(BasicRetriever::new()))),
            Arc::new(SemanticCache::new(CacheConfig::default())),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("prompts"),
        ))
    }

    fn pending_job(id: &str, kind: JobKind) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            kind,
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            payload: br#"{"messages":["cliente pediu resumo"]}"#.to_vec(),
            status: JobStatus::Pending,
            result: Vec::new(),
            error_message: String::new(),
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn message_for(job: &Job, attempt: i32) -> QueueMessage {
        QueueMessage {
            job_id: job.id.clone(),
            kind: job.kind,
            tenant_id: job.tenant_id.clone(),
            conversation_id: job.conversation_id.clone(),
            payload: job.payload.clone(),
            attempt,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn processes_summary_job_to_done() {
        let repo = Arc::new(MemoryJobsRepository::new());
        let processor = Processor::new(repo.clone(), generation_service());

        let job = pending_job("job-1", JobKind::Summary);
        repo.create_job(&job).await.unwrap();

        processor.handle(message_for(&job, 0)).await.unwrap();

        let done = repo.get_job("job-1").await.unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.attempts, 1);
        assert!(done.error_message.is_empty());
        let decoded: serde_json::Value = serde_json::from_slice(&done.result).unwrap();
        assert!(!decoded["summary"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attempts_track_message_attempt() {
        let repo = Arc::new(MemoryJobsRepository::new());
        let processor = Processor::new(repo.clone(), generation_service());

        let job = pending_job("job-2", JobKind::Report);
        repo.create_job(&job).await.unwrap();

        processor.handle(message_for(&job, 2)).await.unwrap();
        let done = repo.get_job("job-2").await.unwrap();
        assert_eq!(done.attempts, 3);
    }

    #[tokio::test]
    async fn missing_job_surfaces_error_for_queue_retry() {
        let repo = Arc::new(MemoryJobsRepository::new());
        let processor = Processor::new(repo.clone(), generation_service());

        let ghost = pending_job("ghost", JobKind::Summary);
        let err = processor.handle(message_for(&ghost, 0)).await.unwrap_err();
        assert!(err.0.contains("load job"));
    }

    #[tokio::test]
    async fn redelivery_overwrites_result_idempotently() {
        let repo = Arc::new(MemoryJobsRepository::new());
        let processor = Processor::new(repo.clone(), generation_service());

        let job = pending_job("job-3", JobKind::Summary);
        repo.create_job(&job).await.unwrap();

        processor.handle(message_for(&job, 0)).await.unwrap();
        let first = repo.get_job("job-3").await.unwrap();

        processor.handle(message_for(&job, 1)).await.unwrap();
        let second = repo.get_job("job-3").await.unwrap();

        assert_eq!(second.status, JobStatus::Done);
        assert_eq!(second.attempts, 2);
        assert_eq!(first.result, second.result);
    }
}
