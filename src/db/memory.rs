//! In-memory jobs repository used for local development and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::repository::{normalize_filter, report_title, JobsRepository, RepositoryError};
use crate::models::job::{Job, JobKind, ReportListFilter, ReportListItem};

#[derive(Default)]
pub struct MemoryJobsRepository {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobsRepository for MemoryJobsRepository {
    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if jobs.contains_key(&job.id) {
            return Err(RepositoryError::AlreadyExists(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !jobs.contains_key(&job.id) {
            return Err(RepositoryError::NotFound);
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, RepositoryError> {
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.get(job_id).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn list_reports(
        &self,
        filter: ReportListFilter,
    ) -> Result<(Vec<ReportListItem>, i64), RepositoryError> {
        let filter = normalize_filter(filter);
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut items: Vec<ReportListItem> = jobs
            .values()
            .filter(|job| job.kind == JobKind::Report)
            .filter(|job| filter.tenant_id.is_empty() || job.tenant_id == filter.tenant_id)
            .filter(|job| filter.from.map(|from| job.created_at >= from).unwrap_or(true))
            .filter(|job| filter.to.map(|to| job.created_at <= to).unwrap_or(true))
            .filter(|job| {
                if filter.topic.is_empty() {
                    return true;
                }
                String::from_utf8_lossy(&job.payload)
                    .to_lowercase()
                    .contains(&filter.topic.to_lowercase())
            })
            .map(|job| ReportListItem {
                report_id: job.id.clone(),
                conversation_id: job.conversation_id.clone(),
                status: job.status,
                created_at: job.created_at,
                title: report_title(job.status),
            })
            .collect();

        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = items.len() as i64;
        let start = ((filter.page - 1) * filter.page_size) as usize;
        if start >= items.len() {
            return Ok((Vec::new(), total));
        }
        let end = (start + filter.page_size as usize).min(items.len());
        Ok((items[start..end].to_vec(), total))
    }
}
