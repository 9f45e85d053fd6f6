use async_trait::async_trait;

use crate::models::job::{Job, ReportListFilter, ReportListItem};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("resource not found")]
    NotFound,

    #[error("job {0} already exists")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound,
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

/// Durable `Job` storage. The repository exclusively owns persisted job
/// state; services mutate jobs only through this interface, and every
/// returned job is a defensive copy.
#[async_trait]
pub trait JobsRepository: Send + Sync {
    /// Inserts a new job; duplicates of `job.id` are rejected.
    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Updates status/result/attempts/error/updated_at by primary key.
    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn get_job(&self, job_id: &str) -> Result<Job, RepositoryError>;

    /// Filtered report listing ordered by `created_at` descending,
    /// returning the page plus the total count before pagination.
    async fn list_reports(
        &self,
        filter: ReportListFilter,
    ) -> Result<(Vec<ReportListItem>, i64), RepositoryError>;
}

/// Normalizes paging inputs: page >= 1 (default 1), page_size in [1, 100]
/// (default 20).
pub fn normalize_filter(mut filter: ReportListFilter) -> ReportListFilter {
    if filter.page <= 0 {
        filter.page = 1;
    }
    if filter.page_size <= 0 || filter.page_size > 100 {
        filter.page_size = 20;
    }
    filter
}

pub fn report_title(status: crate::models::job::JobStatus) -> String {
    if status == crate::models::job::JobStatus::Done {
        "Relatorio gerado".to_string()
    } else {
        "Relatorio".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_normalization_clamps_paging() {
        let filter = normalize_filter(ReportListFilter { page: 0, page_size: 0, ..Default::default() });
        assert_eq!(filter.page, 1);
        assert_eq!(filter.page_size, 20);

        let filter = normalize_filter(ReportListFilter { page: -3, page_size: 500, ..Default::default() });
        assert_eq!(filter.page, 1);
        assert_eq!(filter.page_size, 20);

        let filter = normalize_filter(ReportListFilter { page: 4, page_size: 100, ..Default::default() });
        assert_eq!(filter.page, 4);
        assert_eq!(filter.page_size, 100);
    }
}
