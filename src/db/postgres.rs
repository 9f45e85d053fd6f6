//! PostgreSQL jobs repository.
//!
//! Queries are bound at runtime so the crate builds without a live
//! database; payload and result travel as JSONB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::repository::{normalize_filter, report_title, JobsRepository, RepositoryError};
use crate::models::job::{Job, JobKind, JobStatus, ReportListFilter, ReportListItem};

pub struct PostgresJobsRepository {
    pool: PgPool,
}

impl PostgresJobsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn payload_value(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn value_bytes(value: Option<serde_json::Value>) -> Vec<u8> {
    match value {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(value) => serde_json::to_vec(&value).unwrap_or_default(),
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, RepositoryError> {
    let kind_value: String = row.try_get("kind").map_err(RepositoryError::from)?;
    let status_value: String = row.try_get("status").map_err(RepositoryError::from)?;

    Ok(Job {
        id: row.try_get("id").map_err(RepositoryError::from)?,
        kind: JobKind::parse(&kind_value)
            .ok_or_else(|| RepositoryError::Database(format!("invalid kind {kind_value}")))?,
        tenant_id: row.try_get("tenant_id").map_err(RepositoryError::from)?,
        conversation_id: row.try_get("conversation_id").map_err(RepositoryError::from)?,
        payload: value_bytes(row.try_get("payload").map_err(RepositoryError::from)?),
        status: JobStatus::parse(&status_value)
            .ok_or_else(|| RepositoryError::Database(format!("invalid status {status_value}")))?,
        result: value_bytes(row.try_get("result").map_err(RepositoryError::from)?),
        error_message: row.try_get("error_message").map_err(RepositoryError::from)?,
        attempts: row.try_get("attempts").map_err(RepositoryError::from)?,
        created_at: row.try_get("created_at").map_err(RepositoryError::from)?,
        updated_at: row.try_get("updated_at").map_err(RepositoryError::from)?,
    })
}

#[async_trait]
impl JobsRepository for PostgresJobsRepository {
    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, tenant_id, conversation_id, payload,
                status, result, error_message, attempts, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(&job.tenant_id)
        .bind(&job.conversation_id)
        .bind(payload_value(&job.payload))
        .bind(job.status.as_str())
        .bind(payload_value(&job.result))
        .bind(&job.error_message)
        .bind(job.attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(RepositoryError::AlreadyExists(job.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                result = $3,
                error_message = $4,
                attempts = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(payload_value(&job.result))
        .bind(&job.error_message)
        .bind(job.attempts)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, tenant_id, conversation_id, payload, status,
                   result, error_message, attempts, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_reports(
        &self,
        filter: ReportListFilter,
    ) -> Result<(Vec<ReportListItem>, i64), RepositoryError> {
        let filter = normalize_filter(filter);
        let (where_clause, binds) = build_report_filters(&filter);

        let count_sql = format!("SELECT COUNT(*) {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for bind in &binds {
            count_query = apply_bind(count_query, bind);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let list_sql = format!(
            "SELECT id, conversation_id, status, created_at {where_clause} \
             ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            binds.len() + 1,
            binds.len() + 2,
        );
        let mut list_query = sqlx::query(&list_sql);
        for bind in &binds {
            list_query = apply_row_bind(list_query, bind);
        }
        let rows = list_query
            .bind(filter.page_size)
            .bind((filter.page - 1) * filter.page_size)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let status_value: String = row.try_get("status").map_err(RepositoryError::from)?;
            let status = JobStatus::parse(&status_value).ok_or_else(|| {
                RepositoryError::Database(format!("invalid status {status_value}"))
            })?;
            items.push(ReportListItem {
                report_id: row.try_get("id").map_err(RepositoryError::from)?,
                conversation_id: row.try_get("conversation_id").map_err(RepositoryError::from)?,
                status,
                created_at: row.try_get("created_at").map_err(RepositoryError::from)?,
                title: report_title(status),
            });
        }

        Ok((items, total))
    }
}

enum FilterBind {
    Text(String),
    Timestamp(DateTime<Utc>),
}

fn build_report_filters(filter: &ReportListFilter) -> (String, Vec<FilterBind>) {
    let mut clause = String::from("FROM jobs WHERE kind = 'report'");
    let mut binds = Vec::new();

    if !filter.tenant_id.trim().is_empty() {
        binds.push(FilterBind::Text(filter.tenant_id.trim().to_string()));
        clause.push_str(&format!(" AND tenant_id = ${}", binds.len()));
    }
    if let Some(from) = filter.from {
        binds.push(FilterBind::Timestamp(from));
        clause.push_str(&format!(" AND created_at >= ${}", binds.len()));
    }
    if let Some(to) = filter.to {
        binds.push(FilterBind::Timestamp(to));
        clause.push_str(&format!(" AND created_at <= ${}", binds.len()));
    }
    if !filter.topic.trim().is_empty() {
        binds.push(FilterBind::Text(filter.topic.trim().to_string()));
        clause.push_str(&format!(" AND payload::text ILIKE '%' || ${} || '%'", binds.len()));
    }

    (clause, binds)
}

fn apply_bind<'q>(
    query: sqlx::query::QueryScalar<'q, sqlx::Postgres, i64, sqlx::postgres::PgArguments>,
    bind: &'q FilterBind,
) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, i64, sqlx::postgres::PgArguments> {
    match bind {
        FilterBind::Text(value) => query.bind(value.as_str()),
        FilterBind::Timestamp(value) => query.bind(*value),
    }
}

fn apply_row_bind<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    bind: &'q FilterBind,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match bind {
        FilterBind::Text(value) => query.bind(value.as_str()),
        FilterBind::Timestamp(value) => query.bind(*value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_clause_is_built_in_bind_order() {
        let (clause, binds) = build_report_filters(&ReportListFilter {
            tenant_id: "t1".into(),
            topic: "contrato".into(),
            from: Some(Utc::now()),
            ..Default::default()
        });

        assert!(clause.starts_with("FROM jobs WHERE kind = 'report'"));
        assert!(clause.contains("tenant_id = $1"));
        assert!(clause.contains("created_at >= $2"));
        assert!(clause.contains("ILIKE '%' || $3 || '%'"));
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn payload_value_degrades_to_string() {
        assert_eq!(payload_value(b""), serde_json::Value::Null);
        assert_eq!(payload_value(br#"{"a":1}"#), serde_json::json!({"a":1}));
        assert_eq!(payload_value(b"not json"), serde_json::Value::String("not json".into()));
    }

    #[test]
    fn value_bytes_round_trips() {
        assert!(value_bytes(None).is_empty());
        assert!(value_bytes(Some(serde_json::Value::Null)).is_empty());
        assert_eq!(value_bytes(Some(serde_json::json!({"a":1}))), br#"{"a":1}"#.to_vec());
    }
}
