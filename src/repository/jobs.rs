//! Job run bookkeeping

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::job::{JobKind, JobRun, JobRunStatus},
};

#[derive(Clone)]
pub struct JobRunsRepository {
    pool: Pool<Postgres>,
}

impl JobRunsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn last_completed_slot(&self, job: JobKind) -> AppResult<Option<DateTime<Utc>>> {
        let slot: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(slot) FROM job_runs WHERE job = $1 AND status = $2",
        )
        .bind(job.as_str())
        .bind(JobRunStatus::Succeeded.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(slot)
    }

    pub async fn insert(&self, run: &JobRun) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job, slot, started_at, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.id)
        .bind(run.job.as_str())
        .bind(run.slot)
        .bind(run.started_at)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish(&self, run: &JobRun) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, finished_at = $3, processed = $4, updated = $5, failed = $6
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.report.processed as i64)
        .bind(run.report.updated as i64)
        .bind(run.report.failed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
