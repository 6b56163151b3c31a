//! PostgreSQL implementation of JobRepository.

use super::{status_to_str, str_to_status, str_to_verdict, verdict_to_str};
use async_trait::async_trait;
use crucible_core::build::{BackendSpec, Job, JobPlan};
use crucible_core::ids::{BuildId, JobId, PlanId, ProjectId};
use crucible_core::ports::JobRepository;
use crucible_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of JobRepository.
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(&self, r: &sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = r.get("status");
        let verdict: String = r.get("verdict");

        Ok(Job {
            id: JobId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            build_id: BuildId::from_uuid(r.get::<uuid::Uuid, _>("build_id")),
            project_id: ProjectId::from_uuid(r.get::<uuid::Uuid, _>("project_id")),
            label: r.get("label"),
            status: str_to_status(&status),
            verdict: str_to_verdict(&verdict),
            date_created: r.get("date_created"),
            date_started: r.get("date_started"),
            date_finished: r.get("date_finished"),
        })
    }

    fn row_to_plan(&self, r: &sqlx::postgres::PgRow) -> Result<JobPlan> {
        let backend: BackendSpec = serde_json::from_value(r.get("backend"))
            .map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(JobPlan {
            id: PlanId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            job_id: JobId::from_uuid(r.get::<uuid::Uuid, _>("job_id")),
            label: r.get("label"),
            backend,
            timeout_minutes: r.get::<i32, _>("timeout_minutes") as u32,
            date_created: r.get("date_created"),
        })
    }
}

const JOB_COLUMNS: &str =
    "id, build_id, project_id, label, status, verdict, date_created, date_started, date_finished";

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: &Job) -> Result<JobId> {
        sqlx::query(
            r#"INSERT INTO jobs (id, build_id, project_id, label, status, verdict, date_created, date_started, date_finished)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(job.id.as_uuid())
        .bind(job.build_id.as_uuid())
        .bind(job.project_id.as_uuid())
        .bind(&job.label)
        .bind(status_to_str(&job.status))
        .bind(verdict_to_str(&job.verdict))
        .bind(job.date_created)
        .bind(job.date_started)
        .bind(job.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_job(&r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = $2, verdict = $3, date_started = $4, date_finished = $5 WHERE id = $1",
        )
        .bind(job.id.as_uuid())
        .bind(status_to_str(&job.status))
        .bind(verdict_to_str(&job.verdict))
        .bind(job.date_started)
        .bind(job.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE build_id = $1 ORDER BY date_created ASC",
            JOB_COLUMNS
        ))
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_job(r)).collect()
    }

    async fn create_plan(&self, plan: &JobPlan) -> Result<PlanId> {
        let backend_json = serde_json::to_value(&plan.backend)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO job_plans (id, job_id, label, backend, timeout_minutes, date_created)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(plan.id.as_uuid())
        .bind(plan.job_id.as_uuid())
        .bind(&plan.label)
        .bind(&backend_json)
        .bind(plan.timeout_minutes as i32)
        .bind(plan.date_created)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(plan.id)
    }

    async fn get_plan(&self, job_id: JobId) -> Result<Option<JobPlan>> {
        let row = sqlx::query(
            "SELECT id, job_id, label, backend, timeout_minutes, date_created FROM job_plans WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_plan(&r)?)),
            None => Ok(None),
        }
    }
}
