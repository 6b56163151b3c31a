//! PostgreSQL implementation of PhaseRepository.

use super::{status_to_str, str_to_status, str_to_verdict, verdict_to_str};
use async_trait::async_trait;
use crucible_core::build::JobPhase;
use crucible_core::ids::{JobId, PhaseId};
use crucible_core::ports::PhaseRepository;
use crucible_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of PhaseRepository.
pub struct PgPhaseRepository {
    pool: PgPool,
}

impl PgPhaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_phase(&self, r: &sqlx::postgres::PgRow) -> Result<JobPhase> {
        let status: String = r.get("status");
        let verdict: String = r.get("verdict");

        Ok(JobPhase {
            id: PhaseId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            job_id: JobId::from_uuid(r.get::<uuid::Uuid, _>("job_id")),
            label: r.get("label"),
            status: str_to_status(&status),
            verdict: str_to_verdict(&verdict),
            date_created: r.get("date_created"),
            date_started: r.get("date_started"),
            date_finished: r.get("date_finished"),
        })
    }
}

const PHASE_COLUMNS: &str =
    "id, job_id, label, status, verdict, date_created, date_started, date_finished";

#[async_trait]
impl PhaseRepository for PgPhaseRepository {
    async fn create_or_get(&self, phase: &JobPhase) -> Result<JobPhase> {
        // Try-create, on conflict re-fetch: concurrent creators of the same
        // (job_id, label) converge on one row.
        sqlx::query(
            r#"INSERT INTO job_phases (id, job_id, label, status, verdict, date_created, date_started, date_finished)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (job_id, label) DO NOTHING"#,
        )
        .bind(phase.id.as_uuid())
        .bind(phase.job_id.as_uuid())
        .bind(&phase.label)
        .bind(status_to_str(&phase.status))
        .bind(verdict_to_str(&phase.verdict))
        .bind(phase.date_created)
        .bind(phase.date_started)
        .bind(phase.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM job_phases WHERE job_id = $1 AND label = $2",
            PHASE_COLUMNS
        ))
        .bind(phase.job_id.as_uuid())
        .bind(&phase.label)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        self.row_to_phase(&row)
    }

    async fn get(&self, id: PhaseId) -> Result<Option<JobPhase>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_phases WHERE id = $1",
            PHASE_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_phase(&r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, phase: &JobPhase) -> Result<()> {
        sqlx::query(
            "UPDATE job_phases SET status = $2, verdict = $3, date_started = $4, date_finished = $5 WHERE id = $1",
        )
        .bind(phase.id.as_uuid())
        .bind(status_to_str(&phase.status))
        .bind(verdict_to_str(&phase.verdict))
        .bind(phase.date_started)
        .bind(phase.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<JobPhase>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_phases WHERE job_id = $1 ORDER BY date_created ASC",
            PHASE_COLUMNS
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_phase(r)).collect()
    }

    async fn count_by_job(&self, job_id: JobId) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM job_phases WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("count") as usize)
    }
}
