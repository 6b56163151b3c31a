//! PostgreSQL implementation of BuildRepository.

use super::{cause_to_str, status_to_str, str_to_cause, str_to_status, str_to_verdict, verdict_to_str};
use async_trait::async_trait;
use crucible_core::build::Build;
use crucible_core::ids::{BuildId, ProjectId};
use crucible_core::ports::BuildRepository;
use crucible_core::{Error, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL implementation of BuildRepository.
pub struct PgBuildRepository {
    pool: PgPool,
}

impl PgBuildRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_build(&self, r: &sqlx::postgres::PgRow) -> Result<Build> {
        let status: String = r.get("status");
        let verdict: String = r.get("verdict");
        let cause: String = r.get("cause");

        Ok(Build {
            id: BuildId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            project_id: ProjectId::from_uuid(r.get::<uuid::Uuid, _>("project_id")),
            number: r.get::<i32, _>("number") as u32,
            label: r.get("label"),
            status: str_to_status(&status),
            verdict: str_to_verdict(&verdict),
            cause: str_to_cause(&cause),
            target: r.get("target"),
            message: r.get("message"),
            date_created: r.get("date_created"),
            date_started: r.get("date_started"),
            date_finished: r.get("date_finished"),
            duration_ms: r.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
        })
    }
}

const BUILD_COLUMNS: &str = "id, project_id, number, label, status, verdict, cause, target, message, date_created, date_started, date_finished, duration_ms";

#[async_trait]
impl BuildRepository for PgBuildRepository {
    async fn create(&self, build: &Build) -> Result<BuildId> {
        sqlx::query(
            r#"INSERT INTO builds (id, project_id, number, label, status, verdict, cause, target, message, date_created, date_started, date_finished, duration_ms)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(build.id.as_uuid())
        .bind(build.project_id.as_uuid())
        .bind(build.number as i32)
        .bind(&build.label)
        .bind(status_to_str(&build.status))
        .bind(verdict_to_str(&build.verdict))
        .bind(cause_to_str(&build.cause))
        .bind(&build.target)
        .bind(&build.message)
        .bind(build.date_created)
        .bind(build.date_started)
        .bind(build.date_finished)
        .bind(build.duration_ms.map(|d| d as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(build.id)
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        let row = sqlx::query(&format!("SELECT {} FROM builds WHERE id = $1", BUILD_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_build(&r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, build: &Build) -> Result<()> {
        sqlx::query(
            "UPDATE builds SET status = $2, verdict = $3, date_started = $4, date_finished = $5, duration_ms = $6 WHERE id = $1",
        )
        .bind(build.id.as_uuid())
        .bind(status_to_str(&build.status))
        .bind(verdict_to_str(&build.verdict))
        .bind(build.date_started)
        .bind(build.date_finished)
        .bind(build.duration_ms.map(|d| d as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn next_build_number(&self, project_id: ProjectId) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(number), 0) + 1 as next_number FROM builds WHERE project_id = $1",
        )
        .bind(project_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i32, _>("next_number") as u32)
    }
}
