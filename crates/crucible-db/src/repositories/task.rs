//! PostgreSQL implementations of TaskRepository and FailureReasonRepository.

use super::{
    reason_to_str, status_to_str, str_to_reason, str_to_status, str_to_task_name, str_to_verdict,
    verdict_to_str,
};
use async_trait::async_trait;
use crucible_core::build::FailureReason;
use crucible_core::ids::{BuildId, JobId, ProjectId, StepId, TaskId};
use crucible_core::ports::{FailureReasonRepository, TaskRepository};
use crucible_core::task::{Task, TaskName};
use crucible_core::{Error, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL implementation of TaskRepository.
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(&self, r: &sqlx::postgres::PgRow) -> Result<Task> {
        let name: String = r.get("name");
        let status: String = r.get("status");
        let verdict: String = r.get("verdict");
        let name = str_to_task_name(&name)
            .ok_or_else(|| Error::Database(format!("unknown task name: {}", name)))?;

        Ok(Task {
            id: TaskId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            name,
            parent_id: r.get("parent_id"),
            child_id: r.get("child_id"),
            status: str_to_status(&status),
            verdict: str_to_verdict(&verdict),
            num_retries: r.get::<i32, _>("num_retries") as u32,
            data: r.get("data"),
            date_created: r.get("date_created"),
            date_modified: r.get("date_modified"),
        })
    }
}

const TASK_COLUMNS: &str =
    "id, name, parent_id, child_id, status, verdict, num_retries, data, date_created, date_modified";

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn submit(&self, task: &Task) -> Result<bool> {
        // The unique (name, parent_id, child_id) constraint makes the second
        // writer a silent no-op.
        let result = sqlx::query(
            r#"INSERT INTO tasks (id, name, parent_id, child_id, status, verdict, num_retries, data, date_created, date_modified)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (name, parent_id, child_id) DO NOTHING"#,
        )
        .bind(task.id.as_uuid())
        .bind(task.name.as_str())
        .bind(task.parent_id)
        .bind(task.child_id)
        .bind(status_to_str(&task.status))
        .bind(verdict_to_str(&task.verdict))
        .bind(task.num_retries as i32)
        .bind(&task.data)
        .bind(task.date_created)
        .bind(task.date_modified)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, name: TaskName, parent_id: Uuid, child_id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE name = $1 AND parent_id = $2 AND child_id = $3",
            TASK_COLUMNS
        ))
        .bind(name.as_str())
        .bind(parent_id)
        .bind(child_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_task(&r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = $2, verdict = $3, num_retries = $4, data = $5, date_modified = $6 WHERE id = $1",
        )
        .bind(task.id.as_uuid())
        .bind(status_to_str(&task.status))
        .bind(verdict_to_str(&task.verdict))
        .bind(task.num_retries as i32)
        .bind(&task.data)
        .bind(task.date_modified)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_children(&self, name: TaskName, parent_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE name = $1 AND parent_id = $2 ORDER BY date_created ASC",
            TASK_COLUMNS
        ))
        .bind(name.as_str())
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_task(r)).collect()
    }
}

/// PostgreSQL implementation of FailureReasonRepository.
pub struct PgFailureReasonRepository {
    pool: PgPool,
}

impl PgFailureReasonRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_reason(&self, r: &sqlx::postgres::PgRow) -> Result<FailureReason> {
        let reason: String = r.get("reason");

        Ok(FailureReason {
            step_id: r.get::<Option<uuid::Uuid>, _>("step_id").map(StepId::from_uuid),
            job_id: JobId::from_uuid(r.get::<uuid::Uuid, _>("job_id")),
            build_id: BuildId::from_uuid(r.get::<uuid::Uuid, _>("build_id")),
            project_id: ProjectId::from_uuid(r.get::<uuid::Uuid, _>("project_id")),
            reason: str_to_reason(&reason),
            date_created: r.get("date_created"),
        })
    }
}

const REASON_COLUMNS: &str = "step_id, job_id, build_id, project_id, reason, date_created";

#[async_trait]
impl FailureReasonRepository for PgFailureReasonRepository {
    async fn record(&self, reason: &FailureReason) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO failure_reasons (step_id, job_id, build_id, project_id, reason, date_created)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(reason.step_id.as_ref().map(|s| *s.as_uuid()))
        .bind(reason.job_id.as_uuid())
        .bind(reason.build_id.as_uuid())
        .bind(reason.project_id.as_uuid())
        .bind(reason_to_str(&reason.reason))
        .bind(reason.date_created)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<FailureReason>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM failure_reasons WHERE step_id = $1 ORDER BY date_created ASC",
            REASON_COLUMNS
        ))
        .bind(step_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_reason(r)).collect()
    }

    async fn list_by_build(&self, build_id: BuildId) -> Result<Vec<FailureReason>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM failure_reasons WHERE build_id = $1 ORDER BY date_created ASC",
            REASON_COLUMNS
        ))
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_reason(r)).collect()
    }
}
