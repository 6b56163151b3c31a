//! PostgreSQL implementations of StepRepository and CommandRepository.

use super::{
    command_type_to_str, status_to_str, str_to_command_type, str_to_status, str_to_verdict,
    verdict_to_str,
};
use async_trait::async_trait;
use crucible_core::build::{Command, JobStep, StepData};
use crucible_core::ids::{CommandId, JobId, NodeId, PhaseId, StepId};
use crucible_core::ports::{CommandRepository, StepRepository};
use crucible_core::{Error, Result};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// PostgreSQL implementation of StepRepository.
pub struct PgStepRepository {
    pool: PgPool,
}

impl PgStepRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_step(&self, r: &sqlx::postgres::PgRow) -> Result<JobStep> {
        let status: String = r.get("status");
        let verdict: String = r.get("verdict");
        let data: StepData = serde_json::from_value(r.get("data"))
            .map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(JobStep {
            id: StepId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            phase_id: PhaseId::from_uuid(r.get::<uuid::Uuid, _>("phase_id")),
            job_id: JobId::from_uuid(r.get::<uuid::Uuid, _>("job_id")),
            label: r.get("label"),
            status: str_to_status(&status),
            verdict: str_to_verdict(&verdict),
            node_id: r.get::<Option<uuid::Uuid>, _>("node_id").map(NodeId::from_uuid),
            cluster: r.get("cluster"),
            data,
            replacement_id: r
                .get::<Option<uuid::Uuid>, _>("replacement_id")
                .map(StepId::from_uuid),
            last_heartbeat: r.get("last_heartbeat"),
            date_created: r.get("date_created"),
            date_started: r.get("date_started"),
            date_finished: r.get("date_finished"),
        })
    }
}

const STEP_COLUMNS: &str = "id, phase_id, job_id, label, status, verdict, node_id, cluster, data, replacement_id, last_heartbeat, date_created, date_started, date_finished";

#[async_trait]
impl StepRepository for PgStepRepository {
    async fn create(&self, step: &JobStep) -> Result<StepId> {
        let data_json =
            serde_json::to_value(&step.data).map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO job_steps (id, phase_id, job_id, label, status, verdict, node_id, cluster, data, replacement_id, last_heartbeat, date_created, date_started, date_finished)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(step.id.as_uuid())
        .bind(step.phase_id.as_uuid())
        .bind(step.job_id.as_uuid())
        .bind(&step.label)
        .bind(status_to_str(&step.status))
        .bind(verdict_to_str(&step.verdict))
        .bind(step.node_id.as_ref().map(|n| *n.as_uuid()))
        .bind(&step.cluster)
        .bind(&data_json)
        .bind(step.replacement_id.as_ref().map(|s| *s.as_uuid()))
        .bind(step.last_heartbeat)
        .bind(step.date_created)
        .bind(step.date_started)
        .bind(step.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(step.id)
    }

    async fn get(&self, id: StepId) -> Result<Option<JobStep>> {
        let row = sqlx::query(&format!("SELECT {} FROM job_steps WHERE id = $1", STEP_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_step(&r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, step: &JobStep) -> Result<()> {
        let data_json =
            serde_json::to_value(&step.data).map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"UPDATE job_steps SET status = $2, verdict = $3, node_id = $4, cluster = $5, data = $6, replacement_id = $7, last_heartbeat = $8, date_started = $9, date_finished = $10
               WHERE id = $1"#,
        )
        .bind(step.id.as_uuid())
        .bind(status_to_str(&step.status))
        .bind(verdict_to_str(&step.verdict))
        .bind(step.node_id.as_ref().map(|n| *n.as_uuid()))
        .bind(&step.cluster)
        .bind(&data_json)
        .bind(step.replacement_id.as_ref().map(|s| *s.as_uuid()))
        .bind(step.last_heartbeat)
        .bind(step.date_started)
        .bind(step.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_by_phase(&self, phase_id: PhaseId) -> Result<Vec<JobStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_steps WHERE phase_id = $1 ORDER BY date_created ASC",
            STEP_COLUMNS
        ))
        .bind(phase_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_step(r)).collect()
    }

    async fn list_by_job(&self, job_id: JobId) -> Result<Vec<JobStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_steps WHERE job_id = $1 ORDER BY date_created ASC",
            STEP_COLUMNS
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_step(r)).collect()
    }

    async fn current_by_phase(&self, phase_id: PhaseId) -> Result<Vec<JobStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_steps WHERE phase_id = $1 AND replacement_id IS NULL ORDER BY date_created ASC",
            STEP_COLUMNS
        ))
        .bind(phase_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_step(r)).collect()
    }
}

/// PostgreSQL implementation of CommandRepository.
pub struct PgCommandRepository {
    pool: PgPool,
}

impl PgCommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_command(&self, r: &sqlx::postgres::PgRow) -> Result<Command> {
        let status: String = r.get("status");
        let command_type: String = r.get("command_type");
        let env: HashMap<String, String> = serde_json::from_value(r.get("env"))
            .map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(Command {
            id: CommandId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            step_id: StepId::from_uuid(r.get::<uuid::Uuid, _>("step_id")),
            order: r.get::<i32, _>("command_order") as u32,
            label: r.get("label"),
            script: r.get("script"),
            command_type: str_to_command_type(&command_type),
            env,
            status: str_to_status(&status),
            return_code: r.get("return_code"),
            date_started: r.get("date_started"),
            date_finished: r.get("date_finished"),
        })
    }
}

const COMMAND_COLUMNS: &str = "id, step_id, command_order, label, script, command_type, env, status, return_code, date_started, date_finished";

#[async_trait]
impl CommandRepository for PgCommandRepository {
    async fn create(&self, command: &Command) -> Result<CommandId> {
        let env_json =
            serde_json::to_value(&command.env).map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO commands (id, step_id, command_order, label, script, command_type, env, status, return_code, date_started, date_finished)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(command.id.as_uuid())
        .bind(command.step_id.as_uuid())
        .bind(command.order as i32)
        .bind(&command.label)
        .bind(&command.script)
        .bind(command_type_to_str(&command.command_type))
        .bind(&env_json)
        .bind(status_to_str(&command.status))
        .bind(command.return_code)
        .bind(command.date_started)
        .bind(command.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(command.id)
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM commands WHERE id = $1",
            COMMAND_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_command(&r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, command: &Command) -> Result<()> {
        sqlx::query(
            "UPDATE commands SET status = $2, return_code = $3, date_started = $4, date_finished = $5 WHERE id = $1",
        )
        .bind(command.id.as_uuid())
        .bind(status_to_str(&command.status))
        .bind(command.return_code)
        .bind(command.date_started)
        .bind(command.date_finished)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<Command>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM commands WHERE step_id = $1 ORDER BY command_order ASC",
            COMMAND_COLUMNS
        ))
        .bind(step_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_command(r)).collect()
    }
}
