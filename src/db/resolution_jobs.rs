use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{info, instrument};

use super::Store;
use crate::error::{Result, StoreError, WriteContext};
use crate::model::{BatchSpecResolutionJob, ExecutionLogEntry, JobState};
use crate::predicate::{Bind, Predicate};
use crate::worker::{QueueRecord, RESOLUTION_JOB_COLUMNS};

#[derive(Debug, Clone, Default)]
pub struct GetResolutionJobOpts {
    pub id: Option<i64>,
    pub batch_spec_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListResolutionJobsOpts {
    pub state: Option<JobState>,
    pub batch_spec_id: Option<i64>,
}

impl QueueRecord for BatchSpecResolutionJob {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let state: String = row.try_get("state")?;
        let state = JobState::parse_state(&state).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown job state {state:?}").into(),
            ))
        })?;
        let logs: String = row.try_get("execution_logs")?;
        let execution_logs: Vec<ExecutionLogEntry> = serde_json::from_str(&logs)?;
        Ok(BatchSpecResolutionJob {
            id: row.try_get("id")?,
            batch_spec_id: row.try_get("batch_spec_id")?,
            initiator_id: row.try_get("initiator_id")?,
            state,
            failure_message: row.try_get("failure_message")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            process_after: row.try_get("process_after")?,
            num_resets: row.try_get("num_resets")?,
            num_failures: row.try_get("num_failures")?,
            execution_logs,
            worker_hostname: row.try_get("worker_hostname")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            queued_at: row.try_get("queued_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn record_id(&self) -> i64 {
        self.id
    }

    fn job_state(&self) -> JobState {
        self.state
    }

    fn num_resets(&self) -> i64 {
        self.num_resets
    }

    fn num_failures(&self) -> i64 {
        self.num_failures
    }

    fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at
    }
}

fn select_jobs() -> QueryBuilder<'static, Sqlite> {
    QueryBuilder::new(format!(
        "SELECT {} FROM batch_spec_resolution_jobs",
        RESOLUTION_JOB_COLUMNS.join(", ")
    ))
}

impl Store {
    /// Queue a resolution job. A second job for the same batch spec fails
    /// with [`StoreError::DuplicateResolutionJob`].
    #[instrument(skip_all, fields(batch_spec_id = job.batch_spec_id))]
    pub async fn create_batch_spec_resolution_job(
        &self,
        job: &mut BatchSpecResolutionJob,
    ) -> Result<()> {
        let now = self.now();
        if job.created_at == DateTime::<Utc>::default() {
            job.created_at = now;
        }
        job.updated_at = job.created_at;
        job.queued_at = Some(job.queued_at.unwrap_or(now));

        let ctx = WriteContext {
            resolution_job_batch_spec_id: Some(job.batch_spec_id),
        };
        let row = sqlx::query(
            "INSERT INTO batch_spec_resolution_jobs (batch_spec_id, initiator_id, state, \
             execution_logs, queued_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(job.batch_spec_id)
        .bind(job.initiator_id)
        .bind(job.state.as_str())
        .bind(serde_json::to_string(&job.execution_logs)?)
        .bind(job.queued_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, ctx))?;
        job.id = row.try_get("id")?;
        info!(id = job.id, "queued batch spec resolution job");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn get_batch_spec_resolution_job(
        &self,
        opts: &GetResolutionJobOpts,
    ) -> Result<BatchSpecResolutionJob> {
        let mut preds = Vec::new();
        if let Some(id) = opts.id {
            preds.push(Predicate::sql(
                "batch_spec_resolution_jobs.id = ?",
                vec![Bind::Int(id)],
            ));
        }
        if let Some(batch_spec_id) = opts.batch_spec_id {
            preds.push(Predicate::sql(
                "batch_spec_resolution_jobs.batch_spec_id = ?",
                vec![Bind::Int(batch_spec_id)],
            ));
        }
        let mut qb = select_jobs();
        Predicate::and(preds).push_where(&mut qb);
        qb.push(" LIMIT 1");
        let row = qb
            .build()
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::NotFound)?;
        BatchSpecResolutionJob::from_row(&row)
    }

    #[instrument(skip_all)]
    pub async fn list_batch_spec_resolution_jobs(
        &self,
        opts: &ListResolutionJobsOpts,
    ) -> Result<Vec<BatchSpecResolutionJob>> {
        let mut preds = Vec::new();
        if let Some(state) = opts.state {
            preds.push(Predicate::sql(
                "batch_spec_resolution_jobs.state = ?",
                vec![Bind::from(state.as_str())],
            ));
        }
        if let Some(batch_spec_id) = opts.batch_spec_id {
            preds.push(Predicate::sql(
                "batch_spec_resolution_jobs.batch_spec_id = ?",
                vec![Bind::Int(batch_spec_id)],
            ));
        }
        let mut qb = select_jobs();
        Predicate::and(preds).push_where(&mut qb);
        qb.push(" ORDER BY batch_spec_resolution_jobs.id ASC");

        let mut rows = qb.build().fetch(self.pool());
        let mut jobs = Vec::new();
        while let Some(row) = rows.try_next().await? {
            jobs.push(BatchSpecResolutionJob::from_row(&row)?);
        }
        Ok(jobs)
    }
}
